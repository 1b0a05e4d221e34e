//! Tar archives of workspace paths, used as cache payloads.

use gantry_core::{Error, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Compression applied to the tar stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
}

fn cache_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Cache(format!("{}: {}", context, e))
}

/// Pack `paths` (relative to `base_dir`) into a tar stream written to `writer`.
///
/// Missing paths are skipped.
pub fn create_archive<W: Write>(
    writer: W,
    paths: &[PathBuf],
    base_dir: &Path,
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, 3)
                .map_err(|e| cache_err("zstd init failed", e))?;
            append_paths(&mut encoder, paths, base_dir)?;
            encoder
                .finish()
                .map_err(|e| cache_err("zstd finish failed", e))?;
        }
        CompressionType::None => {
            let mut writer = writer;
            append_paths(&mut writer, paths, base_dir)?;
        }
    }
    Ok(())
}

fn append_paths<W: Write>(writer: W, paths: &[PathBuf], base_dir: &Path) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    for p in paths {
        let abs_path = if p.is_absolute() {
            p.clone()
        } else {
            base_dir.join(p)
        };
        if !abs_path.exists() {
            continue;
        }
        let name = if p.is_absolute() {
            p.strip_prefix(base_dir).unwrap_or(p)
        } else {
            p.as_path()
        };

        if abs_path.is_dir() {
            builder
                .append_dir_all(name, &abs_path)
                .map_err(|e| cache_err("failed to pack dir", e))?;
        } else {
            builder
                .append_path_with_name(&abs_path, name)
                .map_err(|e| cache_err("failed to pack file", e))?;
        }
    }
    builder
        .finish()
        .map_err(|e| cache_err("failed to finish tar", e))
}

/// Extract an archive to a destination.
pub fn extract_archive<R: Read>(reader: R, dest: &Path, compression: CompressionType) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| cache_err("failed to create decoder", e))?;
            tar::Archive::new(decoder)
                .unpack(dest)
                .map_err(|e| cache_err("failed to unpack archive", e))?;
        }
        CompressionType::None => {
            tar::Archive::new(reader)
                .unpack(dest)
                .map_err(|e| cache_err("failed to unpack archive", e))?;
        }
    }
    Ok(())
}

/// Pack paths into an in-memory zstd tarball.
pub fn pack(paths: &[PathBuf], base_dir: &Path) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    create_archive(&mut buffer, paths, base_dir, CompressionType::Zstd)?;
    Ok(buffer)
}

/// Unpack an in-memory zstd tarball into `dest`.
pub fn unpack(payload: &[u8], dest: &Path) -> Result<()> {
    extract_archive(payload, dest, CompressionType::Zstd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack_directory() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("target/debug")).unwrap();
        std::fs::write(src.path().join("target/debug/app"), b"binary").unwrap();

        let payload = pack(&[PathBuf::from("target"), PathBuf::from("missing")], src.path())
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&payload, dest.path()).unwrap();

        let restored = std::fs::read(dest.path().join("target/debug/app")).unwrap();
        assert_eq!(restored, b"binary");
        assert!(!dest.path().join("missing").exists());
    }
}
