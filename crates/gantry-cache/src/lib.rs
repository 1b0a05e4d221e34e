//! Content-addressed cache for Gantry.
//!
//! Keys are derived from job inputs, payloads are zstd-compressed tarballs of
//! workspace paths, and stores implement [`gantry_core::ports::CacheStore`].

pub mod archiver;
pub mod keys;
pub mod store;

pub use archiver::{CompressionType, create_archive, extract_archive};
pub use keys::{KeyInputs, compute_key, sanitize_key};
pub use store::{FilesystemCacheStore, MemoryCacheStore};
