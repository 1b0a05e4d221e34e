//! Gantry Core
//!
//! Core domain types, traits, and error handling for the Gantry workflow
//! engine. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod agent;
pub mod cache;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod ports;
pub mod run;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
