//! devplace-core: Core types for the devplace device placement engine
//!
//! This crate provides the records shared by the accountant, the allocator
//! and the tooling around them:
//! - Node device inventory and device attributes
//! - Device requests, constraints and affinities
//! - Allocations and their assigned device instances
//! - Configuration
//! - Error handling

pub mod config;
pub mod device;
pub mod error;

pub use config::*;
pub use device::*;
pub use error::*;
