//! Shared types for the OpenBCI dual-board bridge
//!
//! This crate contains the data types passed between the acquisition sessions and the
//! stream publishers: sample batches, channel descriptions and the process-local clock
//! used to timestamp samples.

pub mod clock;
pub mod data;

// Re-export commonly used types
pub use clock::*;
pub use data::*;
