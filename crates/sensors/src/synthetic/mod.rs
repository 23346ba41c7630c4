//! Synthetic board: EEG-like data generated in software, no hardware needed.

pub mod driver;
pub mod generator;
