//! Shared helpers that are not specific to a single pipeline stage.

pub mod duration;
pub mod fs;
