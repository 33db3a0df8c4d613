//! Outer surfaces driving the application layer.

pub mod csv;
pub mod replay;
