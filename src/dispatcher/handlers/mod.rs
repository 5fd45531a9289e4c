//! Handlers, one type per command kind

pub mod compute;
pub mod ddo;
pub mod misc;
pub mod node;
