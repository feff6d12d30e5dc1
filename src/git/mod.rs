//! Git operations module
//!
//! Provides git repository detection used for default session grouping.

mod repository;

pub use repository::*;
