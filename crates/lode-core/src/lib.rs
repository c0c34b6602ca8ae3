//! # lode-core
//! Foundation types and the backing-view trait for the Lode coin engine.

pub mod constants;
pub mod error;
pub mod types;
pub mod view;
