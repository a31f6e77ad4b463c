//! Task module
//!
//! This module contains task-related types and the tracker interface.

mod file_store;
mod model;
mod tracker;

pub use file_store::FileTaskTracker;
pub use model::*;
pub use tracker::TaskTracker;
