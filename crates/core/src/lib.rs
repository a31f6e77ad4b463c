//! Core library for Agent Swarm
//!
//! This crate contains the shared domain types:
//! - Task model
//! - Task tracker interface and a JSON file-backed tracker

pub mod error;
pub mod task;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
