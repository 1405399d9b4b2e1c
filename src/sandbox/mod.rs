//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod container;
pub mod executor;
pub mod filter;
pub mod io;
pub mod limits;
pub mod outcome;
pub mod restricted;
