//! querytalk - conversational text-to-SQL.
//!
//! This library exposes the core modules for the binary and for integration
//! tests.

pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod persistence;
pub mod retrieval;
pub mod safety;
pub mod workflow;
