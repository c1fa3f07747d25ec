//! Command implementations for the CLI
//!
//! This module contains the implementation of all CLI commands:
//! - start: Start the ingestion server
//! - replay: Process recorded batches offline
//! - config: Configuration display and validation

pub mod config;
pub mod replay;
pub mod start;
