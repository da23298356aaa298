//! Transcriptforge - resumable transcript and content extraction pipeline
//!
//! This library crate exposes the pipeline components to the binary and to
//! integration tests.

pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod locator;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod verify;
