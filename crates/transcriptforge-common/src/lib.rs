//! Transcriptforge-Common: Shared types, keys, and utilities.
//!
//! This crate provides common functionality used across transcriptforge:
//!
//! - **Typed keys**: Collection names, unit keys and session IDs
//! - **Core Types**: The per-unit phase ladder, unit states and artifact kinds
//! - **Path Utilities**: Functions to classify artifact files by extension
//! - **Error Handling**: The pipeline error taxonomy and result alias
//!
//! # Examples
//!
//! ```
//! use transcriptforge_common::{CollectionName, Phase, UnitKey, Error, Result};
//! use transcriptforge_common::paths::is_audio_file;
//! use std::path::Path;
//!
//! let key = UnitKey::new(CollectionName::new("demo"), 7);
//! assert_eq!(key.to_string(), "demo#007");
//!
//! assert!(Phase::Transcribed > Phase::AudioAcquired);
//! assert!(is_audio_file(Path::new("007_Lesson.mp3")));
//!
//! fn example() -> Result<()> {
//!     Err(Error::content_absent("no subtitles in any language"))
//! }
//! assert!(example().is_err());
//! ```

pub mod error;
pub mod ids;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
