//! Rendering of stored records and ingest summaries.
//!
//! - [`text`]: human-readable blocks for the terminal or a chat reply
//! - [`json`]: pretty JSON for other programs

pub mod json;
pub mod text;
