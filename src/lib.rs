//! EPUB reader core
//!
//! The content side of an EPUB reader: everything between the EPUB file on
//! disk and the HTML a web view displays.
//!
//! This library opens EPUB 2 and EPUB 3 archives, turns their content
//! documents into self-contained HTML with images inlined as `data:` URIs,
//! caches rendered chapters and renders the neighbours of the displayed
//! chapter in the background. It also flattens the table of contents and
//! persists the reader settings.
//!
//! ## Features
//!
//! - Parse EPUB containers, metadata, manifest and spine; read chapters and resources.
//! - Automatic handling of obfuscated fonts.
//! - Image inlining, or placeholders while images are hidden.
//! - Chapter cache that is never polluted by stale background work.
//! - Flat table of contents that always has at least one entry per chapter.
//! - JSON settings file in the home directory.
//!
//! ## Quick Start
//!
//! ```rust, ignore
//! # use epub_reader_core::{reader::Reader, settings::SettingsStore};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SettingsStore::new();
//! let settings = store.load();
//!
//! let mut reader: Reader = Reader::new()?;
//! let title = reader.load_archive("path/to/epub/file.epub")?;
//! reader.apply_settings(&settings)?;
//!
//! for entry in reader.flat_toc() {
//!     println!("{}{}", "  ".repeat(entry.level), entry.title);
//! }
//!
//! let chapter = reader.resume_chapter(&settings);
//! let html = reader.chapter_html(chapter)?;
//! reader.notify_displayed(chapter)?;
//!
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade. Recovered
//! problems, such as an unreadable table of contents or settings file, are
//! reported with `warn!`; nothing is printed unless the application installs
//! a logger.

pub(crate) mod utils;

pub mod content;
pub mod epub;
pub mod error;
pub mod images;
pub mod prefetch;
pub mod reader;
pub mod settings;
pub mod toc;
pub mod types;

#[cfg(test)]
mod test_support;

pub use utils::DecodeBytes;
