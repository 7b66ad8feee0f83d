//! Reader settings persisted as a JSON document in the home directory
//!
//! Settings IO never fails from the caller's point of view: a missing or
//! broken file loads as the defaults, and a failed write is reported as
//! `false`. Keys this crate does not know about are kept when writing so that
//! other front ends can share the file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::BaseDirs;
use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::EpubError;

/// Name of the settings file inside the home directory
pub const SETTINGS_FILE: &str = ".epub_reader.json";

/// Settings file written by earlier releases of the reader
///
/// Used instead of [`SETTINGS_FILE`] as long as only this one exists.
pub const LEGACY_SETTINGS_FILE: &str = ".epub_reader_pyqt.json";

pub const DEFAULT_THEME: &str = "light";

/// Known color theme keys
pub const THEMES: [&str; 12] = [
    "light",
    "dark",
    "sepia",
    "green",
    "monokai",
    "nord",
    "dracula",
    "one_dark",
    "github_dark",
    "gruvbox",
    "tokyo_night",
    "catppuccin",
];

pub const FONT_SCALE_RANGE: (f64, f64) = (0.5, 2.0);
pub const LINE_SPACING_RANGE: (f64, f64) = (1.2, 3.0);
pub const PARAGRAPH_SPACING_RANGE: (f64, f64) = (0.4, 3.0);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Path of the book opened last
    pub last_opened: Option<String>,

    /// Chapter displayed when the book was closed
    pub current_chapter: usize,

    pub current_theme: String,
    pub font_family: String,
    pub font_scale: f64,
    pub line_spacing: f64,
    pub paragraph_spacing: f64,
    pub show_images: bool,
    pub reading_mode: bool,
    pub toc_visible: bool,

    /// Opaque window state owned by the front end
    pub window_geometry: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_opened: None,
            current_chapter: 0,
            current_theme: DEFAULT_THEME.to_string(),
            font_family: "Microsoft YaHei".to_string(),
            font_scale: 1.0,
            line_spacing: 1.8,
            paragraph_spacing: 1.2,
            show_images: true,
            reading_mode: false,
            toc_visible: true,
            window_geometry: None,
        }
    }
}

fn clamp_or(value: f64, (min, max): (f64, f64), default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}

/// Overwrites `target` with the value stored under `key`
///
/// A value of the wrong type leaves `target` untouched.
fn read_field<T: DeserializeOwned>(document: &Map<String, Value>, key: &str, target: &mut T) {
    let Some(value) = document.get(key) else {
        return;
    };

    match serde_json::from_value::<T>(value.clone()) {
        Ok(value) => *target = value,
        Err(err) => warn!("Setting \"{}\" ignored: {}", key, err),
    }
}

impl Settings {
    /// Settings from a stored document, key by key
    ///
    /// Missing and mistyped keys keep their default value, the other keys
    /// are still taken from the document.
    pub fn from_document(document: &Map<String, Value>) -> Self {
        let mut settings = Settings::default();

        read_field(document, "last_opened", &mut settings.last_opened);
        read_field(document, "current_chapter", &mut settings.current_chapter);
        read_field(document, "current_theme", &mut settings.current_theme);
        read_field(document, "font_family", &mut settings.font_family);
        read_field(document, "font_scale", &mut settings.font_scale);
        read_field(document, "line_spacing", &mut settings.line_spacing);
        read_field(document, "paragraph_spacing", &mut settings.paragraph_spacing);
        read_field(document, "show_images", &mut settings.show_images);
        read_field(document, "reading_mode", &mut settings.reading_mode);
        read_field(document, "toc_visible", &mut settings.toc_visible);
        read_field(document, "window_geometry", &mut settings.window_geometry);

        settings.normalized()
    }

    /// Clamps the typography values into their ranges and replaces an
    /// unknown theme with the default one
    pub fn normalized(mut self) -> Self {
        let defaults = Settings::default();

        self.font_scale = clamp_or(self.font_scale, FONT_SCALE_RANGE, defaults.font_scale);
        self.line_spacing = clamp_or(self.line_spacing, LINE_SPACING_RANGE, defaults.line_spacing);
        self.paragraph_spacing = clamp_or(
            self.paragraph_spacing,
            PARAGRAPH_SPACING_RANGE,
            defaults.paragraph_spacing,
        );

        if !THEMES.contains(&self.current_theme.as_str()) {
            warn!("Unknown theme \"{}\", using \"{}\"", self.current_theme, DEFAULT_THEME);
            self.current_theme = defaults.current_theme;
        }

        self
    }
}

/// Reads and writes the settings document
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// A store for [`SETTINGS_FILE`] in the user's home directory
    ///
    /// Falls back to the working directory if no home directory is known.
    pub fn new() -> Self {
        match BaseDirs::new() {
            Some(dirs) => Self::in_dir(dirs.home_dir()),
            None => {
                warn!("No home directory found, keeping settings in the working directory");
                Self::in_dir(Path::new(""))
            }
        }
    }

    /// A store for the settings file inside `dir`
    ///
    /// Picks [`LEGACY_SETTINGS_FILE`] when it exists and [`SETTINGS_FILE`]
    /// does not.
    pub fn in_dir(dir: &Path) -> Self {
        let path = dir.join(SETTINGS_FILE);
        let legacy = dir.join(LEGACY_SETTINGS_FILE);

        if !path.exists() && legacy.exists() {
            debug!("Using settings file \"{}\"", legacy.display());
            return Self { path: legacy };
        }

        Self { path }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the settings, falling back to the defaults
    pub fn load(&self) -> Settings {
        match self.read_document() {
            Ok(document) => Settings::from_document(&document),
            Err(err) => {
                warn!(
                    "Settings \"{}\" could not be loaded, using defaults: {}",
                    self.path.display(),
                    err
                );
                Settings::default()
            }
        }
    }

    /// Writes `settings`, keeping unknown keys of the existing document
    ///
    /// Returns `false` if the document could not be written.
    pub fn save(&self, settings: &Settings) -> bool {
        let result = serde_json::to_value(settings)
            .map_err(EpubError::from)
            .and_then(|value| {
                let mut document = self.read_document().unwrap_or_default();
                if let Value::Object(fields) = value {
                    document.extend(fields);
                }
                self.write_document(&document)
            });

        self.report_write(result)
    }

    /// Returns the raw value stored under `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.read_document() {
            Ok(mut document) => document.remove(key),
            Err(err) => {
                debug!("Settings \"{}\" unreadable: {}", self.path.display(), err);
                None
            }
        }
    }

    /// Stores `value` under `key`, leaving every other key untouched
    pub fn set(&self, key: &str, value: Value) -> bool {
        let mut document = self.read_document().unwrap_or_default();
        document.insert(key.to_string(), value);

        let result = self.write_document(&document);
        self.report_write(result)
    }

    fn report_write(&self, result: Result<(), EpubError>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("Settings \"{}\" could not be saved: {}", self.path.display(), err);
                false
            }
        }
    }

    /// The stored document; empty if the file does not exist
    fn read_document(&self) -> Result<Map<String, Value>, EpubError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str::<Map<String, Value>>(&content)?)
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<(), EpubError> {
        let content = serde_json::to_string_pretty(document)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}
