//! Error types of the reader core
//!
//! Everything that can go wrong while opening an archive, rendering a
//! chapter or persisting settings is an [`EpubError`].
//!
//! Few of these errors ever reach the presentation layer. Chapter decoding,
//! image resolution, navigation parsing and settings IO all degrade to a
//! default result and are only logged. Errors returned from
//! [`Reader::load_archive`](crate::reader::Reader::load_archive) are meant to
//! be shown to the user.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpubError {
    /// The container is not a readable zip archive
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// A chapter is neither UTF-8 nor BOM-tagged UTF-16
    ///
    /// Only this chapter is unavailable; the rest of the book still renders.
    #[error("Chapter decode error: chapter {index} is not valid text.")]
    ChapterDecodeError { index: usize },

    #[error("Chapter not found: index {index} is out of range, the book has {count} chapters.")]
    ChapterNotFound { index: usize, count: usize },

    /// Text decoding was asked to decode zero bytes
    #[error("Decode error: no data to decode.")]
    EmptyDataError,

    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    /// An element of the container, package or navigation document lacks an
    /// attribute it cannot do without
    #[error("Missing attribute: <{tag}> has no \"{attribute}\" attribute.")]
    MissingRequiredAttribute { tag: String, attribute: String },

    /// A lock was poisoned by a panicking thread
    #[error("Mutex error: a lock was poisoned by a panicking thread.")]
    MutexError,

    /// Content was requested before any book was loaded
    #[error("No archive loaded: open an EPUB file first.")]
    NoArchiveLoaded,

    /// A file the container must provide is missing
    #[error("Malformed EPUB: \"{expected_file}\" is missing.")]
    NonCanonicalEpub { expected_file: String },

    /// A required element is missing from an XML document of the container
    #[error("Malformed document: no <{tag}> element found.")]
    NonCanonicalFile { tag: String },

    /// A manifest href climbs above the container root
    #[error("Relative link leakage: \"{path}\" points outside the container.")]
    RelativeLinkLeakage { path: String },

    #[error("Unknown manifest id \"{id}\".")]
    ResourceIdNotExist { id: String },

    /// No zip entry or manifest item exists for the given path
    #[error("Resource not found: \"{resource}\".")]
    ResourceNotFound { resource: String },

    /// The settings document exists but is not a JSON object of settings
    #[error("Settings error: {source}")]
    SettingsError { source: serde_json::Error },

    /// The prefetch workers could not be started
    #[error("Thread pool error: {source}")]
    ThreadPoolError { source: rayon::ThreadPoolBuildError },

    /// Neither the version attribute nor version specific package features
    /// identify the EPUB version
    #[error("Unrecognized EPUB version.")]
    UnrecognizedEpubVersion,

    /// A resource is encrypted with something other than font obfuscation
    #[error("Unsupported encryption method \"{method}\".")]
    UnsupportedEncryptedMethod { method: String },

    /// OCF containers may only store or deflate their entries
    #[error("Unusable compression method: \"{file}\" is compressed with {method}.")]
    UnusableCompressionMethod { file: String, method: String },

    #[error("UTF-8 decode error: {source}")]
    Utf8DecodeError { source: std::string::FromUtf8Error },

    #[error("UTF-16 decode error: {source}")]
    Utf16DecodeError { source: std::string::FromUtf16Error },

    /// An XML document of the container is not well formed
    #[error("XML error: {source}")]
    QuickXmlError { source: quick_xml::Error },
}

impl From<zip::result::ZipError> for EpubError {
    fn from(source: zip::result::ZipError) -> Self {
        EpubError::ArchiveError { source }
    }
}

impl From<quick_xml::Error> for EpubError {
    fn from(source: quick_xml::Error) -> Self {
        EpubError::QuickXmlError { source }
    }
}

impl From<std::io::Error> for EpubError {
    fn from(source: std::io::Error) -> Self {
        EpubError::IOError { source }
    }
}

impl From<std::string::FromUtf8Error> for EpubError {
    fn from(source: std::string::FromUtf8Error) -> Self {
        EpubError::Utf8DecodeError { source }
    }
}

impl From<std::string::FromUtf16Error> for EpubError {
    fn from(source: std::string::FromUtf16Error) -> Self {
        EpubError::Utf16DecodeError { source }
    }
}

impl From<serde_json::Error> for EpubError {
    fn from(source: serde_json::Error) -> Self {
        EpubError::SettingsError { source }
    }
}

impl From<rayon::ThreadPoolBuildError> for EpubError {
    fn from(source: rayon::ThreadPoolBuildError) -> Self {
        EpubError::ThreadPoolError { source }
    }
}

impl<T> From<std::sync::PoisonError<T>> for EpubError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        EpubError::MutexError
    }
}

/// Compares the context fields of errors; wrapped library errors only
/// compare by variant
#[cfg(test)]
impl PartialEq for EpubError {
    fn eq(&self, other: &Self) -> bool {
        use EpubError::*;

        match (self, other) {
            (ChapterDecodeError { index: a }, ChapterDecodeError { index: b }) => a == b,
            (
                ChapterNotFound { index: a, count: c },
                ChapterNotFound { index: b, count: d },
            ) => a == b && c == d,
            (
                MissingRequiredAttribute { tag: a, attribute: c },
                MissingRequiredAttribute { tag: b, attribute: d },
            ) => a == b && c == d,
            (NonCanonicalEpub { expected_file: a }, NonCanonicalEpub { expected_file: b }) => {
                a == b
            }
            (NonCanonicalFile { tag: a }, NonCanonicalFile { tag: b }) => a == b,
            (RelativeLinkLeakage { path: a }, RelativeLinkLeakage { path: b }) => a == b,
            (ResourceIdNotExist { id: a }, ResourceIdNotExist { id: b }) => a == b,
            (ResourceNotFound { resource: a }, ResourceNotFound { resource: b }) => a == b,
            (
                UnsupportedEncryptedMethod { method: a },
                UnsupportedEncryptedMethod { method: b },
            ) => a == b,
            (Utf8DecodeError { source: a }, Utf8DecodeError { source: b }) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}
