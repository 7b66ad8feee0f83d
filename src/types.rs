use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EpubVersion {
    Version2_0,
    Version3_0,
}

/// Represents a metadata item in the EPUB publication
///
/// Metadata items contain information about the publication such as title,
/// author, identifier and language. Only the plain property/value pairs are
/// kept; refinements are not needed by the reader core.
#[derive(Debug, Clone)]
pub struct MetadataItem {
    /// Optional unique identifier for this metadata item
    pub id: Option<String>,

    /// The metadata property name, e.g. "title", "creator", "identifier"
    pub property: String,

    /// The metadata value, whitespace normalized
    pub value: String,

    /// Optional language code for this metadata item
    pub lang: Option<String>,
}

/// Represents a resource item declared in the EPUB manifest
///
/// Every resource that is part of the publication is declared in the manifest:
/// content documents, stylesheets, images and fonts.
#[derive(Debug, Clone)]
pub struct ManifestItem {
    /// The manifest id of the resource
    pub id: String,

    /// The `href` exactly as declared in the package document
    ///
    /// This is relative to the directory of the OPF file and is the form most
    /// content documents use when they reference the resource.
    pub href: String,

    /// The normalized path of the resource relative to the container root
    ///
    /// Always uses `/` as separator, independent of the host platform, so it can
    /// be used directly as a zip entry name.
    pub path: String,

    /// The media type of the resource
    pub mime: String,

    /// Optional space-separated properties, e.g. "nav" or "cover-image"
    pub properties: Option<String>,

    /// Optional fallback resource identifier
    pub fallback: Option<String>,
}

impl ManifestItem {
    /// Returns `true` if the given property is present in the `properties` list
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|properties| properties.split_whitespace().any(|p| p == property))
    }

    /// Returns `true` if the resource is an image
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// Represents an item in the EPUB spine, defining the reading order of the publication
#[derive(Debug, Clone)]
pub struct SpineItem {
    /// The ID reference to a manifest item
    pub idref: String,

    /// Optional identifier for this spine item
    pub id: Option<String>,

    /// Optional properties associated with this spine item
    pub properties: Option<String>,

    /// Indicates whether this item is part of the linear reading order
    pub linear: bool,
}

/// Represents encryption information for EPUB resources
///
/// Parsed from `META-INF/encryption.xml`.
#[derive(Debug, Clone)]
pub struct EncryptionData {
    /// The encryption algorithm URI
    ///
    /// Supported encryption methods:
    /// - IDPF font obfuscation: "http://www.idpf.org/2008/embedding"
    /// - Adobe font obfuscation: "http://ns.adobe.com/pdf/enc#RC"
    pub method: String,

    /// The path of the encrypted resource relative to the container root
    pub data: String,
}

/// Represents a navigation point in an EPUB document's table of contents
///
/// This is the raw hierarchy as found in the NCX file or the navigation
/// document. It is normalized into [`NavNode`](crate::toc::NavNode) before
/// being flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    /// The display label/title of this navigation point
    pub label: String,

    /// The navigation target exactly as written, e.g. `text/ch01.xhtml#s1`
    ///
    /// Can be `None` for navigation points that only group their children.
    pub content: Option<String>,

    /// Child navigation points (sub-sections)
    pub children: Vec<NavPoint>,

    /// The reading order position of this navigation point
    ///
    /// Only NCX files carry a play order.
    pub play_order: Option<usize>,
}

/// A content document in reading order
///
/// Chapter indices are dense and stable for the lifetime of one loaded archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    /// Position in reading order, starting from 0
    pub index: usize,

    /// Manifest id of the content document
    pub id: String,

    /// Path of the content document relative to the container root
    pub path: String,

    /// Basename of `path`, used to resolve navigation targets
    pub filename: String,
}

/// A single row of the flattened table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TocEntry {
    /// Display title
    pub title: String,

    /// Nesting depth, 0 for top level entries
    pub level: usize,

    /// Raw navigation target
    pub href: Option<String>,

    /// Resolved chapter index, `None` if the target could not be matched
    pub chapter_idx: Option<usize>,
}
