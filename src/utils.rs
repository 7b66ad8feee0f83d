use std::{
    borrow::Cow,
    cmp::min,
    collections::HashMap,
    io::{Read, Seek},
};

use percent_encoding::percent_decode_str;
use quick_xml::{
    NsReader,
    escape::{resolve_predefined_entity, unescape},
    events::Event,
};
use sha1::{Digest, Sha1};
use zip::{CompressionMethod, ZipArchive, result::ZipError};

use crate::error::EpubError;

/// Reads a whole zip entry into memory
///
/// `file_name` is the entry name, relative to the container root.
///
/// ## Return
/// - `Ok(Vec<u8>)`: The raw bytes of the entry
/// - `Err(EpubError::ResourceNotFound)`: No entry with that name exists
/// - `Err(EpubError)`: Any other error that occurred during the read operation
pub fn get_file_in_zip_archive<R: Read + Seek>(
    zip_file: &mut ZipArchive<R>,
    file_name: &str,
) -> Result<Vec<u8>, EpubError> {
    let mut buffer = Vec::<u8>::new();
    match zip_file.by_name(file_name) {
        Ok(mut file) => {
            file.read_to_end(&mut buffer)?;
            Ok(buffer)
        }
        Err(ZipError::FileNotFound) => Err(EpubError::ResourceNotFound {
            resource: file_name.to_string(),
        }),
        Err(err) => Err(EpubError::from(err)),
    }
}

/// Checks that every entry of the container uses a compression method that
/// OCF allows.
///
/// OCF containers may only use Stored or Deflated entries.
pub fn compression_method_check<R: Read + Seek>(
    zip_archive: &mut ZipArchive<R>,
) -> Result<(), EpubError> {
    for index in 0..zip_archive.len() {
        let file = zip_archive.by_index(index)?;

        match file.compression() {
            CompressionMethod::Stored | CompressionMethod::Deflated => continue,
            _ => {
                return Err(EpubError::UnusableCompressionMethod {
                    file: file.name().to_string(),
                    method: file.compression().to_string(),
                });
            }
        };
    }

    Ok(())
}

/// Resolves `href` against `base_dir` inside the container
///
/// Both arguments use `/` as separator. `.` segments are dropped and `..`
/// segments pop the previous one. A leading `/` makes `href` relative to the
/// container root.
///
/// ## Return
/// - `Some(String)`: The normalized path relative to the container root
/// - `None`: The link climbs above the container root
pub fn resolve_container_path(base_dir: &str, href: &str) -> Option<String> {
    let (start, href) = match href.strip_prefix('/') {
        Some(rest) => ("", rest),
        None => (base_dir, href),
    };

    let mut segments: Vec<&str> = start.split('/').filter(|s| !s.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            _ => segments.push(segment),
        }
    }

    Some(segments.join("/"))
}

/// Returns the text after the last `/`, or the whole input if there is none
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Returns the directory part of a container path, without trailing `/`
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|pos| &path[..pos]).unwrap_or("")
}

/// Percent-decodes a link, replacing invalid UTF-8 sequences
pub fn percent_decode(input: &str) -> Cow<'_, str> {
    percent_decode_str(input).decode_utf8_lossy()
}

/// Decrypts a resource obfuscated with the IDPF font obfuscation algorithm
///
/// The first 1040 bytes are XORed with the SHA-1 digest of the publication's
/// unique identifier (whitespace removed). XOR is symmetric, so the same
/// function also obfuscates.
pub fn idpf_font_dencryption(data: &[u8], key: &str) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let mut deobfuscated = data.to_vec();
    for index in 0..min(1040, data.len()) {
        deobfuscated[index] ^= hash[index % hash.len()];
    }

    deobfuscated
}

/// Decrypts a resource obfuscated with the Adobe font obfuscation algorithm
///
/// The first 1024 bytes are XORed with the 16 bytes of the UUID found in the
/// unique identifier. If the identifier is not a UUID, its raw bytes are
/// repeated to form the key.
pub fn adobe_font_dencryption(data: &[u8], key: &str) -> Vec<u8> {
    if data.is_empty() || key.is_empty() {
        return data.to_vec();
    }

    let key = adobe_key(key);
    let mut deobfuscated = data.to_vec();
    for index in 0..min(1024, data.len()) {
        deobfuscated[index] ^= key[index % 16];
    }

    deobfuscated
}

fn adobe_key(identifier: &str) -> [u8; 16] {
    let hex: String = identifier
        .trim_start_matches("urn:uuid:")
        .chars()
        .filter(|c| *c != '-')
        .collect();

    let mut key = [0u8; 16];
    let parsed = hex.len() == 32
        && hex.is_ascii()
        && (0..16).all(|index| {
            match u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16) {
                Ok(byte) => {
                    key[index] = byte;
                    true
                }
                Err(_) => false,
            }
        });

    if !parsed {
        let bytes = identifier.as_bytes();
        for (index, byte) in key.iter_mut().enumerate() {
            *byte = bytes[index % bytes.len()];
        }
    }

    key
}

/// Strict text decoding of raw container entries
///
/// Supports UTF-8 (with or without BOM), UTF-16 BE and UTF-16 LE (with BOM).
/// Data without a BOM must be valid UTF-8; nothing is decoded lossily, so
/// callers can tell a broken document apart from a valid one.
pub trait DecodeBytes {
    fn decode(&self) -> Result<String, EpubError>;
}

impl DecodeBytes for [u8] {
    fn decode(&self) -> Result<String, EpubError> {
        if self.is_empty() {
            return Err(EpubError::EmptyDataError);
        }

        if let Some(rest) = self.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
            return String::from_utf8(rest.to_vec()).map_err(EpubError::from);
        }

        if let Some(rest) = self.strip_prefix(&[0xFE, 0xFF]) {
            let utf16_units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .collect();
            return String::from_utf16(&utf16_units).map_err(EpubError::from);
        }

        if let Some(rest) = self.strip_prefix(&[0xFF, 0xFE]) {
            let utf16_units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect();
            return String::from_utf16(&utf16_units).map_err(EpubError::from);
        }

        String::from_utf8(self.to_vec()).map_err(EpubError::from)
    }
}

/// Collapses runs of whitespace into a single space and trims both ends
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// An element of the in-memory XML tree built by [`XmlReader`]
#[derive(Debug)]
pub struct XmlElement {
    /// Local name, without prefix
    pub name: String,

    /// Prefix as written, e.g. `dc` or `epub`
    pub prefix: Option<String>,

    /// Namespace URI the prefix (or the default namespace) is bound to
    pub namespace: Option<String>,

    /// Attribute values keyed by qualified name, e.g. `epub:type`
    pub attributes: HashMap<String, String>,

    /// The text content of the element, entity references resolved
    pub text: Option<String>,

    /// Child elements in document order
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Create a new element
    pub fn new(name: String) -> Self {
        Self {
            name,
            prefix: None,
            namespace: None,
            attributes: HashMap::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Qualified name, `prefix:name` or just `name`
    pub fn tag_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Text of the element followed by the text of its descendants, trimmed
    pub fn text(&self) -> String {
        let mut text = self.text.clone().unwrap_or_default();
        for child in &self.children {
            text.push_str(&child.text());
        }

        text.trim().to_string()
    }

    /// Attribute value by qualified name
    pub fn get_attr(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    /// Find all elements with the specified name, depth first, including `self`
    pub fn find_elements_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> {
        let mut elements = Vec::new();
        Self::collect_elements(self, &mut elements);
        elements.into_iter().filter(move |element| element.name == name)
    }

    /// Direct children with local name `name`
    pub fn find_children_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Direct children whose local name is one of `names`
    pub fn find_children_by_names<'a>(
        &'a self,
        names: &'a [&str],
    ) -> impl Iterator<Item = &'a XmlElement> {
        self.children
            .iter()
            .filter(move |child| names.contains(&child.name.as_str()))
    }

    /// Get children elements
    pub fn children(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter()
    }

    fn collect_elements<'a>(element: &'a XmlElement, collection: &mut Vec<&'a XmlElement>) {
        collection.push(element);
        for child in &element.children {
            Self::collect_elements(child, collection);
        }
    }

    fn push_text(&mut self, text: &str) {
        self.text.get_or_insert_with(String::new).push_str(text);
    }
}

/// Builds an [`XmlElement`] tree from a document of the container
pub struct XmlReader {}

impl XmlReader {
    /// Parses `content` and returns its root element
    ///
    /// Character and predefined entity references are resolved in text and
    /// attribute values. Comments, processing instructions and the doctype
    /// are dropped.
    pub fn parse(content: &str) -> Result<XmlElement, EpubError> {
        if content.is_empty() {
            return Err(EpubError::EmptyDataError);
        }

        // Text is kept untrimmed so that the spaces around entity
        // references survive; `XmlElement::text` trims the final value.
        let mut reader = NsReader::from_str(content);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut stack = Vec::<XmlElement>::new();
        let mut root = None;
        let mut namespace_map = HashMap::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,

                Ok(Event::Start(e)) => {
                    let element = Self::make_element(&e, &mut namespace_map);
                    stack.push(element);
                }

                Ok(Event::End(_)) => {
                    if let Some(element) = stack.pop() {
                        // closing the outermost element
                        if stack.is_empty() {
                            root = Some(element);
                        } else if let Some(parent) = stack.last_mut() {
                            parent.children.push(element);
                        }
                    }
                }

                Ok(Event::Empty(e)) => {
                    let element = Self::make_element(&e, &mut namespace_map);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }

                Ok(Event::Text(e)) => {
                    // Whitespace-only runs are kept, they may separate entity references
                    if let Some(element) = stack.last_mut() {
                        element.push_text(&String::from_utf8_lossy(&e));
                    }
                }

                Ok(Event::CData(e)) => {
                    if let Some(element) = stack.last_mut() {
                        element.push_text(&String::from_utf8_lossy(&e));
                    }
                }

                Ok(Event::GeneralRef(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let name = String::from_utf8_lossy(&e).to_string();
                        let resolved = match e.resolve_char_ref() {
                            Ok(Some(ch)) => ch.to_string(),
                            _ => Self::resolve_entity(&name),
                        };
                        element.push_text(&resolved);
                    }
                }

                Err(err) => return Err(err.into()),

                // Comment, PI, Declaration, Doctype
                _ => {}
            }

            buf.clear();
        }

        if let Some(element) = root.as_mut() {
            Self::assign_namespace(element, &namespace_map);
        }

        root.ok_or(EpubError::EmptyDataError)
    }

    /// Decodes `bytes` with [`DecodeBytes`] and parses the result
    pub fn parse_bytes(bytes: &[u8]) -> Result<XmlElement, EpubError> {
        let content = bytes.decode()?;
        Self::parse(&content)
    }

    fn make_element(
        e: &quick_xml::events::BytesStart,
        namespace_map: &mut HashMap<String, String>,
    ) -> XmlElement {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
        let mut element = XmlElement::new(name);

        if let Some(prefix) = e.name().prefix() {
            element.prefix = Some(String::from_utf8_lossy(prefix.as_ref()).to_string());
        }

        for attr in e.attributes().flatten() {
            let attr_key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let raw_value = String::from_utf8_lossy(&attr.value);
            let attr_value = match unescape(&raw_value) {
                Ok(value) => value.to_string(),
                Err(_) => raw_value.to_string(),
            };

            // Handle namespace attributes
            if attr_key == "xmlns" || attr_key.starts_with("xmlns:") {
                match attr_key.split_once(':') {
                    Some((_, prefix)) => namespace_map.insert(prefix.to_string(), attr_value),
                    None => namespace_map.insert(attr_key, attr_value),
                };
                continue;
            }

            element.attributes.insert(attr_key, attr_value);
        }

        element
    }

    fn resolve_entity(name: &str) -> String {
        match resolve_predefined_entity(name) {
            Some(value) => value.to_string(),
            None if name == "nbsp" => "\u{a0}".to_string(),
            None => format!("&{};", name),
        }
    }

    /// Binds every element of the tree to its namespace URI
    fn assign_namespace(element: &mut XmlElement, namespace_map: &HashMap<String, String>) {
        if let Some(prefix) = &element.prefix {
            if let Some(namespace) = namespace_map.get(prefix) {
                element.namespace = Some(namespace.clone());
            }
        } else if let Some(namespace) = namespace_map.get("xmlns") {
            element.namespace = Some(namespace.clone());
        }

        for child in element.children.iter_mut() {
            Self::assign_namespace(child, namespace_map);
        }
    }
}
