use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::{Path, PathBuf},
    sync::Mutex,
};

use indexmap::IndexMap;
use log::{debug, warn};
use zip::ZipArchive;

use crate::{
    error::EpubError,
    types::{Chapter, EncryptionData, EpubVersion, ManifestItem, MetadataItem, NavPoint, SpineItem},
    utils::{
        DecodeBytes, NormalizeWhitespace, XmlElement, XmlReader, adobe_font_dencryption,
        compression_method_check, get_file_in_zip_archive, idpf_font_dencryption, last_segment,
        parent_dir, percent_decode, resolve_container_path,
    },
};

const NCX_MIME: &str = "application/x-dtbncx+xml";

/// EPUB document parser, representing a loaded and parsed EPUB publication
///
/// `EpubDoc` is the archive accessor of the reader core. It parses the
/// container, the package document (metadata, manifest and spine) and the
/// encryption information, and derives the ordered list of chapters from the
/// spine, followed by the content documents the spine leaves out. Chapter bodies and resources are read lazily from the zip archive.
///
/// The archive sits behind a mutex so that a shared `EpubDoc` can be read
/// from the prefetch workers while the interactive thread also uses it.
/// Navigation data is not parsed at open time: a broken table of contents
/// must not prevent the book from opening, see [`EpubDoc::navigation_tree`].
pub struct EpubDoc<R: Read + Seek> {
    /// The structure of the epub file that actually holds it
    archive: Mutex<ZipArchive<R>>,

    /// The path of the epub file, as given by the caller
    epub_path: PathBuf,

    /// The path to the OPF file
    pub package_path: String,

    /// The path to the directory where the opf file is located
    pub base_path: String,

    /// The epub version
    pub version: EpubVersion,

    /// The unique identifier of the epub file
    ///
    /// Used as key for font de-obfuscation. Empty if the package does not
    /// declare one.
    pub unique_identifier: String,

    /// Epub metadata extracted from OPF
    pub metadata: Vec<MetadataItem>,

    /// Resources declared in the manifest, in declaration order
    pub manifest: IndexMap<String, ManifestItem>,

    /// Physical reading order of publications extracted from OPF
    pub spine: Vec<SpineItem>,

    /// The `toc` attribute of the spine, pointing at the NCX file
    toc_id: Option<String>,

    /// The encryption.xml extracted from the META-INF directory
    pub encryption: Option<Vec<EncryptionData>>,

    /// Content documents in reading order
    chapters: Vec<Chapter>,
}

impl<R: Read + Seek> EpubDoc<R> {
    /// Creates a new EPUB document instance from a reader
    ///
    /// # Parameters
    /// - `reader`: The data source, usually a file or memory buffer
    /// - `epub_path`: The path of the EPUB file, only kept for display and logging
    ///
    /// # Return
    /// - `Ok(EpubDoc<R>)`: The successfully parsed EPUB document object
    /// - `Err(EpubError)`: Errors encountered during parsing
    pub fn from_reader<P: Into<PathBuf>>(reader: R, epub_path: P) -> Result<Self, EpubError> {
        // Parsing process
        // 1. Verify that the ZIP compression method conforms to the EPUB specification
        // 2. Parse `META-INF/container.xml` retrieves the location of the OPF file
        // 3. Parse the OPF file: version, metadata, manifest and spine
        // 4. Parse encryption information
        // 5. Derive the chapter list from the spine

        let mut archive = ZipArchive::new(reader).map_err(EpubError::from)?;
        compression_method_check(&mut archive)?;

        let container = get_file_in_zip_archive(&mut archive, "META-INF/container.xml")
            .map_err(|err| match err {
                EpubError::ResourceNotFound { .. } => EpubError::NonCanonicalEpub {
                    expected_file: "META-INF/container.xml".to_string(),
                },
                err => err,
            })?
            .decode()?;
        let package_path = Self::parse_container(&container)?;
        let base_path = parent_dir(&package_path).to_string();

        let opf_file = get_file_in_zip_archive(&mut archive, &package_path)?.decode()?;
        let package = XmlReader::parse(&opf_file)?;
        let version = Self::determine_epub_version(&package)?;

        let encryption = Self::parse_encryption(&mut archive)?;

        let mut doc = Self {
            archive: Mutex::new(archive),
            epub_path: epub_path.into(),
            package_path,
            base_path,
            version,
            unique_identifier: String::new(),
            metadata: vec![],
            manifest: IndexMap::new(),
            spine: vec![],
            toc_id: None,
            encryption,
            chapters: vec![],
        };

        let metadata_element = Self::required_element(&package, "metadata")?;
        let manifest_element = Self::required_element(&package, "manifest")?;
        let spine_element = Self::required_element(&package, "spine")?;

        doc.parse_metadata(metadata_element);
        doc.parse_manifest(manifest_element)?;
        doc.parse_spine(spine_element)?;
        doc.build_chapters();

        let unique_identifier = match package.get_attr("unique-identifier") {
            Some(uid) => doc.metadata.iter().find(|item| {
                item.property == "identifier" && item.id.as_ref().is_some_and(|id| id == &uid)
            }),
            None => None,
        }
        .or_else(|| doc.metadata.iter().find(|item| item.property == "identifier"))
        .map(|item| item.value.clone());

        match unique_identifier {
            Some(uid) => doc.unique_identifier = uid,
            None => warn!(
                "{}: the package declares no dc:identifier",
                doc.epub_path.display()
            ),
        }

        debug!(
            "Opened {} ({:?}): {} manifest items, {} chapters",
            doc.epub_path.display(),
            doc.version,
            doc.manifest.len(),
            doc.chapters.len()
        );

        Ok(doc)
    }

    fn required_element<'a>(
        package: &'a XmlElement,
        name: &'a str,
    ) -> Result<&'a XmlElement, EpubError> {
        package
            .find_elements_by_name(name)
            .next()
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: name.to_string(),
            })
    }

    /// Parse the EPUB container file (META-INF/container.xml)
    ///
    /// When multiple `rootfile` elements exist, the first one is used.
    fn parse_container(data: &str) -> Result<String, EpubError> {
        let root = XmlReader::parse(data)?;
        let rootfile = root
            .find_elements_by_name("rootfile")
            .next()
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "rootfile".to_string(),
            })?;

        let attr =
            rootfile
                .get_attr("full-path")
                .ok_or_else(|| EpubError::MissingRequiredAttribute {
                    tag: "rootfile".to_string(),
                    attribute: "full-path".to_string(),
                })?;

        Ok(attr.trim_start_matches('/').to_string())
    }

    /// Parse the EPUB metadata section
    ///
    /// Handles Dublin Core elements and OPF `<meta>` elements. EPUB 2 style
    /// `<meta name=".." content=".."/>` and EPUB 3 style
    /// `<meta property="..">value</meta>` are both accepted; refinements are
    /// ignored.
    fn parse_metadata(&mut self, metadata_element: &XmlElement) {
        const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";

        let mut metadata = Vec::new();
        for element in metadata_element.children() {
            let is_dc = element.namespace.as_deref() == Some(DC_NAMESPACE)
                || element.prefix.as_deref() == Some("dc");

            if is_dc {
                metadata.push(MetadataItem {
                    id: element.get_attr("id"),
                    property: element.name.clone(),
                    value: element.text().normalize_whitespace(),
                    lang: element.get_attr("xml:lang").or_else(|| element.get_attr("lang")),
                });
                continue;
            }

            if element.name != "meta" || element.get_attr("refines").is_some() {
                continue;
            }

            let item = match (element.get_attr("name"), element.get_attr("property")) {
                (Some(name), _) => element.get_attr("content").map(|content| MetadataItem {
                    id: None,
                    property: name,
                    value: content.normalize_whitespace(),
                    lang: None,
                }),
                (None, Some(property)) => Some(MetadataItem {
                    id: element.get_attr("id"),
                    property,
                    value: element.text().normalize_whitespace(),
                    lang: element.get_attr("xml:lang"),
                }),
                (None, None) => None,
            };

            if let Some(item) = item {
                metadata.push(item);
            }
        }

        self.metadata = metadata;
    }

    /// Parse the EPUB manifest section
    ///
    /// Every item's `href` is percent-decoded and resolved against the
    /// directory of the OPF file, so that `path` can be used as a zip entry
    /// name directly.
    fn parse_manifest(&mut self, manifest_element: &XmlElement) -> Result<(), EpubError> {
        let estimated_items = manifest_element.children().count();
        let mut resources = IndexMap::with_capacity(estimated_items);

        for element in manifest_element.find_children_by_name("item") {
            let id = element
                .get_attr("id")
                .ok_or_else(|| EpubError::MissingRequiredAttribute {
                    tag: element.tag_name(),
                    attribute: "id".to_string(),
                })?;
            let href = element
                .get_attr("href")
                .ok_or_else(|| EpubError::MissingRequiredAttribute {
                    tag: element.tag_name(),
                    attribute: "href".to_string(),
                })?;
            let mime = element
                .get_attr("media-type")
                .ok_or_else(|| EpubError::MissingRequiredAttribute {
                    tag: element.tag_name(),
                    attribute: "media-type".to_string(),
                })?;

            let path = resolve_container_path(&self.base_path, &percent_decode(&href))
                .ok_or_else(|| EpubError::RelativeLinkLeakage { path: href.clone() })?;

            resources.insert(
                id.clone(),
                ManifestItem {
                    id,
                    href,
                    path,
                    mime,
                    properties: element.get_attr("properties"),
                    fallback: element.get_attr("fallback"),
                },
            );
        }

        self.manifest = resources;
        Ok(())
    }

    /// Parse the EPUB spine section
    fn parse_spine(&mut self, spine_element: &XmlElement) -> Result<(), EpubError> {
        let mut spine = Vec::new();
        for element in spine_element.find_children_by_name("itemref") {
            let idref = element
                .get_attr("idref")
                .ok_or_else(|| EpubError::MissingRequiredAttribute {
                    tag: element.tag_name(),
                    attribute: "idref".to_string(),
                })?;
            let linear = element
                .get_attr("linear")
                .map(|linear| linear != "no")
                .unwrap_or(true);

            spine.push(SpineItem {
                idref,
                id: element.get_attr("id"),
                linear,
                properties: element.get_attr("properties"),
            });
        }

        self.spine = spine;
        self.toc_id = spine_element.get_attr("toc");
        Ok(())
    }

    /// Derive the chapter list from the spine
    ///
    /// Spine items referencing an unknown manifest id are skipped, so chapter
    /// indices stay dense.
    fn build_chapters(&mut self) {
        let mut items = Vec::with_capacity(self.manifest.len());
        for spine_item in &self.spine {
            match self.manifest.get(&spine_item.idref) {
                Some(item) => items.push(item),
                None => warn!(
                    "Spine item \"{}\" does not exist in the manifest, skipped",
                    spine_item.idref
                ),
            }
        }

        // Content documents the spine leaves out still get an index, after
        // the spine ones, so that navigation can point at them.
        let extra = self
            .manifest
            .values()
            .filter(|item| Self::is_content_document(item))
            .filter(|item| !items.iter().any(|spine_item| spine_item.id == item.id))
            .collect::<Vec<_>>();
        if !extra.is_empty() {
            debug!("{} content documents outside the spine", extra.len());
        }
        items.extend(extra);

        self.chapters = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Chapter {
                index,
                id: item.id.clone(),
                path: item.path.clone(),
                filename: last_segment(&item.path).to_string(),
            })
            .collect();
    }

    fn is_content_document(item: &ManifestItem) -> bool {
        item.mime == "application/xhtml+xml" && !item.has_property("nav")
    }

    /// Parse the EPUB encryption file (META-INF/encryption.xml)
    ///
    /// Returns `None` if the container holds no encryption file.
    fn parse_encryption(
        archive: &mut ZipArchive<R>,
    ) -> Result<Option<Vec<EncryptionData>>, EpubError> {
        let encryption_file = match get_file_in_zip_archive(archive, "META-INF/encryption.xml") {
            Ok(data) => data.decode()?,
            Err(EpubError::ResourceNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let root = XmlReader::parse(&encryption_file)?;

        let mut encryption_data = Vec::new();
        for data in root.children() {
            if data.name != "EncryptedData" {
                continue;
            }

            let method = data
                .find_elements_by_name("EncryptionMethod")
                .next()
                .and_then(|element| element.get_attr("Algorithm"));
            let reference = data
                .find_elements_by_name("CipherReference")
                .next()
                .and_then(|element| element.get_attr("URI"));

            match (method, reference) {
                (Some(method), Some(uri)) => encryption_data.push(EncryptionData {
                    method,
                    data: percent_decode(uri.trim_start_matches('/')).to_string(),
                }),
                _ => warn!("Incomplete EncryptedData entry in encryption.xml, skipped"),
            }
        }

        Ok((!encryption_data.is_empty()).then_some(encryption_data))
    }

    /// Determine the EPUB version from the OPF file
    ///
    /// When the version attribute is missing or unusual, the version is
    /// derived from version specific features of the package.
    fn determine_epub_version(opf_element: &XmlElement) -> Result<EpubVersion, EpubError> {
        if let Some(version) = opf_element.get_attr("version") {
            if version.starts_with('2') {
                return Ok(EpubVersion::Version2_0);
            }
            if version.starts_with('3') {
                return Ok(EpubVersion::Version3_0);
            }
        }

        let spine_element = Self::required_element(opf_element, "spine")?;

        // Look for EPUB 2.x specific features
        if spine_element.get_attr("toc").is_some() {
            return Ok(EpubVersion::Version2_0);
        }

        let manifest_element = Self::required_element(opf_element, "manifest")?;

        // Look for EPUB 3.x specific features
        manifest_element
            .children()
            .find_map(|element| {
                let is_nav = element
                    .get_attr("properties")
                    .is_some_and(|properties| properties.split_whitespace().any(|p| p == "nav"));
                is_nav.then_some(EpubVersion::Version3_0)
            })
            .ok_or(EpubError::UnrecognizedEpubVersion)
    }

    /// The path of the EPUB file this document was opened from
    pub fn epub_path(&self) -> &Path {
        &self.epub_path
    }

    /// Retrieves a list of values for specific metadata items
    ///
    /// # Return
    /// - `Some(Vec<String>)`: All matching metadata item values, in document order
    /// - `None`: If no matching metadata items are found
    pub fn get_metadata_value(&self, key: &str) -> Option<Vec<String>> {
        let values = self
            .metadata
            .iter()
            .filter(|item| item.property == key)
            .map(|item| item.value.clone())
            .collect::<Vec<String>>();

        (!values.is_empty()).then_some(values)
    }

    /// Retrieves the title of the publication
    ///
    /// # Return
    /// - `Ok(Vec<String>)`: All titles, in the order they appear in the metadata
    /// - `Err(EpubError)`: If and only if the OPF file does not contain `<dc:title>`
    pub fn get_title(&self) -> Result<Vec<String>, EpubError> {
        self.get_metadata_value("title")
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "title".to_string(),
            })
    }

    /// Content documents in reading order
    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    /// Number of content documents in reading order
    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Reads the raw bytes of the chapter at `index`
    ///
    /// # Return
    /// - `Ok(Vec<u8>)`: The raw, undecoded content document
    /// - `Err(EpubError::ChapterNotFound)`: `index` is not in `[0, chapter_count)`
    /// - `Err(EpubError)`: The content document could not be read
    pub fn raw_chapter(&self, index: usize) -> Result<Vec<u8>, EpubError> {
        let chapter = self
            .chapters
            .get(index)
            .ok_or(EpubError::ChapterNotFound {
                index,
                count: self.chapters.len(),
            })?;

        self.get_resource(&chapter.path)
    }

    /// Retrieves a resource by its path relative to the container root
    ///
    /// Obfuscated fonts are de-obfuscated transparently.
    ///
    /// # Return
    /// - `Ok(Vec<u8>)`: The resource data
    /// - `Err(EpubError::ResourceNotFound)`: No such entry in the container
    /// - `Err(EpubError::UnsupportedEncryptedMethod)`: The resource is encrypted
    ///   with something other than font obfuscation
    pub fn get_resource(&self, path: &str) -> Result<Vec<u8>, EpubError> {
        let path = path.trim_start_matches('/');
        let data = {
            let mut archive = self.archive.lock()?;
            get_file_in_zip_archive(&mut archive, path)?
        };

        match self.is_encryption_file(path) {
            Some(method) => self.auto_dencrypt(method, &data),
            None => Ok(data),
        }
    }

    /// Retrieve resource data by manifest id
    ///
    /// # Return
    /// - `Ok((Vec<u8>, String))`: The resource data and its media type
    /// - `Err(EpubError)`: Unknown id, or the resource could not be read
    pub fn get_manifest_item(&self, id: &str) -> Result<(Vec<u8>, String), EpubError> {
        let item = self
            .manifest
            .get(id)
            .ok_or_else(|| EpubError::ResourceIdNotExist { id: id.to_string() })?;

        Ok((self.get_resource(&item.path)?, item.mime.clone()))
    }

    /// Retrieves resource item data by its path relative to the container root
    pub fn get_manifest_item_by_path(&self, path: &str) -> Result<(Vec<u8>, String), EpubError> {
        let item = self
            .manifest
            .values()
            .find(|item| item.path == path)
            .ok_or_else(|| EpubError::ResourceNotFound {
                resource: path.to_string(),
            })?;

        Ok((self.get_resource(&item.path)?, item.mime.clone()))
    }

    /// Parses the navigation hierarchy of the publication
    ///
    /// EPUB 3 publications are read from the navigation document, falling
    /// back to an NCX file if the navigation document is missing or broken.
    /// EPUB 2 publications are read from the NCX file.
    ///
    /// Errors are returned rather than logged so that callers can decide on a
    /// replacement table of contents.
    pub fn navigation_tree(&self) -> Result<Vec<NavPoint>, EpubError> {
        match self.version {
            EpubVersion::Version3_0 => self.parse_nav_document().or_else(|err| {
                if self.ncx_item().is_none() {
                    return Err(err);
                }
                warn!("Navigation document unusable ({}), trying the NCX file", err);
                self.parse_ncx()
            }),
            EpubVersion::Version2_0 => self.parse_ncx(),
        }
    }

    fn ncx_item(&self) -> Option<&ManifestItem> {
        self.toc_id
            .as_ref()
            .and_then(|id| self.manifest.get(id))
            .or_else(|| self.manifest.values().find(|item| item.mime == NCX_MIME))
    }

    fn parse_ncx(&self) -> Result<Vec<NavPoint>, EpubError> {
        let ncx_path = self
            .ncx_item()
            .map(|item| item.path.clone())
            .ok_or_else(|| EpubError::NonCanonicalEpub {
                expected_file: "NCX".to_string(),
            })?;

        let ncx = XmlReader::parse_bytes(&self.get_resource(&ncx_path)?)?;
        let nav_map =
            ncx.find_elements_by_name("navMap")
                .next()
                .ok_or_else(|| EpubError::NonCanonicalFile {
                    tag: "navMap".to_string(),
                })?;

        Ok(Self::parse_nav_points(nav_map))
    }

    fn parse_nav_document(&self) -> Result<Vec<NavPoint>, EpubError> {
        let nav_path = self
            .manifest
            .values()
            .find(|item| item.has_property("nav"))
            .map(|item| item.path.clone())
            .ok_or_else(|| EpubError::NonCanonicalEpub {
                expected_file: "Navigation Document".to_string(),
            })?;

        let nav_element = XmlReader::parse_bytes(&self.get_resource(&nav_path)?)?;
        let nav = nav_element
            .find_elements_by_name("nav")
            .find(|&element| element.get_attr("epub:type").as_deref() == Some("toc"))
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "nav".to_string(),
            })?;
        let nav_list = nav.find_children_by_name("ol").next().ok_or_else(|| {
            EpubError::NonCanonicalFile {
                tag: "ol".to_string(),
            }
        })?;

        Self::parse_catalog_list(nav_list)
    }

    /// Recursively parse NCX navigation points from navMap or nested navPoint elements
    ///
    /// Siblings are ordered by `playOrder` when present; the sort is stable,
    /// so points without a play order keep their document order.
    fn parse_nav_points(parent_element: &XmlElement) -> Vec<NavPoint> {
        let mut nav_points = Vec::new();
        for nav_point in parent_element.find_children_by_name("navPoint") {
            let label = nav_point
                .find_children_by_name("navLabel")
                .next()
                .map(|element| element.text().normalize_whitespace())
                .unwrap_or_default();

            let content = nav_point
                .find_children_by_name("content")
                .next()
                .and_then(|element| element.get_attr("src"));

            let play_order = nav_point
                .get_attr("playOrder")
                .and_then(|order| order.trim().parse::<usize>().ok());

            nav_points.push(NavPoint {
                label,
                content,
                play_order,
                children: Self::parse_nav_points(nav_point),
            });
        }

        if nav_points.iter().all(|point| point.play_order.is_some()) {
            nav_points.sort_by_key(|point| point.play_order);
        }
        nav_points
    }

    /// Recursively parses `<ol>`/`<li>` lists of the navigation document
    fn parse_catalog_list(element: &XmlElement) -> Result<Vec<NavPoint>, EpubError> {
        let mut catalog = Vec::new();
        for item in element.children() {
            if item.name != "li" {
                return Err(EpubError::NonCanonicalFile {
                    tag: "li".to_string(),
                });
            }

            let title_element = item
                .find_children_by_names(&["a", "span"])
                .next()
                .ok_or_else(|| EpubError::NonCanonicalFile {
                    tag: "span/a".to_string(),
                })?;
            let sub_list = match item.find_children_by_name("ol").next() {
                Some(list) => Self::parse_catalog_list(list)?,
                None => vec![],
            };

            catalog.push(NavPoint {
                label: title_element.text().normalize_whitespace(),
                content: title_element.get_attr("href"),
                children: sub_list,
                play_order: None,
            });
        }

        Ok(catalog)
    }

    /// Checks if a resource at the specified path is an encrypted file
    fn is_encryption_file(&self, path: &str) -> Option<&str> {
        self.encryption.as_ref().and_then(|encryptions| {
            encryptions
                .iter()
                .find(|encryption| encryption.data == path)
                .map(|encryption| encryption.method.as_str())
        })
    }

    /// Automatically decrypts encrypted resource data
    ///
    /// # Supported Encryption Methods
    /// - IDPF font obfuscation: `http://www.idpf.org/2008/embedding`
    /// - Adobe font obfuscation: `http://ns.adobe.com/pdf/enc#RC`
    #[inline]
    fn auto_dencrypt(&self, method: &str, data: &[u8]) -> Result<Vec<u8>, EpubError> {
        match method {
            "http://www.idpf.org/2008/embedding" => {
                Ok(idpf_font_dencryption(data, &self.unique_identifier))
            }
            "http://ns.adobe.com/pdf/enc#RC" => {
                Ok(adobe_font_dencryption(data, &self.unique_identifier))
            }
            _ => Err(EpubError::UnsupportedEncryptedMethod {
                method: method.to_string(),
            }),
        }
    }
}

impl EpubDoc<BufReader<File>> {
    /// Creates a new EPUB document instance from a file path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, EpubError> {
        let file = File::open(&path).map_err(EpubError::from)?;

        Self::from_reader(BufReader::new(file), path.as_ref())
    }
}
