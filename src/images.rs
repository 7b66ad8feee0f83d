//! Image lookup for chapter rewriting
//!
//! Content documents reference images relative to their own location, with or
//! without percent-encoding. [`ImageIndex`] keys every image of the manifest
//! under several spellings so that a reference can be resolved without
//! knowing which chapter it came from.

use std::{
    collections::HashMap,
    io::{Read, Seek},
    path::Path,
    sync::Arc,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::{debug, warn};

use crate::{
    epub::EpubDoc,
    utils::{last_segment, percent_decode},
};

/// An image payload loaded from the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResource {
    /// The manifest `href` as written in the package document
    pub href: String,

    /// Path relative to the container root
    pub path: String,

    /// Media type derived from the file extension, see [`mime_for`]
    pub mime: String,

    pub data: Vec<u8>,
}

impl ImageResource {
    /// Encodes the payload as a `data:` URI that can replace an `src` value
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.data))
    }
}

/// Returns the media type for an image file name
///
/// Unknown or missing extensions map to `image/jpeg`.
pub fn mime_for(name: &str) -> &'static str {
    let extension = last_segment(name)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Multi-key map from image references to loaded image payloads
#[derive(Debug, Default)]
pub struct ImageIndex {
    entries: HashMap<String, Arc<ImageResource>>,
}

impl ImageIndex {
    /// Loads every image declared in the manifest of `doc`
    ///
    /// Each image is reachable by its declared href (raw and percent-decoded),
    /// its container path, the text after the last `/` and its basename as
    /// seen by the host platform. When two images share a key, the one
    /// declared first keeps it.
    pub fn build<R: Read + Seek>(doc: &EpubDoc<R>) -> Self {
        let mut entries = HashMap::new();

        for item in doc.manifest.values().filter(|item| item.is_image()) {
            let data = match doc.get_resource(&item.path) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Image \"{}\" could not be read: {}", item.path, err);
                    continue;
                }
            };

            let resource = Arc::new(ImageResource {
                href: item.href.clone(),
                path: item.path.clone(),
                mime: mime_for(&item.path).to_string(),
                data,
            });

            let basename = Path::new(&item.path)
                .file_name()
                .map(|name| name.to_string_lossy().to_string());
            let keys = [
                Some(item.href.clone()),
                Some(percent_decode(&item.href).to_string()),
                Some(item.path.clone()),
                Some(last_segment(&item.path).to_string()),
                basename,
            ];

            for key in keys.into_iter().flatten() {
                entries.entry(key).or_insert_with(|| Arc::clone(&resource));
            }
        }

        debug!("Indexed {} image keys", entries.len());
        Self { entries }
    }

    /// Looks up the image a content document refers to
    ///
    /// The reference is percent-decoded and looked up as is; failing that,
    /// only the text after its last `/` is used.
    pub fn resolve(&self, referenced: &str) -> Option<Arc<ImageResource>> {
        let decoded = percent_decode(referenced.trim());

        self.entries
            .get(decoded.as_ref())
            .or_else(|| self.entries.get(last_segment(&decoded)))
            .cloned()
    }

    /// Number of lookup keys, not of distinct images
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

    use crate::{
        images::{ImageIndex, ImageResource, mime_for},
        test_support::{COVER_JPG, EpubFixture, SPACED_PNG, sample_book},
    };

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("cover.jpg"), "image/jpeg");
        assert_eq!(mime_for("images/Cover.JPEG"), "image/jpeg");
        assert_eq!(mime_for("a.png"), "image/png");
        assert_eq!(mime_for("a.gif"), "image/gif");
        assert_eq!(mime_for("a.svg"), "image/svg+xml");
        assert_eq!(mime_for("a.webp"), "image/webp");
        assert_eq!(mime_for("a.bmp"), "image/jpeg");
        assert_eq!(mime_for("noext"), "image/jpeg");
        assert_eq!(mime_for("dir.png/noext"), "image/jpeg");
    }

    #[test]
    fn test_data_uri() {
        let resource = ImageResource {
            href: "a.png".to_string(),
            path: "a.png".to_string(),
            mime: "image/png".to_string(),
            data: b"hello".to_vec(),
        };
        assert_eq!(resource.data_uri(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn test_build_only_indexes_images() {
        let doc = sample_book().open();
        let index = ImageIndex::build(&doc);

        assert!(!index.is_empty());
        assert!(index.resolve("styles/main.css").is_none());
        assert!(index.resolve("main.css").is_none());
        assert!(index.resolve("chapter1.xhtml").is_none());
    }

    #[test]
    fn test_resolve_spellings() {
        let doc = sample_book().open();
        let index = ImageIndex::build(&doc);

        let cover = index.resolve("images/cover.jpg").unwrap();
        assert_eq!(cover.data, COVER_JPG.to_vec());
        assert_eq!(cover.mime, "image/jpeg");
        assert_eq!(cover.path, "OEBPS/images/cover.jpg");

        for reference in [
            "OEBPS/images/cover.jpg",
            "cover.jpg",
            "../images/cover.jpg",
            "images/cover%2Ejpg",
        ] {
            assert!(Arc::ptr_eq(&cover, &index.resolve(reference).unwrap()));
        }
    }

    #[test]
    fn test_resolve_percent_encoded() {
        let doc = sample_book().open();
        let index = ImageIndex::build(&doc);

        let plain = index.resolve("images/my cover.png").unwrap();
        let encoded = index.resolve("images/my%20cover.png").unwrap();
        assert!(Arc::ptr_eq(&plain, &encoded));
        assert_eq!(plain.data, SPACED_PNG.to_vec());
        assert_eq!(plain.data_uri(), encoded.data_uri());
        assert_eq!(
            plain.data_uri(),
            format!("data:image/png;base64,{}", BASE64.encode(SPACED_PNG))
        );
    }

    #[test]
    fn test_resolve_unknown() {
        let doc = sample_book().open();
        let index = ImageIndex::build(&doc);

        assert!(index.resolve("images/nothing.png").is_none());
        assert!(index.resolve("").is_none());
        assert!(index.resolve("%%%").is_none());
        assert!(index.resolve("images/").is_none());
    }

    #[test]
    fn test_unreadable_image_is_skipped() {
        let doc = EpubFixture::new()
            .file(
                "OEBPS/content.opf",
                EpubFixture::package(
                    "2.0",
                    r#"<item id="c" href="c.xhtml" media-type="application/xhtml+xml"/>
                       <item id="gone" href="gone.png" media-type="image/png"/>
                       <item id="here" href="here.gif" media-type="image/gif"/>"#,
                    r#"<itemref idref="c"/>"#,
                ),
            )
            .file("OEBPS/c.xhtml", "<html/>")
            .file("OEBPS/here.gif", "GIF89a")
            .open();

        let index = ImageIndex::build(&doc);
        assert!(index.resolve("gone.png").is_none());
        assert_eq!(index.resolve("here.gif").unwrap().mime, "image/gif");
    }
}
