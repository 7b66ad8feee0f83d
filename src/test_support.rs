//! In-memory EPUB archives for unit tests

use std::io::{Cursor, Write};

use zip::{CompressionMethod, ZipWriter, write::FileOptions};

use crate::epub::EpubDoc;

pub(crate) const SAMPLE_UID: &str = "urn:uuid:12345678-1234-1234-1234-123456789abc";
pub(crate) const COVER_JPG: &[u8] = b"\xFF\xD8\xFFcover";
pub(crate) const SPACED_PNG: &[u8] = b"\x89PNGspaced";

const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
    <rootfiles>
        <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
    </rootfiles>
</container>"#;

/// Builder for a zip container holding arbitrary entries
pub(crate) struct EpubFixture {
    files: Vec<(String, Vec<u8>)>,
}

impl EpubFixture {
    /// A container with only the `mimetype` entry
    pub(crate) fn bare() -> Self {
        Self {
            files: vec![("mimetype".to_string(), b"application/epub+zip".to_vec())],
        }
    }

    /// A container whose `container.xml` points at `OEBPS/content.opf`
    pub(crate) fn new() -> Self {
        Self::bare().file("META-INF/container.xml", CONTAINER)
    }

    /// Adds an entry, replacing any previous entry with the same path
    pub(crate) fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        match self.files.iter_mut().find(|(name, _)| name == path) {
            Some(entry) => entry.1 = data,
            None => self.files.push((path.to_string(), data)),
        }
        self
    }

    /// A package document with the sample metadata and a plain spine
    pub(crate) fn package(version: &str, manifest: &str, spine: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="{version}" unique-identifier="uid">
    <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
        <dc:identifier id="uid">{SAMPLE_UID}</dc:identifier>
        <dc:title>Sample Book</dc:title>
        <dc:language>en</dc:language>
    </metadata>
    <manifest>{manifest}</manifest>
    <spine>{spine}</spine>
</package>"#
        )
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);

        for (path, data) in &self.files {
            zip.start_file(path.as_str(), options).unwrap();
            zip.write_all(data).unwrap();
        }

        zip.finish().unwrap().into_inner()
    }

    pub(crate) fn open(self) -> EpubDoc<Cursor<Vec<u8>>> {
        EpubDoc::from_reader(Cursor::new(self.build()), "sample.epub").unwrap()
    }
}

fn chapter(title: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body>{body}</body>
</html>"#
    )
}

/// An EPUB 2 book with three chapters, two images and a nested NCX
///
/// Chapter 1 (0-based) references `images/cover.jpg` and the same
/// `images/my cover.png` twice, once percent-encoded. Chapter 2 references an
/// image that does not exist.
pub(crate) fn sample_book() -> EpubFixture {
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
    <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
        <dc:identifier id="uid">urn:uuid:12345678-1234-1234-1234-123456789abc</dc:identifier>
        <dc:title>Sample Book</dc:title>
        <dc:creator>Jane Doe</dc:creator>
        <dc:language>en</dc:language>
        <meta name="cover" content="cover"/>
    </metadata>
    <manifest>
        <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
        <item id="chapter1" href="chapter1.xhtml" media-type="application/xhtml+xml"/>
        <item id="chapter2" href="chapter2.xhtml" media-type="application/xhtml+xml"/>
        <item id="chapter3" href="chapter3.xhtml" media-type="application/xhtml+xml"/>
        <item id="cover" href="images/cover.jpg" media-type="image/jpeg"/>
        <item id="spaced" href="images/my%20cover.png" media-type="image/png"/>
        <item id="style" href="styles/main.css" media-type="text/css"/>
    </manifest>
    <spine toc="ncx">
        <itemref idref="chapter1"/>
        <itemref idref="chapter2"/>
        <itemref idref="chapter3"/>
    </spine>
</package>"#;

    let ncx = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
    <head><meta name="dtb:uid" content="urn:uuid:12345678-1234-1234-1234-123456789abc"/></head>
    <docTitle><text>Sample Book</text></docTitle>
    <navMap>
        <navPoint id="p1" playOrder="1">
            <navLabel><text>Opening</text></navLabel>
            <content src="chapter1.xhtml"/>
        </navPoint>
        <navPoint id="p2" playOrder="2">
            <navLabel><text>Part Two</text></navLabel>
            <content src="chapter2.xhtml"/>
            <navPoint id="p3" playOrder="3">
                <navLabel><text>Middle &amp; More</text></navLabel>
                <content src="chapter2.xhtml#mid"/>
            </navPoint>
            <navPoint id="p4" playOrder="4">
                <navLabel><text>Ending</text></navLabel>
                <content src="chapter3.xhtml#end"/>
            </navPoint>
        </navPoint>
    </navMap>
</ncx>"#;

    EpubFixture::new()
        .file("OEBPS/content.opf", opf)
        .file("OEBPS/toc.ncx", ncx)
        .file(
            "OEBPS/chapter1.xhtml",
            chapter("One", "<p>First chapter</p>"),
        )
        .file(
            "OEBPS/chapter2.xhtml",
            chapter(
                "Two",
                r#"<p id="mid">Second chapter</p>
<img src="images/cover.jpg" alt="Cover"/>
<IMG class="wide" SRC='images/my%20cover.png'>
<img data-src="lazy.png" src="images/my cover.png"/>"#,
            ),
        )
        .file(
            "OEBPS/chapter3.xhtml",
            chapter(
                "Three",
                r#"<p id="end">Last chapter</p><img src="../nowhere/missing.gif"/>"#,
            ),
        )
        .file("OEBPS/images/cover.jpg", COVER_JPG)
        .file("OEBPS/images/my cover.png", SPACED_PNG)
        .file("OEBPS/styles/main.css", "body { margin: 0; }")
}

/// An EPUB 3 book with a navigation document and chapters in a subdirectory
pub(crate) fn sample_book_v3() -> EpubFixture {
    let nav = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body>
    <nav epub:type="landmarks"><ol><li><a href="text/c2.xhtml">Start</a></li></ol></nav>
    <nav epub:type="toc">
        <h1>Contents</h1>
        <ol>
            <li><a href="text/c1.xhtml">One</a></li>
            <li>
                <span>Group</span>
                <ol><li><a href="text/c2.xhtml">Two</a></li></ol>
            </li>
        </ol>
    </nav>
</body>
</html>"#;

    EpubFixture::new()
        .file(
            "OEBPS/content.opf",
            EpubFixture::package(
                "3.0",
                r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
                   <item id="c1" href="text/c1.xhtml" media-type="application/xhtml+xml"/>
                   <item id="c2" href="text/c2.xhtml" media-type="application/xhtml+xml"/>"#,
                r#"<itemref idref="c1"/><itemref idref="c2"/>"#,
            ),
        )
        .file("OEBPS/nav.xhtml", nav)
        .file("OEBPS/text/c1.xhtml", chapter("One", "<p>One</p>"))
        .file("OEBPS/text/c2.xhtml", chapter("Two", "<p>Two</p>"))
}
