//! Chapter content pipeline
//!
//! Turns the raw content documents of the loaded book into displayable HTML
//! with every resolvable image inlined as a `data:` URI, or replaced by a
//! placeholder while images are hidden. Rendered chapters are cached per
//! index until the book or the image visibility changes.
//!
//! Every cache clear bumps a generation counter. Work that started under an
//! older generation never ends up in the cache, which is what makes it safe
//! to render chapters on the prefetch workers while the interactive thread
//! switches books or toggles images.

use std::{
    collections::{HashMap, HashSet},
    io::{Read, Seek},
    sync::{Arc, LazyLock, Mutex},
};

use log::{debug, warn};
use quick_xml::escape::escape;
use regex::{Captures, Regex};

use crate::{
    epub::EpubDoc,
    error::EpubError,
    images::ImageIndex,
    utils::{DecodeBytes, last_segment, percent_decode},
};

static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\ssrc\s*=\s*["']([^"'>]+)["'][^>]*>"#).unwrap()
});

const PLACEHOLDER_STYLE: &str =
    "border:1px dashed #999;padding:10px;margin:10px 0;text-align:center;color:#666;";

/// A loaded archive together with its image index
///
/// Both are built once per load and shared read-only between the
/// interactive thread and the prefetch workers.
pub struct Book<R: Read + Seek> {
    pub doc: EpubDoc<R>,
    pub images: ImageIndex,
}

impl<R: Read + Seek> Book<R> {
    pub fn new(doc: EpubDoc<R>) -> Self {
        let images = ImageIndex::build(&doc);
        Self { doc, images }
    }

    pub fn chapter_count(&self) -> usize {
        self.doc.chapter_count()
    }

    /// Reads, decodes and rewrites one chapter, bypassing any cache
    pub fn render_chapter(&self, index: usize, show_images: bool) -> Result<String, EpubError> {
        let raw = self.doc.raw_chapter(index)?;
        if raw.is_empty() {
            return Ok(String::new());
        }

        let html = raw.decode().map_err(|err| {
            warn!("Chapter {} could not be decoded: {}", index, err);
            EpubError::ChapterDecodeError { index }
        })?;

        Ok(rewrite_images(&html, &self.images, show_images))
    }
}

/// Rewrites every `<img>` tag of `html`
///
/// With `show_images`, the `src` value of each tag is replaced by the data
/// URI of the image it resolves to; tags that do not resolve are left as they
/// are. Without `show_images`, each tag is replaced by a placeholder naming
/// the image file.
pub fn rewrite_images(html: &str, images: &ImageIndex, show_images: bool) -> String {
    IMG_TAG
        .replace_all(html, |caps: &Captures| {
            let (Some(tag), Some(src)) = (caps.get(0), caps.get(1)) else {
                return String::new();
            };

            if !show_images {
                return placeholder(src.as_str());
            }

            match images.resolve(src.as_str()) {
                Some(image) => {
                    let start = src.start() - tag.start();
                    let end = src.end() - tag.start();
                    let tag = tag.as_str();
                    format!("{}{}{}", &tag[..start], image.data_uri(), &tag[end..])
                }
                None => {
                    debug!("Image \"{}\" not found in the archive", src.as_str());
                    tag.as_str().to_string()
                }
            }
        })
        .into_owned()
}

fn placeholder(src: &str) -> String {
    let decoded = percent_decode(src);
    format!(
        r#"<div style="{}">[Image: {}]</div>"#,
        PLACEHOLDER_STYLE,
        escape(last_segment(&decoded))
    )
}

struct PipelineState<R: Read + Seek> {
    book: Option<Arc<Book<R>>>,
    show_images: bool,
    generation: u64,
    entries: HashMap<usize, String>,
    in_flight: HashSet<usize>,
}

impl<R: Read + Seek> PipelineState<R> {
    fn invalidate(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
        self.generation += 1;
    }
}

/// Cache of rendered chapters for the currently loaded book
pub struct ChapterPipeline<R: Read + Seek> {
    state: Mutex<PipelineState<R>>,
}

impl<R: Read + Seek> Default for ChapterPipeline<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read + Seek> ChapterPipeline<R> {
    /// Creates an empty pipeline with images shown
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState {
                book: None,
                show_images: true,
                generation: 0,
                entries: HashMap::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Makes `book` the current book and drops everything cached for the
    /// previous one
    pub fn load(&self, book: Arc<Book<R>>) -> Result<(), EpubError> {
        let mut state = self.state.lock()?;
        state.book = Some(book);
        state.invalidate();
        Ok(())
    }

    /// Switches between inlined images and placeholders
    ///
    /// Nothing happens if the visibility does not change. Otherwise the cache
    /// is cleared; chapters are rendered again when next requested.
    pub fn set_image_visibility(&self, visible: bool) -> Result<(), EpubError> {
        let mut state = self.state.lock()?;
        if state.show_images != visible {
            state.show_images = visible;
            state.invalidate();
        }
        Ok(())
    }

    /// Returns the displayable HTML of chapter `index`
    ///
    /// # Return
    /// - `Ok(String)`: The cached or freshly rendered chapter
    /// - `Err(EpubError::NoArchiveLoaded)`: No book has been loaded
    /// - `Err(EpubError::ChapterNotFound)`: `index` is out of range
    /// - `Err(EpubError::ChapterDecodeError)`: The chapter is not valid text
    pub fn get_content(&self, index: usize) -> Result<String, EpubError> {
        let (generation, book, show_images) = {
            let state = self.state.lock()?;
            if let Some(html) = state.entries.get(&index) {
                return Ok(html.clone());
            }

            let book = state.book.clone().ok_or(EpubError::NoArchiveLoaded)?;
            (state.generation, book, state.show_images)
        };

        let html = book.render_chapter(index, show_images)?;
        self.store(generation, index, &html)?;
        Ok(html)
    }

    /// Caches `html` unless the generation moved on since `generation` was read
    fn store(&self, generation: u64, index: usize, html: &str) -> Result<bool, EpubError> {
        let mut state = self.state.lock()?;
        if state.generation != generation {
            debug!(
                "Discarding chapter {} rendered under generation {} (now {})",
                index, generation, state.generation
            );
            return Ok(false);
        }

        state.entries.insert(index, html.to_string());
        Ok(true)
    }

    /// Reserves `index` for a background render
    ///
    /// # Return
    /// - `Some(generation)`: The chapter is neither cached nor being rendered;
    ///   the caller must finish with [`ChapterPipeline::populate`]
    /// - `None`: Nothing to do
    pub(crate) fn claim(&self, index: usize) -> Result<Option<u64>, EpubError> {
        let mut state = self.state.lock()?;
        let in_range = state
            .book
            .as_ref()
            .is_some_and(|book| index < book.chapter_count());

        if !in_range || state.entries.contains_key(&index) || state.in_flight.contains(&index) {
            return Ok(None);
        }

        state.in_flight.insert(index);
        Ok(Some(state.generation))
    }

    /// Renders a claimed chapter and caches it if `generation` is still current
    ///
    /// Returns whether the result was cached. The claim is released in every
    /// case.
    pub(crate) fn populate(&self, index: usize, generation: u64) -> Result<bool, EpubError> {
        let result = self.render_claimed(index, generation);

        let mut state = self.state.lock()?;
        if state.generation == generation {
            state.in_flight.remove(&index);
        }

        result
    }

    fn render_claimed(&self, index: usize, generation: u64) -> Result<bool, EpubError> {
        let (book, show_images) = {
            let state = self.state.lock()?;
            if state.generation != generation {
                return Ok(false);
            }

            let book = state.book.clone().ok_or(EpubError::NoArchiveLoaded)?;
            (book, state.show_images)
        };

        let html = book.render_chapter(index, show_images)?;
        self.store(generation, index, &html)
    }

    /// Number of chapters of the current book, 0 if none is loaded
    pub fn chapter_count(&self) -> Result<usize, EpubError> {
        let state = self.state.lock()?;
        Ok(state.book.as_ref().map_or(0, |book| book.chapter_count()))
    }

    pub fn is_cached(&self, index: usize) -> Result<bool, EpubError> {
        Ok(self.state.lock()?.entries.contains_key(&index))
    }

    /// Cached chapter indices in ascending order
    pub fn cached_indices(&self) -> Result<Vec<usize>, EpubError> {
        let state = self.state.lock()?;
        let mut indices = state.entries.keys().copied().collect::<Vec<_>>();
        indices.sort_unstable();
        Ok(indices)
    }

    pub fn generation(&self) -> Result<u64, EpubError> {
        Ok(self.state.lock()?.generation)
    }

    pub fn show_images(&self) -> Result<bool, EpubError> {
        Ok(self.state.lock()?.show_images)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

    use crate::{
        content::{Book, ChapterPipeline, rewrite_images},
        error::EpubError,
        images::ImageIndex,
        test_support::{COVER_JPG, EpubFixture, SPACED_PNG, sample_book},
    };

    type TestPipeline = ChapterPipeline<Cursor<Vec<u8>>>;

    fn loaded(fixture: EpubFixture) -> TestPipeline {
        let pipeline = ChapterPipeline::new();
        pipeline.load(Arc::new(Book::new(fixture.open()))).unwrap();
        pipeline
    }

    fn single_chapter(body: impl Into<Vec<u8>>) -> EpubFixture {
        EpubFixture::new()
            .file(
                "OEBPS/content.opf",
                EpubFixture::package(
                    "2.0",
                    r#"<item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
                       <item id="b" href="b.xhtml" media-type="application/xhtml+xml"/>"#,
                    r#"<itemref idref="a"/><itemref idref="b"/>"#,
                ),
            )
            .file("OEBPS/a.xhtml", body)
            .file("OEBPS/b.xhtml", "<p>fine</p>")
    }

    mod rewrite {
        use super::*;

        #[test]
        fn test_no_images_is_unchanged() {
            let index = ImageIndex::default();
            let html = "<p>plain <b>text</b> with <imgx src=\"a.png\"></p>";
            assert_eq!(rewrite_images(html, &index, true), html);
            assert_eq!(rewrite_images(html, &index, false), html);
        }

        #[test]
        fn test_unresolved_tag_is_untouched() {
            let index = ImageIndex::default();
            let html = r#"<p><img alt="x" src="missing.png"/></p>"#;
            assert_eq!(rewrite_images(html, &index, true), html);
        }

        #[test]
        fn test_placeholder_escapes_name() {
            let index = ImageIndex::default();
            let html = r#"<img src="pics/a%26b%3C1%3E.png">"#;
            assert_eq!(
                rewrite_images(html, &index, false),
                r#"<div style="border:1px dashed #999;padding:10px;margin:10px 0;text-align:center;color:#666;">[Image: a&amp;b&lt;1&gt;.png]</div>"#
            );
        }

        #[test]
        fn test_data_src_is_not_src() {
            let index = ImageIndex::default();
            let html = r#"<img data-src="lazy.png" alt="">"#;
            assert_eq!(rewrite_images(html, &index, false), html);
        }
    }

    /// Chapter 1 references `images/cover.jpg`
    #[test]
    fn test_cover_scenario() {
        let pipeline = loaded(sample_book());
        let cover_uri = format!("data:image/jpeg;base64,{}", BASE64.encode(COVER_JPG));

        let shown = pipeline.get_content(1).unwrap();
        assert!(shown.contains(&cover_uri));
        assert!(!shown.contains("images/cover.jpg"));
        assert!(shown.contains(r#"alt="Cover""#));

        pipeline.set_image_visibility(false).unwrap();
        let hidden = pipeline.get_content(1).unwrap();
        assert!(hidden.contains("[Image: cover.jpg]"));
        assert!(hidden.contains("[Image: my cover.png]"));
        assert!(!hidden.to_lowercase().contains("<img"));
        assert!(!hidden.contains("data:image"));
    }

    #[test]
    fn test_percent_encoded_reference_gets_same_uri() {
        let pipeline = loaded(sample_book());
        let spaced_uri = format!("data:image/png;base64,{}", BASE64.encode(SPACED_PNG));

        let html = pipeline.get_content(1).unwrap();
        assert_eq!(html.matches(&spaced_uri).count(), 2);
        assert!(html.contains(r#"data-src="lazy.png""#));
        assert!(html.contains(r#"class="wide""#));
    }

    #[test]
    fn test_missing_image_left_in_place() {
        let pipeline = loaded(sample_book());
        let html = pipeline.get_content(2).unwrap();
        assert!(html.contains(r#"<img src="../nowhere/missing.gif"/>"#));
    }

    #[test]
    fn test_get_content_is_idempotent() {
        let pipeline = loaded(sample_book());

        assert!(!pipeline.is_cached(1).unwrap());
        let first = pipeline.get_content(1).unwrap();
        assert!(pipeline.is_cached(1).unwrap());
        let second = pipeline.get_content(1).unwrap();

        assert_eq!(first, second);
        assert_eq!(pipeline.cached_indices().unwrap(), vec![1]);
    }

    #[test]
    fn test_visibility_round_trip() {
        let pipeline = loaded(sample_book());
        let original = pipeline.get_content(1).unwrap();
        let generation = pipeline.generation().unwrap();

        pipeline.set_image_visibility(true).unwrap();
        assert_eq!(pipeline.generation().unwrap(), generation);
        assert!(pipeline.is_cached(1).unwrap());

        pipeline.set_image_visibility(false).unwrap();
        assert_eq!(pipeline.generation().unwrap(), generation + 1);
        assert!(pipeline.cached_indices().unwrap().is_empty());
        assert!(!pipeline.show_images().unwrap());
        assert_ne!(pipeline.get_content(1).unwrap(), original);

        pipeline.set_image_visibility(true).unwrap();
        assert_eq!(pipeline.get_content(1).unwrap(), original);
    }

    #[test]
    fn test_nothing_loaded() {
        let pipeline = TestPipeline::new();
        assert_eq!(
            pipeline.get_content(0).unwrap_err(),
            EpubError::NoArchiveLoaded
        );
        assert_eq!(pipeline.chapter_count().unwrap(), 0);
        assert_eq!(pipeline.claim(0).unwrap(), None);
    }

    #[test]
    fn test_out_of_range() {
        let pipeline = loaded(sample_book());
        assert_eq!(
            pipeline.get_content(3).unwrap_err(),
            EpubError::ChapterNotFound { index: 3, count: 3 }
        );
        assert!(pipeline.cached_indices().unwrap().is_empty());
    }

    #[test]
    fn test_undecodable_chapter_is_isolated() {
        let pipeline = loaded(single_chapter(b"<p>\xC3\x28</p>".to_vec()));

        assert_eq!(
            pipeline.get_content(0).unwrap_err(),
            EpubError::ChapterDecodeError { index: 0 }
        );
        assert_eq!(pipeline.get_content(1).unwrap(), "<p>fine</p>");
        assert_eq!(pipeline.cached_indices().unwrap(), vec![1]);
    }

    #[test]
    fn test_utf16_and_empty_chapters() {
        let mut utf16 = vec![0xFF, 0xFE];
        for unit in "<p>wide</p>".encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }

        let pipeline = loaded(single_chapter(utf16));
        assert_eq!(pipeline.get_content(0).unwrap(), "<p>wide</p>");

        let pipeline = loaded(single_chapter(Vec::new()));
        assert_eq!(pipeline.get_content(0).unwrap(), "");
    }

    #[test]
    fn test_claim_and_populate() {
        let pipeline = loaded(sample_book());

        let generation = pipeline.claim(0).unwrap().unwrap();
        assert_eq!(pipeline.claim(0).unwrap(), None);
        assert_eq!(pipeline.claim(3).unwrap(), None);

        assert!(pipeline.populate(0, generation).unwrap());
        assert!(pipeline.is_cached(0).unwrap());
        assert_eq!(pipeline.claim(0).unwrap(), None);
    }

    #[test]
    fn test_stale_populate_is_discarded() {
        let pipeline = loaded(sample_book());
        let generation = pipeline.claim(0).unwrap().unwrap();

        pipeline
            .load(Arc::new(Book::new(single_chapter("<p>new</p>").open())))
            .unwrap();

        assert!(!pipeline.populate(0, generation).unwrap());
        assert!(!pipeline.is_cached(0).unwrap());
        assert_eq!(pipeline.get_content(0).unwrap(), "<p>new</p>");
    }

    #[test]
    fn test_failed_populate_releases_claim() {
        let pipeline = loaded(single_chapter(b"\xC3\x28".to_vec()));
        let generation = pipeline.claim(0).unwrap().unwrap();

        assert!(pipeline.populate(0, generation).is_err());
        assert_eq!(pipeline.claim(0).unwrap(), Some(generation));
    }
}
