//! The interface a presentation layer drives
//!
//! A [`Reader`] owns the currently loaded book, the chapter pipeline and the
//! prefetch workers. It is meant to be used from one interactive thread.

use std::{
    cmp::min,
    fs::File,
    io::{BufReader, Read, Seek},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    content::{Book, ChapterPipeline},
    epub::EpubDoc,
    error::EpubError,
    prefetch::PrefetchScheduler,
    settings::Settings,
    toc,
    types::TocEntry,
};

pub struct Reader<R: Read + Seek = BufReader<File>> {
    book: Option<Arc<Book<R>>>,
    title: String,
    pipeline: Arc<ChapterPipeline<R>>,
    prefetch: PrefetchScheduler<R>,
}

impl<R: Read + Seek + Send + 'static> Reader<R> {
    /// Creates a reader with no book loaded and starts the prefetch workers
    pub fn new() -> Result<Self, EpubError> {
        let pipeline = Arc::new(ChapterPipeline::new());
        let prefetch = PrefetchScheduler::new(Arc::clone(&pipeline))?;

        Ok(Self {
            book: None,
            title: String::new(),
            pipeline,
            prefetch,
        })
    }

    /// Opens an archive from `reader` and makes it the current book
    ///
    /// `path` is used for logging and as the title of books without one. On
    /// error the previously loaded book stays current.
    ///
    /// # Return
    /// - `Ok(String)`: The title of the book
    /// - `Err(EpubError)`: The archive could not be opened
    pub fn load_from_reader<P: Into<PathBuf>>(
        &mut self,
        reader: R,
        path: P,
    ) -> Result<String, EpubError> {
        let doc = EpubDoc::from_reader(reader, path)?;

        let title = doc
            .get_title()
            .ok()
            .and_then(|titles| titles.into_iter().find(|title| !title.is_empty()))
            .unwrap_or_else(|| fallback_title(doc.epub_path()));

        let book = Arc::new(Book::new(doc));
        self.pipeline.load(Arc::clone(&book))?;

        info!(
            "Loaded \"{}\" with {} chapters",
            title,
            book.chapter_count()
        );
        self.book = Some(book);
        self.title = title.clone();

        Ok(title)
    }

    /// The loaded book, if any
    pub fn book(&self) -> Option<&Book<R>> {
        self.book.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.book.as_ref().map(|_| self.title.as_str())
    }

    pub fn chapter_count(&self) -> usize {
        self.book.as_ref().map_or(0, |book| book.chapter_count())
    }

    /// Displayable HTML of chapter `index`, see [`ChapterPipeline::get_content`]
    pub fn chapter_html(&self, index: usize) -> Result<String, EpubError> {
        self.pipeline.get_content(index)
    }

    pub fn set_image_visibility(&self, visible: bool) -> Result<(), EpubError> {
        self.pipeline.set_image_visibility(visible)
    }

    pub fn show_images(&self) -> Result<bool, EpubError> {
        self.pipeline.show_images()
    }

    /// Indices of the chapters rendered so far
    pub fn cached_chapters(&self) -> Result<Vec<usize>, EpubError> {
        self.pipeline.cached_indices()
    }

    /// Flat table of contents of the loaded book; empty if none is loaded
    pub fn flat_toc(&self) -> Vec<TocEntry> {
        self.book
            .as_ref()
            .map(|book| toc::flat_toc(&book.doc))
            .unwrap_or_default()
    }

    /// Tells the reader that chapter `index` is being displayed
    ///
    /// Starts background renders of the neighbouring chapters and returns the
    /// indices that were submitted.
    pub fn notify_displayed(&self, index: usize) -> Result<Vec<usize>, EpubError> {
        self.prefetch.schedule(index)
    }

    /// Blocks until all background renders have finished
    pub fn wait_for_prefetch(&self) -> Result<(), EpubError> {
        self.prefetch.wait_idle()
    }

    /// Applies the content related parts of `settings`
    pub fn apply_settings(&self, settings: &Settings) -> Result<(), EpubError> {
        self.set_image_visibility(settings.show_images)
    }

    /// Chapter to show after loading, the stored one clamped into range
    pub fn resume_chapter(&self, settings: &Settings) -> usize {
        min(settings.current_chapter, self.chapter_count().saturating_sub(1))
    }
}

impl Reader<BufReader<File>> {
    /// Opens the EPUB file at `path` and makes it the current book
    pub fn load_archive<P: AsRef<Path>>(&mut self, path: P) -> Result<String, EpubError> {
        let file = File::open(&path)?;
        self.load_from_reader(BufReader::new(file), path.as_ref())
    }
}

fn fallback_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}
