//! Background rendering of the chapters around the displayed one
//!
//! Prefetch tasks are fire-and-forget: they render into the
//! [`ChapterPipeline`] cache and nobody waits for their result. A task
//! carries the generation it was submitted under and its output is dropped if
//! the book or the image visibility changed in the meantime.

use std::{
    cmp::min,
    io::{Read, Seek},
    ops::Range,
    sync::{Arc, Condvar, Mutex},
};

use log::{debug, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{content::ChapterPipeline, error::EpubError};

/// Number of prefetch worker threads
pub const PREFETCH_WORKERS: usize = 2;

/// Chapters worth prefetching while `current` is displayed
///
/// The previous, current and next chapter, clamped to `[0, chapter_count)`.
pub fn prefetch_window(current: usize, chapter_count: usize) -> Range<usize> {
    current.saturating_sub(1)..min(chapter_count, current.saturating_add(2))
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn start(&self) -> Result<(), EpubError> {
        *self.count.lock()? += 1;
        Ok(())
    }

    fn finish(&self) {
        match self.count.lock() {
            Ok(mut count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.idle.notify_all();
                }
            }
            Err(_) => warn!("Prefetch counter poisoned"),
        }
    }

    fn wait(&self) -> Result<(), EpubError> {
        let mut count = self.count.lock()?;
        while *count > 0 {
            count = self.idle.wait(count)?;
        }
        Ok(())
    }
}

/// Marks a task as finished even if rendering panics
struct TaskGuard(Arc<Pending>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct PrefetchScheduler<R: Read + Seek> {
    pool: ThreadPool,
    pipeline: Arc<ChapterPipeline<R>>,
    pending: Arc<Pending>,
}

impl<R: Read + Seek + Send + 'static> PrefetchScheduler<R> {
    /// Starts the worker pool for `pipeline`
    pub fn new(pipeline: Arc<ChapterPipeline<R>>) -> Result<Self, EpubError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(PREFETCH_WORKERS)
            .thread_name(|index| format!("prefetch-{}", index))
            .panic_handler(|_| warn!("A prefetch task panicked"))
            .build()?;

        Ok(Self {
            pool,
            pipeline,
            pending: Arc::new(Pending::default()),
        })
    }

    /// Submits background renders around chapter `current`
    ///
    /// Chapters already cached or already being rendered are skipped.
    ///
    /// # Return
    /// - `Ok(Vec<usize>)`: The chapter indices a task was submitted for
    /// - `Err(EpubError)`: The pipeline state could not be read
    pub fn schedule(&self, current: usize) -> Result<Vec<usize>, EpubError> {
        let window = prefetch_window(current, self.pipeline.chapter_count()?);

        let mut submitted = Vec::with_capacity(window.len());
        for index in window {
            let Some(generation) = self.pipeline.claim(index)? else {
                continue;
            };

            self.pending.start()?;
            let guard = TaskGuard(Arc::clone(&self.pending));
            let pipeline = Arc::clone(&self.pipeline);

            self.pool.spawn(move || {
                let _guard = guard;
                match pipeline.populate(index, generation) {
                    Ok(true) => debug!("Prefetched chapter {}", index),
                    Ok(false) => debug!("Prefetched chapter {} is stale, discarded", index),
                    Err(err) => debug!("Prefetch of chapter {} failed: {}", index, err),
                }
            });
            submitted.push(index);
        }

        Ok(submitted)
    }

    /// Blocks until every submitted task has finished
    pub fn wait_idle(&self) -> Result<(), EpubError> {
        self.pending.wait()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}
