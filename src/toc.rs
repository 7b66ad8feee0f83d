//! Flat table of contents
//!
//! The navigation hierarchy parsed from the NCX file or the navigation
//! document is normalized into [`NavNode`]s and then flattened into
//! [`TocEntry`] rows, each resolved to a chapter index where possible.

use std::{
    collections::HashMap,
    io::{Read, Seek},
};

use log::warn;

use crate::{
    epub::EpubDoc,
    types::{Chapter, NavPoint, TocEntry},
    utils::{NormalizeWhitespace, last_segment, percent_decode},
};

/// Uniform navigation tree the flattener works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavNode {
    /// A navigable entry
    Leaf { title: String, href: Option<String> },

    /// Entries nested one level below the preceding leaf
    Group { children: Vec<NavNode> },
}

impl NavNode {
    /// Converts parsed navigation points into nodes
    ///
    /// A navigation point becomes a `Leaf`; if it has children they follow it
    /// as a `Group`.
    pub fn from_nav_points(points: &[NavPoint]) -> Vec<NavNode> {
        let mut nodes = Vec::with_capacity(points.len());
        for point in points {
            nodes.push(NavNode::Leaf {
                title: point.label.normalize_whitespace(),
                href: point
                    .content
                    .as_ref()
                    .map(|href| href.trim().to_string())
                    .filter(|href| !href.is_empty()),
            });

            if !point.children.is_empty() {
                nodes.push(NavNode::Group {
                    children: Self::from_nav_points(&point.children),
                });
            }
        }
        nodes
    }
}

/// Maps navigation targets to chapter indices
pub struct ChapterResolver {
    filenames: HashMap<String, usize>,
    paths: Vec<String>,
}

impl ChapterResolver {
    pub fn new(chapters: &[Chapter]) -> Self {
        let mut filenames = HashMap::with_capacity(chapters.len());
        for chapter in chapters {
            filenames
                .entry(chapter.filename.clone())
                .or_insert(chapter.index);
        }

        Self {
            filenames,
            paths: chapters
                .iter()
                .map(|chapter| chapter.path.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns the chapter a navigation target points into
    ///
    /// The fragment and query are dropped and the rest is percent-decoded;
    /// only the file name is compared. An exact file name match wins.
    /// Otherwise the first chapter whose path contains the name, ignoring
    /// ASCII case, is used, as long as the name starts at a path segment and
    /// ends at a segment or extension boundary. `ch1` thus finds `ch1.html`
    /// but never `ch10.html`.
    pub fn resolve(&self, href: &str) -> Option<usize> {
        let href = href.split('#').next().unwrap_or_default();
        let href = href.split('?').next().unwrap_or_default();
        let decoded = percent_decode(href);
        let name = last_segment(&decoded);
        if name.is_empty() {
            return None;
        }

        if let Some(&index) = self.filenames.get(name) {
            return Some(index);
        }

        let name = name.to_ascii_lowercase();
        self.paths
            .iter()
            .position(|path| contains_on_boundary(path, &name))
    }
}

fn contains_on_boundary(path: &str, name: &str) -> bool {
    path.match_indices(name).any(|(start, _)| {
        let end = start + name.len();
        let starts_segment = start == 0 || path[..start].ends_with('/');
        let ends_segment =
            end == path.len() || matches!(path[end..].chars().next(), Some('/' | '.'));
        starts_segment && ends_segment
    })
}

/// Flattens `nodes` depth first; nodes inside a `Group` are one level deeper
///
/// Leaves without a title are skipped.
pub fn flatten(nodes: &[NavNode], resolver: &ChapterResolver) -> Vec<TocEntry> {
    let mut entries = Vec::new();
    flatten_into(nodes, resolver, 0, &mut entries);
    entries
}

fn flatten_into(
    nodes: &[NavNode],
    resolver: &ChapterResolver,
    level: usize,
    entries: &mut Vec<TocEntry>,
) {
    for node in nodes {
        match node {
            NavNode::Leaf { title, .. } if title.is_empty() => {}
            NavNode::Leaf { title, href } => entries.push(TocEntry {
                title: title.clone(),
                level,
                href: href.clone(),
                chapter_idx: href.as_deref().and_then(|href| resolver.resolve(href)),
            }),
            NavNode::Group { children } => flatten_into(children, resolver, level + 1, entries),
        }
    }
}

/// One entry per chapter, used when the navigation data is unusable
pub fn synthetic_toc(chapters: &[Chapter]) -> Vec<TocEntry> {
    chapters
        .iter()
        .map(|chapter| TocEntry {
            title: format!("Chapter {} ({})", chapter.index + 1, chapter.filename),
            level: 0,
            href: Some(chapter.path.clone()),
            chapter_idx: Some(chapter.index),
        })
        .collect()
}

/// Builds the flat table of contents of `doc`
///
/// Never fails: if the navigation data cannot be parsed or yields no entry,
/// the result is [`synthetic_toc`].
pub fn flat_toc<R: Read + Seek>(doc: &EpubDoc<R>) -> Vec<TocEntry> {
    let resolver = ChapterResolver::new(doc.chapters());

    match doc.navigation_tree() {
        Ok(points) => {
            let entries = flatten(&NavNode::from_nav_points(&points), &resolver);
            if !entries.is_empty() {
                return entries;
            }
            warn!(
                "{}: the table of contents is empty, listing chapters instead",
                doc.epub_path().display()
            );
        }
        Err(err) => warn!(
            "{}: the table of contents could not be read ({}), listing chapters instead",
            doc.epub_path().display(),
            err
        ),
    }

    synthetic_toc(doc.chapters())
}
