//! Containers: stream-bound archives and materialized entry lists.
//!
//! A [`StreamContainer`] owns one forward cursor over an archive. Every
//! traversal that moves the cursor (`find_*`) holds the container's path lock
//! for its full duration, so two traversals of the same archive never
//! interleave. Traversals of different paths run freely.

use ignore::WalkBuilder;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::archive::{ArchiveEnv, ArchiveLocation, Origin};
use crate::content_cache::Content;
use crate::decoder::{ArchiveSource, EntryCursor};
use crate::entry::{AttachedEntry, DetachedEntry, Entry};
use crate::error::{HuntError, Result};
use crate::path::{ARCHIVE_PATH_SUFFIX, clean};

/// Whether a traversal recurses into entries that are archives themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    Archives,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Unopened,
    Iterating,
    Exhausted,
    Closed,
}

pub(crate) struct CursorState {
    pub(crate) cursor: Option<Box<dyn EntryCursor>>,
    pub(crate) phase: Phase,
    pub(crate) position: u64,
    pub(crate) entry_open: bool,
    pub(crate) consumed: bool,
}

impl CursorState {
    fn new() -> Self {
        Self {
            cursor: None,
            phase: Phase::Unopened,
            position: 0,
            entry_open: false,
            consumed: false,
        }
    }
}

pub(crate) type SharedCursor = Arc<Mutex<CursorState>>;

pub struct StreamContainer {
    location: Arc<ArchiveLocation>,
    env: Arc<ArchiveEnv>,
    shared: SharedCursor,
    preloaded: Option<Content>,
    current: Option<AttachedEntry>,
    parent: OnceLock<Option<Box<StreamContainer>>>,
    conventioned: OnceLock<String>,
}

impl std::fmt::Debug for StreamContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContainer")
            .field("absolute_path", &self.location.absolute_path())
            .field("phase", &self.shared.lock().phase)
            .field("preloaded", &self.preloaded.as_ref().map(|c| c.len()))
            .finish()
    }
}

struct Visitor<'a, T> {
    predicate: &'a mut dyn FnMut(&Entry) -> bool,
    convert: &'a mut dyn FnMut(&AttachedEntry) -> Result<Option<T>>,
    sink: &'a mut dyn FnMut(T) -> ControlFlow<()>,
    recover: bool,
}

impl StreamContainer {
    pub fn new(env: Arc<ArchiveEnv>, location: Arc<ArchiveLocation>) -> Self {
        Self {
            location,
            env,
            shared: Arc::new(Mutex::new(CursorState::new())),
            preloaded: None,
            current: None,
            parent: OnceLock::new(),
            conventioned: OnceLock::new(),
        }
    }

    /// Container over archive bytes that are already in memory.
    pub(crate) fn with_content(env: Arc<ArchiveEnv>, location: Arc<ArchiveLocation>, content: Content) -> Self {
        let mut container = Self::new(env, location);
        container.preloaded = Some(content);
        container
    }

    pub fn open(env: &Arc<ArchiveEnv>, path: &str) -> Result<Self> {
        let location = ArchiveLocation::at(&clean(path));
        location.origin(env)?;
        Ok(Self::new(Arc::clone(env), location))
    }

    pub fn absolute_path(&self) -> &str {
        self.location.absolute_path()
    }

    pub fn location(&self) -> &Arc<ArchiveLocation> {
        &self.location
    }

    pub fn env(&self) -> &Arc<ArchiveEnv> {
        &self.env
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().phase == Phase::Closed
    }

    fn ensure_open(&mut self) -> Result<()> {
        match self.shared.lock().phase {
            Phase::Unopened => {}
            Phase::Closed => {
                return Err(HuntError::Closed {
                    path: self.absolute_path().to_string(),
                });
            }
            Phase::Iterating | Phase::Exhausted => return Ok(()),
        }

        let depth = self.location.depth(&self.env)?;
        if depth > self.env.max_nesting_depth() {
            return Err(HuntError::MalformedEntry {
                container: self.absolute_path().to_string(),
                message: format!("nesting depth {depth} exceeds {}", self.env.max_nesting_depth()),
            });
        }
        let source = match &self.preloaded {
            Some(content) => ArchiveSource::Buffer(Arc::clone(content)),
            None => self.location.load_source(&self.env)?,
        };
        let cursor = self.env.decoder().open(self.absolute_path(), source)?;

        let mut state = self.shared.lock();
        if state.phase == Phase::Unopened {
            state.cursor = Some(cursor);
            state.phase = Phase::Iterating;
        }
        Ok(())
    }

    /// Advances the cursor. Malformed entries are logged and skipped;
    /// `None` means the archive is exhausted.
    pub fn next_entry(&mut self, load_content: bool) -> Result<Option<AttachedEntry>> {
        self.ensure_open()?;
        self.close_current_entry();
        loop {
            let (header, position) = {
                let mut state = self.shared.lock();
                if state.phase != Phase::Iterating {
                    return Ok(None);
                }
                let Some(cursor) = state.cursor.as_mut() else {
                    return Ok(None);
                };
                let advanced = cursor.advance();
                state.position += 1;
                match advanced {
                    Ok(Some(header)) => {
                        state.entry_open = true;
                        state.consumed = false;
                        (header, state.position)
                    }
                    Ok(None) => {
                        state.phase = Phase::Exhausted;
                        state.cursor = None;
                        return Ok(None);
                    }
                    Err(err @ HuntError::MalformedEntry { .. }) => {
                        warn!(container = %self.location.absolute_path(), %err, "skipping malformed entry");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            let entry = AttachedEntry::new(
                header,
                position,
                Arc::clone(&self.location),
                self.preloaded.clone(),
                Arc::clone(&self.env),
                Arc::clone(&self.shared),
            );
            if load_content && !entry.is_dir() {
                if let Err(err) = entry.to_content() {
                    warn!(entry = %entry.absolute_path(), %err, "skipping unreadable entry");
                    self.shared.lock().entry_open = false;
                    continue;
                }
            }
            self.current = Some(entry.clone());
            return Ok(Some(entry));
        }
    }

    pub fn current_entry(&self) -> Option<&AttachedEntry> {
        self.current.as_ref()
    }

    /// Releases the current entry; the container stays usable.
    pub fn close_current_entry(&mut self) {
        if let Some(entry) = self.current.take() {
            let mut state = self.shared.lock();
            if state.position == entry.position() {
                state.entry_open = false;
            }
        }
    }

    /// Closes the cursor and releases the parent reference.
    pub fn close(&mut self) {
        self.close_current_entry();
        {
            let mut state = self.shared.lock();
            state.cursor = None;
            state.phase = Phase::Closed;
        }
        self.preloaded = None;
        self.parent = OnceLock::new();
    }

    /// Independent container over the same archive. No cursor state is
    /// shared with `self`.
    pub fn duplicate(&self) -> Self {
        let mut copy = Self::new(Arc::clone(&self.env), Arc::clone(&self.location));
        copy.preloaded = self.preloaded.clone();
        copy
    }

    /// Container of the enclosing archive, if this archive is nested.
    pub fn parent(&self) -> Result<Option<&StreamContainer>> {
        if let Some(parent) = self.parent.get() {
            return Ok(parent.as_deref());
        }
        let resolved = match self.location.origin(&self.env)? {
            Origin::File(_) => None,
            Origin::Nested { parent, .. } => Some(Box::new(Self::new(
                Arc::clone(&self.env),
                Arc::clone(parent),
            ))),
        };
        Ok(self.parent.get_or_init(|| resolved).as_deref())
    }

    /// Canonical path with an archive marker after each archive boundary,
    /// e.g. `/r/outer.jar///lib/inner.jar///`.
    pub fn conventioned_absolute_path(&self) -> Result<&str> {
        if let Some(path) = self.conventioned.get() {
            return Ok(path);
        }
        let computed = match self.location.origin(&self.env)? {
            Origin::File(_) => format!("{}{ARCHIVE_PATH_SUFFIX}", self.absolute_path()),
            Origin::Nested { entry_name, .. } => {
                let parent = self
                    .parent()?
                    .ok_or_else(|| HuntError::not_found("parent archive", self.absolute_path()))?;
                format!(
                    "{}{entry_name}{ARCHIVE_PATH_SUFFIX}",
                    parent.conventioned_absolute_path()?
                )
            }
        };
        Ok(self.conventioned.get_or_init(|| computed))
    }

    /// Realizes every remaining entry as a detached entry with its content
    /// loaded.
    pub fn materialize(&mut self) -> Result<MaterializedContainer> {
        let entries = self.find_all_and_convert(
            Descend::None,
            |_| true,
            |entry| {
                if !entry.is_dir() {
                    entry.to_content()?;
                }
                Ok(Some(Entry::Detached(entry.detach())))
            },
        )?;
        Ok(MaterializedContainer::new(self.absolute_path(), entries))
    }

    pub fn find_first_matching<P>(&mut self, predicate: P) -> Result<Option<Entry>>
    where
        P: FnMut(&Entry) -> bool,
    {
        self.find_first_and_convert(Descend::Archives, predicate, |entry| {
            Ok(Some(Entry::Detached(entry.detach())))
        })
    }

    pub fn find_all_matching<P>(&mut self, predicate: P) -> Result<Vec<Entry>>
    where
        P: FnMut(&Entry) -> bool,
    {
        self.find_all_and_convert(Descend::Archives, predicate, |entry| {
            Ok(Some(Entry::Detached(entry.detach())))
        })
    }

    /// First converted match. A conversion failure aborts the search.
    pub fn find_first_and_convert<T, P, F>(&mut self, descend: Descend, mut predicate: P, mut convert: F) -> Result<Option<T>>
    where
        P: FnMut(&Entry) -> bool,
        F: FnMut(&AttachedEntry) -> Result<Option<T>>,
    {
        let mut found = None;
        let mut sink = |value: T| {
            found = Some(value);
            ControlFlow::Break(())
        };
        let mut visitor = Visitor {
            predicate: &mut predicate,
            convert: &mut convert,
            sink: &mut sink,
            recover: false,
        };
        self.walk(descend, &mut visitor)?;
        Ok(found)
    }

    /// Every converted match. Conversion failures are logged and skipped.
    pub fn find_all_and_convert<T, P, F>(&mut self, descend: Descend, mut predicate: P, mut convert: F) -> Result<Vec<T>>
    where
        P: FnMut(&Entry) -> bool,
        F: FnMut(&AttachedEntry) -> Result<Option<T>>,
    {
        let mut found = Vec::new();
        let mut sink = |value: T| {
            found.push(value);
            ControlFlow::Continue(())
        };
        let mut visitor = Visitor {
            predicate: &mut predicate,
            convert: &mut convert,
            sink: &mut sink,
            recover: true,
        };
        self.walk(descend, &mut visitor)?;
        Ok(found)
    }

    fn walk<T>(&mut self, descend: Descend, visitor: &mut Visitor<'_, T>) -> Result<ControlFlow<()>> {
        self.ensure_open()?;
        let env = Arc::clone(&self.env);
        let key = format!("container:{}", self.absolute_path());
        env.locks().with_lock(&key, || self.walk_locked(descend, visitor))
    }

    fn walk_locked<T>(&mut self, descend: Descend, visitor: &mut Visitor<'_, T>) -> Result<ControlFlow<()>> {
        while let Some(entry) = self.next_entry(false)? {
            let wrapped = Entry::Attached(entry.clone());
            if (visitor.predicate)(&wrapped) {
                match (visitor.convert)(&entry) {
                    Ok(Some(value)) => {
                        if (visitor.sink)(value).is_break() {
                            return Ok(ControlFlow::Break(()));
                        }
                    }
                    Ok(None) => {}
                    Err(err) if visitor.recover => {
                        warn!(entry = %entry.absolute_path(), %err, "skipping entry");
                    }
                    Err(err) => return Err(err),
                }
            }

            if descend == Descend::Archives && !entry.is_dir() && self.env.may_be_archive(entry.name()) {
                match self.descend_into(&entry, visitor) {
                    Ok(ControlFlow::Break(())) => return Ok(ControlFlow::Break(())),
                    Ok(ControlFlow::Continue(())) => {}
                    Err(err) if visitor.recover => {
                        warn!(entry = %entry.absolute_path(), %err, "skipping nested archive");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn descend_into<T>(&mut self, entry: &AttachedEntry, visitor: &mut Visitor<'_, T>) -> Result<ControlFlow<()>> {
        if !entry.is_archive()? {
            return Ok(ControlFlow::Continue(()));
        }
        let depth = self.location.depth(&self.env)? + 1;
        if depth > self.env.max_nesting_depth() {
            warn!(entry = %entry.absolute_path(), depth, "nested archive too deep, not descending");
            return Ok(ControlFlow::Continue(()));
        }
        debug!(entry = %entry.absolute_path(), depth, "descending into nested archive");
        let mut nested = entry.open_as_container()?;
        let flow = nested.walk(Descend::Archives, visitor);
        nested.close();
        flow
    }
}

/// Fixed, ordered sequence of entries already realized in memory. Queries
/// take `&self` and may run concurrently.
#[derive(Debug, Clone, Default)]
pub struct MaterializedContainer {
    absolute_path: String,
    entries: Vec<Entry>,
}

impl MaterializedContainer {
    pub fn new(absolute_path: &str, entries: Vec<Entry>) -> Self {
        Self {
            absolute_path: clean(absolute_path),
            entries,
        }
    }

    /// Regular files below `dir`, as detached entries, sorted by path.
    pub fn from_directory(env: &Arc<ArchiveEnv>, dir: &Path, include_hidden: bool) -> Result<Self> {
        if !dir.is_dir() {
            return Err(HuntError::not_found("directory", dir.to_string_lossy()));
        }
        let (tx, rx) = mpsc::channel();

        let walker = WalkBuilder::new(dir)
            .hidden(!include_hidden)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build_parallel();

        walker.run(|| {
            let tx = tx.clone();
            Box::new(move |entry| {
                match entry {
                    Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                        let _ = tx.send(clean(&entry.path().to_string_lossy()));
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%err, "skipping unreadable directory entry"),
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut paths: Vec<String> = rx.iter().collect();
        paths.sort();
        let entries = paths
            .iter()
            .map(|path| Entry::Detached(DetachedEntry::file(env, path)))
            .collect();
        Ok(Self::new(&dir.to_string_lossy(), entries))
    }

    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_first_matching<P>(&self, mut predicate: P) -> Option<Entry>
    where
        P: FnMut(&Entry) -> bool,
    {
        self.entries.iter().find(|entry| predicate(entry)).cloned()
    }

    pub fn find_all_matching<P>(&self, mut predicate: P) -> Vec<Entry>
    where
        P: FnMut(&Entry) -> bool,
    {
        self.entries.iter().filter(|entry| predicate(entry)).cloned().collect()
    }

    pub fn close(&mut self) {
        for entry in &mut self.entries {
            entry.close();
        }
        self.entries.clear();
    }
}

/// One query surface over both container variants.
#[derive(Debug)]
pub enum Container {
    Stream(StreamContainer),
    Materialized(MaterializedContainer),
}

impl Container {
    /// Directories are materialized; anything else must resolve to an
    /// archive.
    pub fn open(env: &Arc<ArchiveEnv>, path: &str, include_hidden: bool) -> Result<Self> {
        let fs_path = Path::new(path);
        if fs_path.is_dir() {
            return Ok(Self::Materialized(MaterializedContainer::from_directory(
                env,
                fs_path,
                include_hidden,
            )?));
        }
        Ok(Self::Stream(StreamContainer::open(env, path)?))
    }

    pub fn absolute_path(&self) -> &str {
        match self {
            Self::Stream(c) => c.absolute_path(),
            Self::Materialized(c) => c.absolute_path(),
        }
    }

    pub fn find_first_matching<P>(&mut self, predicate: P) -> Result<Option<Entry>>
    where
        P: FnMut(&Entry) -> bool,
    {
        match self {
            Self::Stream(c) => c.find_first_matching(predicate),
            Self::Materialized(c) => Ok(c.find_first_matching(predicate)),
        }
    }

    pub fn find_all_matching<P>(&mut self, predicate: P) -> Result<Vec<Entry>>
    where
        P: FnMut(&Entry) -> bool,
    {
        match self {
            Self::Stream(c) => c.find_all_matching(predicate),
            Self::Materialized(c) => Ok(c.find_all_matching(predicate)),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Stream(c) => c.close(),
            Self::Materialized(c) => c.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ZipDecoder;
    use std::io::{Cursor, Write};
    use zip::write::{FileOptions, ZipWriter};

    fn zip_bytes(entries: &[(&str, &[u8])]) -> anyhow::Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            zip.start_file(*name, FileOptions::default())?;
            zip.write_all(content)?;
        }
        Ok(zip.finish()?.into_inner())
    }

    fn env() -> Arc<ArchiveEnv> {
        Arc::new(ArchiveEnv::new(Arc::new(ZipDecoder)).with_archive_extensions(["jar", "zip"]))
    }

    fn fixture(dir: &Path) -> anyhow::Result<String> {
        let inner = zip_bytes(&[("b.class", b"bbb")])?;
        let outer = zip_bytes(&[("a.class", b"aaa"), ("lib/inner.zip", &inner), ("c.txt", b"ccc")])?;
        let path = dir.join("outer.zip");
        std::fs::write(&path, outer)?;
        Ok(clean(&path.to_string_lossy()))
    }

    #[test]
    fn next_entry_walks_and_reports_exhaustion() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outer = fixture(dir.path())?;
        let env = env();
        let mut container = env.open_container(&outer)?;

        let first = container.next_entry(true)?.unwrap();
        assert_eq!(first.absolute_path(), format!("{outer}/a.class"));
        assert_eq!(&*first.to_content()?, b"aaa");
        assert_eq!(container.current_entry().map(|e| e.name()), Some("a.class"));

        let second = container.next_entry(false)?.unwrap();
        assert!(second.is_archive()?);
        assert!(matches!(first.read_from_stream(), Err(HuntError::StreamAlignment { .. })));
        // content of a passed entry is still served from the cache
        assert_eq!(&*first.to_content()?, b"aaa");

        container.close_current_entry();
        container.close_current_entry();
        assert!(container.next_entry(false)?.is_some());
        assert!(container.next_entry(false)?.is_none());
        container.close();
        assert!(matches!(container.next_entry(false), Err(HuntError::Closed { .. })));
        Ok(())
    }

    #[test]
    fn find_all_descends_into_nested_archives() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outer = fixture(dir.path())?;
        let env = env();
        let mut container = env.open_container(&outer)?;

        let classes = container.find_all_matching(|e| e.name().ends_with(".class"))?;
        let paths: Vec<&str> = classes.iter().map(|e| e.absolute_path()).collect();
        assert_eq!(
            paths,
            vec![format!("{outer}/a.class"), format!("{outer}/lib/inner.zip/b.class")]
        );
        assert_eq!(&*classes[1].to_content()?, b"bbb");

        let mut flat = env.open_container(&outer)?;
        let shallow = flat.find_all_and_convert(Descend::None, |e| e.name().ends_with(".class"), |e| {
            Ok(Some(e.cleaned_name().to_string()))
        })?;
        assert_eq!(shallow, vec!["a.class".to_string()]);
        assert_eq!(env.locks().len(), 0);
        Ok(())
    }

    #[test]
    fn archives_past_the_nesting_limit_are_not_descended() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let innermost = zip_bytes(&[("c.class", b"ccc")])?;
        let middle = zip_bytes(&[("b.class", b"bbb"), ("inner.zip", &innermost)])?;
        let path = dir.path().join("outer.zip");
        std::fs::write(&path, zip_bytes(&[("a.class", b"aaa"), ("mid.zip", &middle)])?)?;
        let outer = clean(&path.to_string_lossy());
        let env = Arc::new(
            ArchiveEnv::new(Arc::new(ZipDecoder))
                .with_archive_extensions(["zip"])
                .with_max_nesting_depth(1),
        );

        let mut container = env.open_container(&outer)?;
        let classes = container.find_all_matching(|e| e.name().ends_with(".class"))?;
        container.close();
        let paths: Vec<&str> = classes.iter().map(|e| e.absolute_path()).collect();
        assert_eq!(paths, vec![format!("{outer}/a.class"), format!("{outer}/mid.zip/b.class")]);

        let mut too_deep = env.open_container(&format!("{outer}/mid.zip/inner.zip"))?;
        assert!(matches!(too_deep.next_entry(false), Err(HuntError::MalformedEntry { .. })));

        let mut allowed = env.open_container(&format!("{outer}/mid.zip"))?;
        assert!(allowed.next_entry(false)?.is_some());
        Ok(())
    }

    #[test]
    fn conventioned_paths_mark_archive_boundaries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outer = fixture(dir.path())?;
        let env = env();

        let top = env.open_container(&outer)?;
        assert_eq!(top.conventioned_absolute_path()?, format!("{outer}///"));
        assert!(top.parent()?.is_none());

        let nested = env.open_container(&format!("{outer}/lib/inner.zip"))?;
        assert_eq!(nested.conventioned_absolute_path()?, format!("{outer}///lib/inner.zip///"));
        assert_eq!(nested.parent()?.map(|p| p.absolute_path()), Some(outer.as_str()));
        Ok(())
    }

    #[test]
    fn duplicate_has_its_own_cursor() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outer = fixture(dir.path())?;
        let env = env();
        let mut original = env.open_container(&outer)?;
        original.next_entry(false)?;
        original.next_entry(false)?;

        let mut copy = original.duplicate();
        assert_eq!(copy.next_entry(false)?.map(|e| e.cleaned_name().to_string()), Some("a.class".to_string()));
        assert_eq!(
            original.next_entry(false)?.map(|e| e.cleaned_name().to_string()),
            Some("c.txt".to_string())
        );
        Ok(())
    }

    #[test]
    fn materialize_and_directory_listing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outer = fixture(dir.path())?;
        std::fs::create_dir_all(dir.path().join("pkg"))?;
        std::fs::write(dir.path().join("pkg/D.class"), b"ddd")?;
        let env = env();

        let mut stream = env.open_container(&outer)?;
        let materialized = stream.materialize()?;
        stream.close();
        assert_eq!(materialized.len(), 3);
        let c = materialized.find_first_matching(|e| e.name() == "c.txt").unwrap();
        assert_eq!(&*c.to_content()?, b"ccc");

        let mut listing = Container::open(&env, &dir.path().to_string_lossy(), true)?;
        let files = listing.find_all_matching(|_| true)?;
        let names: Vec<&str> = files.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["outer.zip", "D.class"]);
        listing.close();
        Ok(())
    }
}
