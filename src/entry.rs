//! Entries of containers.
//!
//! An [`AttachedEntry`] is a view on the entry a stream-bound container's
//! cursor currently sits on; its bytes can be pulled from the stream once and
//! are then served from the content cache. A [`DetachedEntry`] is
//! self-contained: it holds its own duplicate of the parent container (or a
//! filesystem path) and resolves its content through the content cache.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::archive::{ArchiveEnv, ArchiveLocation};
use crate::container::{Descend, Phase, SharedCursor, StreamContainer};
use crate::content_cache::Content;
use crate::decoder::EntryHeader;
use crate::error::{HuntError, Result};
use crate::path::{clean, clean_entry_name, file_name};

#[derive(Clone)]
pub struct AttachedEntry {
    inner: Arc<AttachedInner>,
}

struct AttachedInner {
    header: EntryHeader,
    cleaned_name: String,
    absolute_path: OnceLock<String>,
    position: u64,
    location: Arc<ArchiveLocation>,
    container_content: Option<Content>,
    env: Arc<ArchiveEnv>,
    cursor: SharedCursor,
    archive: OnceLock<bool>,
    content: OnceLock<Content>,
}

impl std::fmt::Debug for AttachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedEntry")
            .field("absolute_path", &self.absolute_path())
            .field("position", &self.inner.position)
            .finish()
    }
}

impl AttachedEntry {
    pub(crate) fn new(
        header: EntryHeader,
        position: u64,
        location: Arc<ArchiveLocation>,
        container_content: Option<Content>,
        env: Arc<ArchiveEnv>,
        cursor: SharedCursor,
    ) -> Self {
        let cleaned_name = clean_entry_name(&header.name);
        Self {
            inner: Arc::new(AttachedInner {
                header,
                cleaned_name,
                absolute_path: OnceLock::new(),
                position,
                location,
                container_content,
                env,
                cursor,
                archive: OnceLock::new(),
                content: OnceLock::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.header.name
    }

    pub fn cleaned_name(&self) -> &str {
        &self.inner.cleaned_name
    }

    pub fn absolute_path(&self) -> &str {
        self.inner.absolute_path.get_or_init(|| {
            clean(&format!(
                "{}/{}",
                self.inner.location.absolute_path(),
                self.inner.cleaned_name
            ))
        })
    }

    pub fn container_path(&self) -> &str {
        self.inner.location.absolute_path()
    }

    pub(crate) fn position(&self) -> u64 {
        self.inner.position
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.inner.header.size
    }

    pub fn size(&self) -> Result<u64> {
        match self.inner.header.size {
            Some(size) => Ok(size),
            None => Ok(self.to_content()?.len() as u64),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.inner.header.is_dir
    }

    /// Sniffs the entry's own content; memoized.
    pub fn is_archive(&self) -> Result<bool> {
        if self.is_dir() {
            return Ok(false);
        }
        if let Some(archive) = self.inner.archive.get() {
            return Ok(*archive);
        }
        let sniffed = self.inner.env.is_archive_content(&self.to_content()?);
        Ok(*self.inner.archive.get_or_init(|| sniffed))
    }

    /// Content of the entry. The first read consumes the stream; later reads
    /// come from the content cache.
    pub fn to_content(&self) -> Result<Content> {
        if let Some(content) = self.inner.content.get() {
            return Ok(Arc::clone(content));
        }
        let cache = self.inner.env.content();
        let content = match cache.get(self.absolute_path()) {
            Some(cached) => cached,
            None => {
                let read = self.read_from_stream()?;
                cache.put_if_absent(self.absolute_path(), read)
            }
        };
        Ok(Arc::clone(self.inner.content.get_or_init(|| content)))
    }

    /// Like [`to_content`](Self::to_content), but bytes read from the stream
    /// stay with this entry instead of entering the content cache.
    pub fn read_uncached(&self) -> Result<Content> {
        if let Some(content) = self.inner.content.get() {
            return Ok(Arc::clone(content));
        }
        let content = match self.inner.env.content().get(self.absolute_path()) {
            Some(cached) => cached,
            None => self.read_from_stream()?,
        };
        Ok(Arc::clone(self.inner.content.get_or_init(|| content)))
    }

    /// Reads the entry's bytes straight from the owning container's cursor.
    /// Fails with [`HuntError::StreamAlignment`] once the cursor has moved
    /// on or the bytes were already consumed.
    pub fn read_from_stream(&self) -> Result<Content> {
        let mut state = self.inner.cursor.lock();
        let aligned = state.phase == Phase::Iterating
            && state.position == self.inner.position
            && state.entry_open
            && !state.consumed;
        let cursor = match state.cursor.as_mut() {
            Some(cursor) if aligned => cursor,
            _ => {
                return Err(HuntError::StreamAlignment {
                    entry: self.absolute_path().to_string(),
                    container: self.container_path().to_string(),
                });
            }
        };
        let content = cursor.read_current()?;
        state.consumed = true;
        Ok(content)
    }

    /// Standalone copy carrying the same identity, backed by a fresh
    /// duplicate of the owning container.
    pub fn detach(&self) -> DetachedEntry {
        let parent = match &self.inner.container_content {
            Some(content) => StreamContainer::with_content(
                Arc::clone(&self.inner.env),
                Arc::clone(&self.inner.location),
                Arc::clone(content),
            ),
            None => StreamContainer::new(Arc::clone(&self.inner.env), Arc::clone(&self.inner.location)),
        };
        DetachedEntry {
            name: self.name().to_string(),
            cleaned_name: self.cleaned_name().to_string(),
            absolute_path: self.absolute_path().to_string(),
            declared_size: self.declared_size(),
            is_dir: self.is_dir(),
            archive: self.inner.archive.clone(),
            content: self.inner.content.clone(),
            origin: Some(DetachedOrigin::Archive(parent)),
            env: Arc::clone(&self.inner.env),
        }
    }

    pub fn open_as_container(&self) -> Result<StreamContainer> {
        let content = self.to_content()?;
        ensure_archive(&self.inner.env, &content, self.absolute_path())?;
        Ok(StreamContainer::with_content(
            Arc::clone(&self.inner.env),
            ArchiveLocation::nested(Arc::clone(&self.inner.location), self.cleaned_name()),
            content,
        ))
    }

    pub fn unpack_to(&self, target: &Path) -> Result<Option<PathBuf>> {
        unpack(self.cleaned_name(), self.is_dir(), target, || self.to_content())
    }
}

#[derive(Debug)]
enum DetachedOrigin {
    Archive(StreamContainer),
    File(PathBuf),
}

impl Clone for DetachedOrigin {
    fn clone(&self) -> Self {
        match self {
            Self::Archive(container) => Self::Archive(container.duplicate()),
            Self::File(path) => Self::File(path.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetachedEntry {
    name: String,
    cleaned_name: String,
    absolute_path: String,
    declared_size: Option<u64>,
    is_dir: bool,
    archive: OnceLock<bool>,
    content: OnceLock<Content>,
    origin: Option<DetachedOrigin>,
    env: Arc<ArchiveEnv>,
}

impl DetachedEntry {
    /// Entry for a regular file on disk.
    pub fn file(env: &Arc<ArchiveEnv>, path: &str) -> Self {
        let absolute_path = clean(path);
        let name = file_name(&absolute_path).to_string();
        let declared_size = fs::metadata(&absolute_path).ok().map(|m| m.len());
        Self {
            cleaned_name: name.clone(),
            name,
            declared_size,
            is_dir: false,
            archive: OnceLock::new(),
            content: OnceLock::new(),
            origin: Some(DetachedOrigin::File(PathBuf::from(&absolute_path))),
            absolute_path,
            env: Arc::clone(env),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cleaned_name(&self) -> &str {
        &self.cleaned_name
    }

    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn size(&self) -> Result<u64> {
        match self.declared_size {
            Some(size) => Ok(size),
            None => Ok(self.to_content()?.len() as u64),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_closed(&self) -> bool {
        self.origin.is_none()
    }

    pub fn is_archive(&self) -> Result<bool> {
        if self.is_dir {
            return Ok(false);
        }
        if let Some(archive) = self.archive.get() {
            return Ok(*archive);
        }
        let sniffed = match &self.origin {
            Some(DetachedOrigin::File(path)) => self.env.is_archive_file(path),
            _ => self.env.is_archive_content(&self.to_content()?),
        };
        Ok(*self.archive.get_or_init(|| sniffed))
    }

    /// Content through the content cache; on a miss the parent container is
    /// reopened and scanned for this entry's name.
    pub fn to_content(&self) -> Result<Content> {
        if let Some(content) = self.content.get() {
            return Ok(Arc::clone(content));
        }
        if self.is_dir {
            return Ok(Arc::from(Vec::new()));
        }
        if self.origin.is_none() {
            return Err(HuntError::Closed {
                path: self.absolute_path.clone(),
            });
        }
        let content = self
            .env
            .content()
            .get_or_compute(&self.absolute_path, || self.read_origin())?;
        Ok(Arc::clone(self.content.get_or_init(|| content)))
    }

    /// Content without filling the content cache on a miss.
    pub fn read_uncached(&self) -> Result<Content> {
        if let Some(content) = self.content.get() {
            return Ok(Arc::clone(content));
        }
        if self.is_dir {
            return Ok(Arc::from(Vec::new()));
        }
        if self.origin.is_none() {
            return Err(HuntError::Closed {
                path: self.absolute_path.clone(),
            });
        }
        let content = match self.env.content().get(&self.absolute_path) {
            Some(cached) => cached,
            None => self.read_origin()?,
        };
        Ok(Arc::clone(self.content.get_or_init(|| content)))
    }

    fn read_origin(&self) -> Result<Content> {
        match &self.origin {
            None => Err(HuntError::Closed {
                path: self.absolute_path.clone(),
            }),
            Some(DetachedOrigin::File(path)) => fs::read(path)
                .map(Arc::from)
                .map_err(|e| HuntError::io(path, e)),
            Some(DetachedOrigin::Archive(parent)) => {
                let mut container = parent.duplicate();
                let found = container.find_first_and_convert(
                    Descend::None,
                    |entry| entry.cleaned_name() == self.cleaned_name,
                    |entry| entry.read_from_stream().map(Some),
                );
                container.close();
                found?.ok_or_else(|| HuntError::not_found("archive entry", &self.absolute_path))
            }
        }
    }

    pub fn open_as_container(&self) -> Result<StreamContainer> {
        match &self.origin {
            None => Err(HuntError::Closed {
                path: self.absolute_path.clone(),
            }),
            Some(DetachedOrigin::File(_)) => {
                if !self.is_archive()? {
                    return Err(not_an_archive(&self.absolute_path));
                }
                Ok(StreamContainer::new(
                    Arc::clone(&self.env),
                    ArchiveLocation::file(&self.absolute_path),
                ))
            }
            Some(DetachedOrigin::Archive(parent)) => {
                let content = self.to_content()?;
                ensure_archive(&self.env, &content, &self.absolute_path)?;
                Ok(StreamContainer::with_content(
                    Arc::clone(&self.env),
                    ArchiveLocation::nested(Arc::clone(parent.location()), &self.cleaned_name),
                    content,
                ))
            }
        }
    }

    pub fn unpack_to(&self, target: &Path) -> Result<Option<PathBuf>> {
        unpack(&self.cleaned_name, self.is_dir, target, || self.to_content())
    }

    /// Releases the private parent duplicate. Content already loaded stays
    /// readable.
    pub fn close(&mut self) {
        if let Some(DetachedOrigin::Archive(mut parent)) = self.origin.take() {
            parent.close();
        }
    }
}

/// Either entry variant behind one interface.
#[derive(Debug, Clone)]
pub enum Entry {
    Attached(AttachedEntry),
    Detached(DetachedEntry),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Self::Attached(e) => e.name(),
            Self::Detached(e) => e.name(),
        }
    }

    pub fn cleaned_name(&self) -> &str {
        match self {
            Self::Attached(e) => e.cleaned_name(),
            Self::Detached(e) => e.cleaned_name(),
        }
    }

    pub fn absolute_path(&self) -> &str {
        match self {
            Self::Attached(e) => e.absolute_path(),
            Self::Detached(e) => e.absolute_path(),
        }
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Attached(e) => e.size(),
            Self::Detached(e) => e.size(),
        }
    }

    pub fn is_dir(&self) -> bool {
        match self {
            Self::Attached(e) => e.is_dir(),
            Self::Detached(e) => e.is_dir(),
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached(_))
    }

    pub fn is_archive(&self) -> Result<bool> {
        match self {
            Self::Attached(e) => e.is_archive(),
            Self::Detached(e) => e.is_archive(),
        }
    }

    pub fn to_content(&self) -> Result<Content> {
        match self {
            Self::Attached(e) => e.to_content(),
            Self::Detached(e) => e.to_content(),
        }
    }

    pub fn read_uncached(&self) -> Result<Content> {
        match self {
            Self::Attached(e) => e.read_uncached(),
            Self::Detached(e) => e.read_uncached(),
        }
    }

    pub fn detach(&self) -> DetachedEntry {
        match self {
            Self::Attached(e) => e.detach(),
            Self::Detached(e) => e.clone(),
        }
    }

    pub fn open_as_container(&self) -> Result<StreamContainer> {
        match self {
            Self::Attached(e) => e.open_as_container(),
            Self::Detached(e) => e.open_as_container(),
        }
    }

    pub fn unpack_to(&self, target: &Path) -> Result<Option<PathBuf>> {
        match self {
            Self::Attached(e) => e.unpack_to(target),
            Self::Detached(e) => e.unpack_to(target),
        }
    }

    pub fn close(&mut self) {
        if let Self::Detached(e) = self {
            e.close();
        }
    }
}

fn not_an_archive(path: &str) -> HuntError {
    HuntError::MalformedEntry {
        container: path.to_string(),
        message: "content is not an archive".to_string(),
    }
}

fn ensure_archive(env: &ArchiveEnv, content: &[u8], path: &str) -> Result<()> {
    if env.is_archive_content(content) {
        Ok(())
    } else {
        Err(not_an_archive(path))
    }
}

fn unpack<F>(cleaned_name: &str, is_dir: bool, target: &Path, content: F) -> Result<Option<PathBuf>>
where
    F: FnOnce() -> Result<Content>,
{
    if is_dir {
        return Ok(None);
    }
    let escapes = Path::new(cleaned_name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(HuntError::MalformedEntry {
            container: target.to_string_lossy().to_string(),
            message: format!("{cleaned_name} escapes the target directory"),
        });
    }
    let destination = target.join(cleaned_name);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| HuntError::io(parent, e))?;
    }
    fs::write(&destination, &*content()?).map_err(|e| HuntError::io(&destination, e))?;
    Ok(Some(destination))
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
            if name.ends_with('/') {
                zip.add_directory(*name, FileOptions::default())?;
            } else {
                zip.start_file(*name, FileOptions::default())?;
                zip.write_all(content)?;
            }
        }
        Ok(zip.finish()?.into_inner())
    }

    fn env() -> Arc<ArchiveEnv> {
        Arc::new(ArchiveEnv::new(Arc::new(ZipDecoder)))
    }

    #[test]
    fn detached_copy_survives_closed_stream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lib.zip");
        std::fs::write(&path, zip_bytes(&[("org/A.class", b"alpha"), ("org/B.class", b"beta")])?)?;
        let env = env();

        let mut container = env.open_container(&path.to_string_lossy())?;
        container.next_entry(false)?;
        let attached = container.next_entry(false)?.unwrap();
        let detached = attached.detach();
        let attached_bytes = attached.to_content()?;
        container.close();

        assert_eq!(detached.absolute_path(), attached.absolute_path());
        assert_eq!(detached.to_content()?, attached_bytes);

        // a cold cache forces the detached entry to reopen its parent
        let cold = env.open_entry(&format!("{}/org/B.class", clean(&path.to_string_lossy())))?;
        env.content().clear();
        assert_eq!(&*cold.to_content()?, b"beta");
        assert_eq!(cold.size()?, 4);
        Ok(())
    }

    #[test]
    fn uncached_reads_leave_the_content_cache_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lib.zip");
        std::fs::write(&path, zip_bytes(&[("A.class", b"alpha"), ("B.class", b"beta")])?)?;
        let env = env();

        let mut container = env.open_container(&path.to_string_lossy())?;
        let attached = container.next_entry(false)?.unwrap();
        assert_eq!(&*attached.read_uncached()?, b"alpha");
        assert_eq!(&*attached.to_content()?, b"alpha");
        container.close();

        let detached = env.open_entry(&format!("{}/B.class", clean(&path.to_string_lossy())))?;
        assert_eq!(&*detached.read_uncached()?, b"beta");
        assert!(env.content().is_empty());

        let fresh = env.open_entry(detached.absolute_path())?;
        assert_eq!(&*fresh.to_content()?, b"beta");
        assert_eq!(env.content().len(), 1);
        Ok(())
    }

    #[test]
    fn closed_detached_entry_refuses_reads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lib.zip");
        std::fs::write(&path, zip_bytes(&[("A.class", b"alpha")])?)?;
        let env = env();

        let mut container = env.open_container(&path.to_string_lossy())?;
        let mut detached = container.next_entry(false)?.unwrap().detach();
        container.close();
        detached.close();
        assert!(detached.is_closed());
        assert!(matches!(detached.to_content(), Err(HuntError::Closed { .. })));
        Ok(())
    }

    #[test]
    fn unpack_writes_files_and_skips_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("lib.zip");
        let outside = dir.path().join("outside");
        let rooted = format!("/{}/evil.txt", outside.to_string_lossy());
        std::fs::write(
            &archive,
            zip_bytes(&[("org/", b""), ("org/A.class", b"alpha"), ("../evil", b"x"), (rooted.as_str(), b"y")])?,
        )?;
        let target = dir.path().join("out");
        let env = env();

        let mut container = env.open_container(&archive.to_string_lossy())?;
        let directory = container.next_entry(false)?.unwrap();
        assert_eq!(directory.unpack_to(&target)?, None);

        let class = container.next_entry(false)?.unwrap();
        let written = class.unpack_to(&target)?.unwrap();
        assert_eq!(std::fs::read(written)?, b"alpha");

        let evil = container.next_entry(false)?.unwrap();
        assert!(matches!(evil.unpack_to(&target), Err(HuntError::MalformedEntry { .. })));

        let absolute = container.next_entry(false)?.unwrap();
        assert!(matches!(absolute.unpack_to(&target), Err(HuntError::MalformedEntry { .. })));
        assert!(!outside.join("evil.txt").exists());
        Ok(())
    }

    #[test]
    fn file_entries_sniff_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("lib.jar");
        std::fs::write(&archive, zip_bytes(&[("A.class", b"alpha")])?)?;
        let plain = dir.path().join("notes.txt");
        std::fs::write(&plain, b"hello")?;
        let env = env();

        let jar = Entry::Detached(DetachedEntry::file(&env, &archive.to_string_lossy()));
        assert!(jar.is_archive()?);
        let mut nested = jar.open_as_container()?;
        assert_eq!(nested.next_entry(true)?.map(|e| e.name().to_string()), Some("A.class".to_string()));

        let text = Entry::Detached(DetachedEntry::file(&env, &plain.to_string_lossy()));
        assert!(!text.is_archive()?);
        assert!(text.open_as_container().is_err());
        assert_eq!(text.name(), "notes.txt");
        assert_eq!(text.size()?, 5);
        Ok(())
    }
}
