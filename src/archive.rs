//! Shared archive environment and archive locations.
//!
//! An [`ArchiveLocation`] names an archive by absolute path and knows where
//! its bytes come from: a file on disk or an entry of an enclosing archive.
//! Locations produced by traversal carry their origin; locations built from a
//! bare path probe it on first use by walking up to the nearest ancestor that
//! is itself an archive.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::container::{Descend, StreamContainer};
use crate::content_cache::ContentCache;
use crate::decoder::{ArchiveDecoder, ArchiveSource};
use crate::entry::{DetachedEntry, Entry};
use crate::error::{HuntError, Result};
use crate::path::{clean, clean_entry_name, file_name, parent_of};
use crate::sync::PathSynchronizer;

pub const DEFAULT_MAX_NESTING_DEPTH: usize = 8;

/// Everything a container needs besides its own location.
#[derive(Debug)]
pub struct ArchiveEnv {
    content: ContentCache,
    locks: PathSynchronizer,
    decoder: Arc<dyn ArchiveDecoder>,
    archive_extensions: Vec<String>,
    max_nesting_depth: usize,
    generation: u64,
}

impl ArchiveEnv {
    pub fn new(decoder: Arc<dyn ArchiveDecoder>) -> Self {
        Self {
            content: ContentCache::new(),
            locks: PathSynchronizer::new(),
            decoder,
            archive_extensions: Vec::new(),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            generation: 0,
        }
    }

    pub fn with_archive_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.archive_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    pub fn locks(&self) -> &PathSynchronizer {
        &self.locks
    }

    pub fn decoder(&self) -> &Arc<dyn ArchiveDecoder> {
        &self.decoder
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_nesting_depth(&self) -> usize {
        self.max_nesting_depth
    }

    /// Extension hint: whether a name is worth sniffing at all. An empty
    /// extension list sniffs everything.
    pub fn may_be_archive(&self, name: &str) -> bool {
        if self.archive_extensions.is_empty() {
            return true;
        }
        let name = file_name(name);
        name.rsplit_once('.').is_some_and(|(_, ext)| {
            let ext = ext.to_ascii_lowercase();
            self.archive_extensions.iter().any(|known| *known == ext)
        })
    }

    pub fn is_archive_content(&self, bytes: &[u8]) -> bool {
        self.decoder.is_archive(bytes)
    }

    /// Sniffs the head of a regular file.
    pub fn is_archive_file(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let mut head = Vec::with_capacity(8);
        match File::open(path).and_then(|f| f.take(8).read_to_end(&mut head)) {
            Ok(_) => self.decoder.is_archive(&head),
            Err(err) => {
                debug!(path = %path.display(), %err, "could not sniff file head");
                false
            }
        }
    }

    /// Whether `path` is an archive, either on disk or as an entry of an
    /// enclosing archive.
    pub fn is_archive_at(self: &Arc<Self>, path: &str) -> bool {
        let fs_path = Path::new(path);
        if fs_path.exists() {
            return self.is_archive_file(fs_path);
        }
        match self.open_entry(path) {
            Ok(entry) => entry.is_archive().unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Stream-bound container over the archive at `path`.
    pub fn open_container(self: &Arc<Self>, path: &str) -> Result<StreamContainer> {
        StreamContainer::open(self, path)
    }

    /// Resolves an absolute path to a detached entry: a regular file, or an
    /// entry of the nearest enclosing archive.
    pub fn open_entry(self: &Arc<Self>, path: &str) -> Result<Entry> {
        let path = clean(path);
        let fs_path = Path::new(&path);
        if fs_path.is_file() {
            return Ok(Entry::Detached(DetachedEntry::file(self, &path)));
        }
        if fs_path.exists() {
            return Err(HuntError::not_found("entry", path));
        }

        let (owner, name) = enclosing_archive(self, &path)?;
        let mut container = StreamContainer::new(Arc::clone(self), owner);
        let found = container.find_first_and_convert(
            Descend::None,
            |entry| entry.cleaned_name() == name,
            |entry| Ok(Some(entry.detach())),
        );
        container.close();
        match found? {
            Some(entry) => Ok(Entry::Detached(entry)),
            None => Err(HuntError::not_found("entry", path)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Origin {
    File(PathBuf),
    Nested {
        parent: Arc<ArchiveLocation>,
        entry_name: String,
    },
}

#[derive(Debug)]
pub struct ArchiveLocation {
    absolute_path: String,
    origin: OnceLock<Origin>,
}

impl ArchiveLocation {
    pub fn file(path: &str) -> Arc<Self> {
        let absolute_path = clean(path);
        let origin = OnceLock::new();
        let _ = origin.set(Origin::File(PathBuf::from(&absolute_path)));
        Arc::new(Self {
            absolute_path,
            origin,
        })
    }

    pub fn nested(parent: Arc<Self>, entry_name: &str) -> Arc<Self> {
        let entry_name = clean_entry_name(entry_name);
        let absolute_path = clean(&format!("{}/{entry_name}", parent.absolute_path));
        let origin = OnceLock::new();
        let _ = origin.set(Origin::Nested { parent, entry_name });
        Arc::new(Self {
            absolute_path,
            origin,
        })
    }

    /// Location whose origin is probed on first use.
    pub fn at(path: &str) -> Arc<Self> {
        Arc::new(Self {
            absolute_path: clean(path),
            origin: OnceLock::new(),
        })
    }

    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    pub fn origin(&self, env: &Arc<ArchiveEnv>) -> Result<&Origin> {
        if let Some(origin) = self.origin.get() {
            return Ok(origin);
        }
        let probed = probe_origin(env, &self.absolute_path)?;
        Ok(self.origin.get_or_init(|| probed))
    }

    /// Number of enclosing archives.
    pub fn depth(&self, env: &Arc<ArchiveEnv>) -> Result<usize> {
        match self.origin(env)? {
            Origin::File(_) => Ok(0),
            Origin::Nested { parent, .. } => Ok(parent.depth(env)? + 1),
        }
    }

    pub(crate) fn load_source(&self, env: &Arc<ArchiveEnv>) -> Result<ArchiveSource> {
        match self.origin(env)? {
            Origin::File(path) => ArchiveSource::map_file(path),
            Origin::Nested { parent, entry_name } => {
                let content = env.content().get_or_compute(&self.absolute_path, || {
                    let mut container = StreamContainer::new(Arc::clone(env), Arc::clone(parent));
                    let found = container.find_first_and_convert(
                        Descend::None,
                        |entry| entry.cleaned_name() == entry_name.as_str(),
                        |entry| entry.read_from_stream().map(Some),
                    );
                    container.close();
                    found?.ok_or_else(|| HuntError::not_found("archive entry", &self.absolute_path))
                })?;
                Ok(ArchiveSource::Buffer(content))
            }
        }
    }
}

fn probe_origin(env: &Arc<ArchiveEnv>, path: &str) -> Result<Origin> {
    let fs_path = Path::new(path);
    if fs_path.is_file() {
        return Ok(Origin::File(fs_path.to_path_buf()));
    }
    if fs_path.exists() {
        return Err(HuntError::not_found("archive", path));
    }
    let (parent, entry_name) = enclosing_archive(env, path)?;
    Ok(Origin::Nested { parent, entry_name })
}

/// Nearest proper ancestor of `path` that is an archive, with the name of
/// `path` relative to it.
fn enclosing_archive(env: &Arc<ArchiveEnv>, path: &str) -> Result<(Arc<ArchiveLocation>, String)> {
    let mut current = parent_of(path);
    while let Some(ancestor) = current {
        let fs_ancestor = Path::new(ancestor);
        if fs_ancestor.is_dir() {
            break;
        }
        let relative = || clean_entry_name(&path[ancestor.len()..]);
        if fs_ancestor.is_file() {
            if env.is_archive_file(fs_ancestor) {
                return Ok((ArchiveLocation::file(ancestor), relative()));
            }
            break;
        }
        if env.may_be_archive(ancestor) && env.is_archive_at(ancestor) {
            return Ok((ArchiveLocation::at(ancestor), relative()));
        }
        current = parent_of(ancestor);
    }
    Err(HuntError::not_found("archive", path))
}
