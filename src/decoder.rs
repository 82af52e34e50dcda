//! Archive decoding seam.
//!
//! The container layer never touches a compression format directly: it asks
//! an [`ArchiveDecoder`] whether some bytes look like an archive and for a
//! forward-only [`EntryCursor`] over them. [`ZipDecoder`] is the default.

use memmap2::Mmap;
use std::fmt::Debug;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use zip::ZipArchive;

use crate::content_cache::Content;
use crate::error::{HuntError, Result};

pub trait ArchiveDecoder: Send + Sync + Debug {
    /// Magic-byte sniffing over the first bytes of a candidate.
    fn is_archive(&self, head: &[u8]) -> bool;

    fn open(&self, absolute_path: &str, source: ArchiveSource) -> Result<Box<dyn EntryCursor>>;
}

/// Forward-only iteration over the entries of one archive.
pub trait EntryCursor: Send {
    /// Moves to the next entry. A malformed entry yields
    /// [`HuntError::MalformedEntry`] and the cursor still moves past it.
    fn advance(&mut self) -> Result<Option<EntryHeader>>;

    /// Reads the content of the entry the cursor is positioned on.
    fn read_current(&mut self) -> Result<Content>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// Bytes of an archive: a mapped top-level file or a buffer extracted from
/// an enclosing archive.
#[derive(Debug)]
pub enum ArchiveSource {
    Mapped(Mmap),
    Buffer(Content),
}

impl ArchiveSource {
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| HuntError::io(path, e))?;
        // SAFETY: The file is opened read-only and the map owns its own handle
        // to the pages; the archive is never written through this mapping.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| HuntError::io(path, e))?;
        Ok(Self::Mapped(mmap))
    }

    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for ArchiveSource {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => &mmap[..],
            Self::Buffer(content) => content,
        }
    }
}

const ZIP_SIGNATURES: [[u8; 4]; 3] = [
    [b'P', b'K', 0x03, 0x04],
    [b'P', b'K', 0x05, 0x06],
    [b'P', b'K', 0x07, 0x08],
];

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipDecoder;

impl ArchiveDecoder for ZipDecoder {
    fn is_archive(&self, head: &[u8]) -> bool {
        head.len() >= 4 && ZIP_SIGNATURES.iter().any(|sig| head[..4] == sig[..])
    }

    fn open(&self, absolute_path: &str, source: ArchiveSource) -> Result<Box<dyn EntryCursor>> {
        let archive = ZipArchive::new(Cursor::new(source)).map_err(|source| HuntError::Archive {
            path: absolute_path.to_string(),
            source,
        })?;
        Ok(Box::new(ZipCursor {
            path: absolute_path.to_string(),
            archive,
            next: 0,
            current: None,
        }))
    }
}

struct ZipCursor {
    path: String,
    archive: ZipArchive<Cursor<ArchiveSource>>,
    next: usize,
    current: Option<usize>,
}

impl EntryCursor for ZipCursor {
    fn advance(&mut self) -> Result<Option<EntryHeader>> {
        self.current = None;
        if self.next >= self.archive.len() {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        let entry = self.archive.by_index(index).map_err(|e| HuntError::MalformedEntry {
            container: self.path.clone(),
            message: format!("entry #{index}: {e}"),
        })?;
        let header = EntryHeader {
            name: entry.name().to_string(),
            size: Some(entry.size()),
            is_dir: entry.is_dir(),
        };
        self.current = Some(index);
        Ok(Some(header))
    }

    fn read_current(&mut self) -> Result<Content> {
        let index = self.current.ok_or_else(|| HuntError::StreamAlignment {
            entry: "<none>".to_string(),
            container: self.path.clone(),
        })?;
        let malformed = |message: String| HuntError::MalformedEntry {
            container: self.path.clone(),
            message,
        };

        let mut entry = self
            .archive
            .by_index(index)
            .map_err(|e| malformed(format!("entry #{index}: {e}")))?;
        // The declared size is untrusted; let the buffer grow with the data.
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| malformed(format!("{}: {e}", entry.name())))?;
        Ok(Arc::from(buf))
    }
}
