use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::classfile::CLASSFILE_MAGIC;
use crate::entry::Entry;
use crate::path::{file_name, nearest_existing_ancestor};

/// How a candidate entry is recognised as an entity file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckFileOption {
    #[default]
    ByName,
    BySignature,
    ByNameAndSignature,
    ByNameOrSignature,
}

#[derive(Debug, Clone)]
pub struct EntityFilter {
    option: CheckFileOption,
    suffix: String,
    signature: Vec<u8>,
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self::new(CheckFileOption::default())
    }
}

impl EntityFilter {
    /// Class files: `.class` suffix and the `CAFEBABE` signature.
    pub fn new(option: CheckFileOption) -> Self {
        Self {
            option,
            suffix: ".class".to_string(),
            signature: CLASSFILE_MAGIC.to_vec(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn option(&self) -> CheckFileOption {
        self.option
    }

    pub fn accepts_name(&self, name: &str) -> bool {
        name.ends_with(&self.suffix)
    }

    pub fn accepts_signature(&self, head: &[u8]) -> bool {
        head.starts_with(&self.signature)
    }

    /// Full check; signature options read the entry's content.
    pub fn accepts(&self, entry: &Entry) -> bool {
        if entry.is_dir() {
            return false;
        }
        let by_name = || self.accepts_name(entry.name());
        let by_signature = || match entry.to_content() {
            Ok(content) => self.accepts_signature(&content),
            Err(err) => {
                debug!(entry = %entry.absolute_path(), %err, "signature check could not read entry");
                false
            }
        };
        match self.option {
            CheckFileOption::ByName => by_name(),
            CheckFileOption::BySignature => by_signature(),
            CheckFileOption::ByNameAndSignature => by_name() && by_signature(),
            CheckFileOption::ByNameOrSignature => by_name() || by_signature(),
        }
    }

    /// Name-only part of the check. Options that cannot decide from a name
    /// alone pass.
    pub fn passes_cheap_check(&self, name: &str) -> bool {
        match self.option {
            CheckFileOption::ByName | CheckFileOption::ByNameAndSignature => self.accepts_name(name),
            CheckFileOption::BySignature | CheckFileOption::ByNameOrSignature => true,
        }
    }
}

/// Decides whether a cached item can be trusted without rescanning it.
pub trait ItemValidator: Send + Sync {
    fn is_valid(&self, item_path: &str) -> bool;
}

impl<F> ItemValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, item_path: &str) -> bool {
        self(item_path)
    }
}

/// The item still resolves on disk (directly, or through the archive file
/// that contains it) and passes the filter's name check.
#[derive(Debug, Clone, Default)]
pub struct FileSystemCheck {
    filter: EntityFilter,
}

impl FileSystemCheck {
    pub fn new(filter: EntityFilter) -> Self {
        Self { filter }
    }
}

impl ItemValidator for FileSystemCheck {
    fn is_valid(&self, item_path: &str) -> bool {
        if !self.filter.passes_cheap_check(file_name(item_path)) {
            return false;
        }
        Path::new(item_path).is_file() || nearest_existing_ancestor(item_path).is_some_and(|p| p.is_file())
    }
}
