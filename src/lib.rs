//! # class-hunter
//!
//! Locates class files across directories, archives and archives nested in
//! archives, and caches scan results per root so repeated queries only
//! revalidate what they already found.
//!
//! ## Architecture
//!
//! - **path**: absolute path normalization shared by every cache key
//! - **content_cache**: path-keyed content buffers with single-flight loading
//! - **sync**: per-path reentrant locks
//! - **decoder**: archive decoding seam, with the zip implementation
//! - **archive**: shared archive environment and lazily probed archive locations
//! - **container**: stream-bound and materialized containers
//! - **entry**: attached and detached entries
//! - **entity**: entity and classifier traits
//! - **classfile**: JVM classfile classifier
//! - **filter**: entity file checks and cached item validation
//! - **criteria**: composable entity and member predicates
//! - **search**: queries, search context and results
//! - **scan_cache**: per-root cache of previously scanned items
//! - **hunter**: the caching search engine
//! - **config**: engine configuration

pub mod archive;
pub mod classfile;
pub mod config;
pub mod container;
pub mod content_cache;
pub mod criteria;
pub mod decoder;
pub mod entity;
pub mod entry;
pub mod error;
pub mod filter;
pub mod hunter;
pub mod path;
pub mod scan_cache;
pub mod search;
pub mod sync;

pub use classfile::{ClassFileClassifier, ClassMember, JavaClass, MemberKind};
pub use config::HunterConfig;
pub use criteria::{Criteria, TestResult};
pub use entity::{Entity, EntityClassifier};
pub use error::{ClassificationError, HuntError, Result};
pub use hunter::{Hunter, HunterBuilder, HunterStats};
pub use search::{Query, SearchResult};
