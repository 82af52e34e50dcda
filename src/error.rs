use std::path::Path;

pub type Result<T, E = HuntError> = std::result::Result<T, E>;

/// Errors produced while traversing containers and running searches.
#[derive(Debug, thiserror::Error)]
pub enum HuntError {
    #[error("malformed entry in {container}: {message}")]
    MalformedEntry { container: String, message: String },

    #[error("entry {entry} is not aligned with the cursor of {container}")]
    StreamAlignment { entry: String, container: String },

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("content computation failed for {key}: {message}")]
    CacheComputation { key: String, message: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("{path} is closed")]
    Closed { path: String },

    #[error("no search root is available: {}", roots.join(", "))]
    RootUnavailable { roots: Vec<String> },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error in {path}: {source}")]
    Archive {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
}

impl HuntError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }
}

/// Raised by an entity classifier when bytes do not describe an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not classify {path}: {reason}")]
pub struct ClassificationError {
    pub path: String,
    pub reason: String,
}

impl ClassificationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unavailable_lists_every_root() {
        let err = HuntError::RootUnavailable {
            roots: vec!["/a".to_string(), "/b".to_string()],
        };
        assert_eq!(err.to_string(), "no search root is available: /a, /b");
    }

    #[test]
    fn classification_error_converts_transparently() {
        let err: HuntError = ClassificationError::new("/r/a.class", "truncated").into();
        assert_eq!(err.to_string(), "could not classify /r/a.class: truncated");
    }
}
