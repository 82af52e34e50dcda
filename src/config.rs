use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::archive::DEFAULT_MAX_NESTING_DEPTH;
use crate::filter::CheckFileOption;

pub const CONFIG_ENV_VAR: &str = "CLASS_HUNTER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HunterConfig {
    pub check_file_option: CheckFileOption,
    /// Extensions worth sniffing for archive content; empty sniffs every
    /// entry.
    pub archive_extensions: Vec<String>,
    pub include_hidden: bool,
    /// Scan distinct roots on the rayon pool. Entries under one root are
    /// always scanned in order.
    pub parallel: bool,
    pub max_nesting_depth: usize,
}

impl Default for HunterConfig {
    fn default() -> Self {
        Self {
            check_file_option: CheckFileOption::default(),
            archive_extensions: ["jar", "zip", "war", "ear"].map(String::from).to_vec(),
            include_hidden: true,
            parallel: true,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

impl HunterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Explicit path, then `CLASS_HUNTER_CONFIG`, then the per-user config
    /// file if present, then defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(p) = env::var(CONFIG_ENV_VAR)
            && !p.is_empty()
        {
            return Self::load(Path::new(&p));
        }

        if let Some(default_path) = default_config_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("class-hunter").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fill_in_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "check-file-option": "by-name-and-signature", "parallel": false }"#,
        )?;

        let config = HunterConfig::load_or_default(Some(&path))?;
        assert_eq!(config.check_file_option, CheckFileOption::ByNameAndSignature);
        assert!(!config.parallel);
        assert_eq!(config.archive_extensions, HunterConfig::default().archive_extensions);
        assert_eq!(config.max_nesting_depth, DEFAULT_MAX_NESTING_DEPTH);
        Ok(())
    }

    #[test]
    fn broken_file_reports_its_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json")?;

        let err = HunterConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
        Ok(())
    }

    #[test]
    fn serializes_kebab_case() -> Result<()> {
        let json = serde_json::to_string(&HunterConfig::default())?;
        assert!(json.contains("\"check-file-option\":\"by-name\""));
        assert!(json.contains("\"max-nesting-depth\":8"));
        Ok(())
    }
}
