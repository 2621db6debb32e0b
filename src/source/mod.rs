use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const SOURCE_EXTENSION: &str = "dsp";

/// Where module sources come from. Caching is not this trait's concern.
pub trait SourceStore: Send + Sync {
    fn load_source(&self, identity: &str) -> Option<String>;

    fn list_identities(&self) -> Vec<String>;

    /// Creates a template source for `identity` if none exists yet. Returns
    /// whether a new source was written.
    fn create_source(&self, identity: &str) -> Result<bool>;
}

/// Sources stored as `<root>/<identity>.dsp`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).context("Failed to create source directory")?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.{SOURCE_EXTENSION}"))
    }
}

impl SourceStore for DirectorySource {
    fn load_source(&self, identity: &str) -> Option<String> {
        let path = self.source_path(identity);
        if !path.is_file() {
            warn!("Source file not found: {}", path.display());
            return None;
        }

        match fs::read_to_string(&path) {
            Ok(text) => {
                debug!("Loaded source {}", path.display());
                Some(text)
            }
            Err(e) => {
                warn!("Failed to read source {}: {e}", path.display());
                None
            }
        }
    }

    fn list_identities(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan {}: {e}", self.root.display());
                return Vec::new();
            }
        };

        let mut identities: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some(SOURCE_EXTENSION))
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .collect();

        identities.sort();
        identities
    }

    fn create_source(&self, identity: &str) -> Result<bool> {
        let path = self.source_path(identity);
        if path.exists() {
            return Ok(false);
        }

        fs::create_dir_all(&self.root).context("Failed to create source directory")?;
        fs::write(&path, template(identity))
            .with_context(|| format!("Failed creating file \"{}\"", path.display()))?;

        info!("Created source {}", path.display());
        Ok(true)
    }
}

fn template(identity: &str) -> String {
    format!(
        "// Hotpatch source file: {identity}\n// Created on {}\nprocess _\n",
        Local::now().format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_source_is_none() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = DirectorySource::new(tmp.path())?;

        assert!(store.load_source("Nothing").is_none());
        Ok(())
    }

    #[test]
    fn test_create_source_writes_template_once() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = DirectorySource::new(&tmp.path().join("library"))?;

        assert!(store.create_source("Gain")?);
        let text = store.load_source("Gain").unwrap();
        assert!(text.starts_with("// Hotpatch source file: Gain\n"));
        assert!(text.ends_with("process _\n"));

        fs::write(store.source_path("Gain"), "process _ clip\n")?;
        assert!(!store.create_source("Gain")?);
        assert_eq!(store.load_source("Gain").unwrap(), "process _ clip\n");

        Ok(())
    }

    #[test]
    fn test_list_identities_sorted_dsp_only() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = DirectorySource::new(tmp.path())?;
        fs::write(tmp.path().join("Zeta.dsp"), "")?;
        fs::write(tmp.path().join("Alpha.dsp"), "")?;
        fs::write(tmp.path().join("shared.lib"), "")?;

        assert_eq!(store.list_identities(), vec!["Alpha", "Zeta"]);
        Ok(())
    }
}
