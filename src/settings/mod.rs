use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dsp::ProcessSpec;

impl std::fmt::Display for AudioSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sample Rate: {}", self.sample_rate)?;
        writeln!(f, "Block Size: {}", self.block_size)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub block_size: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 128,
        }
    }
}

impl AudioSettings {
    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            sample_rate: f64::from(self.sample_rate),
            block_size: self.block_size as usize,
        }
    }
}

impl std::fmt::Display for CompilerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Source Directory: {}", self.source_dir)?;
        writeln!(
            f,
            "Global Library Directory: {}",
            self.global_library_dir.as_deref().unwrap_or("None")
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Where `<identity>.dsp` sources live
    pub source_dir: String,
    /// Install prefix of shared libraries, searched under `share/hotpatch`
    pub global_library_dir: Option<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            source_dir: "./patches".to_string(),
            global_library_dir: Some("/usr/local".to_string()),
        }
    }
}

impl CompilerSettings {
    /// The source directory first, then the global library directory if it
    /// exists.
    pub fn library_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(&self.source_dir)];

        if let Some(prefix) = &self.global_library_dir {
            let global = Path::new(prefix).join("share").join("hotpatch");
            if global.is_dir() {
                paths.push(global);
            }
        }
        paths
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub audio: AudioSettings,
    pub compiler: CompilerSettings,
    pub tree_path: String,
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "------------------------------")?;

        writeln!(f, "Audio Settings:")?;
        writeln!(f, "{}", self.audio)?;

        writeln!(f, "Compiler Settings:")?;
        writeln!(f, "{}", self.compiler)?;

        writeln!(f, "Parameter Tree: {}", self.tree_path)?;
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audio: AudioSettings::default(),
            compiler: CompilerSettings::default(),
            tree_path: "./patches/tree.json".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_settings_path())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_settings_path())
    }

    pub fn load_from(settings_path: &Path) -> Result<Self> {
        if settings_path.exists() {
            let contents =
                fs::read_to_string(settings_path).context("Failed to read settings file")?;
            let settings: Settings =
                serde_json::from_str(&contents).context("Failed to parse settings")?;
            debug!("Loaded settings from {:?}", settings_path);
            Ok(settings)
        } else {
            info!("No settings file found, using defaults");
            let settings = Settings::default();
            // Try to save defaults, but don't fail if we can't
            let _ = settings.save_to(settings_path);
            Ok(settings)
        }
    }

    pub fn save_to(&self, settings_path: &Path) -> Result<()> {
        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(settings_path, json).context("Failed to write settings file")?;

        debug!("Saved settings to {:?}", settings_path);
        Ok(())
    }

    fn get_settings_path() -> PathBuf {
        const SETTINGS_FILENAME: &str = "settings.json";

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_dir)
                .join("hotpatch")
                .join(SETTINGS_FILENAME)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("hotpatch")
                .join(SETTINGS_FILENAME)
        } else {
            PathBuf::from(".").join(SETTINGS_FILENAME)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_writes_defaults() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("config").join("settings.json");

        let settings = Settings::load_from(&path)?;
        assert_eq!(settings.audio.sample_rate, 48000);
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("settings.json");

        let mut settings = Settings::default();
        settings.audio.block_size = 256;
        settings.compiler.global_library_dir = None;
        settings.save_to(&path)?;

        let loaded = Settings::load_from(&path)?;
        assert_eq!(loaded.audio.block_size, 256);
        assert_eq!(loaded.compiler.global_library_dir, None);
        Ok(())
    }

    #[test]
    fn test_library_paths_skip_missing_global_dir() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let mut compiler = CompilerSettings {
            source_dir: "./patches".to_string(),
            global_library_dir: Some(tmp.path().display().to_string()),
        };
        assert_eq!(compiler.library_paths(), vec![PathBuf::from("./patches")]);

        let global = tmp.path().join("share").join("hotpatch");
        fs::create_dir_all(&global)?;
        assert_eq!(
            compiler.library_paths(),
            vec![PathBuf::from("./patches"), global]
        );

        compiler.global_library_dir = None;
        assert_eq!(compiler.library_paths().len(), 1);
        Ok(())
    }

    #[test]
    fn test_audio_settings_spec() {
        let spec = AudioSettings::default().process_spec();
        assert_eq!(spec.sample_rate, 48000.0);
        assert_eq!(spec.block_size, 128);
    }
}
