use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persistent user settings shared between runs
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Last trace config file opened through `add` or `copy`
    pub trace_last_file: Option<PathBuf>,
    /// Last project file worked on
    pub last_project: Option<PathBuf>,
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tracebench").join("settings.json"))
    }

    /// Load from the user config dir; missing or unreadable files give defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path).map(|c| serde_json::from_str::<Settings>(&c)) {
            Ok(Ok(settings)) => settings,
            Ok(Err(e)) => {
                warn!("Ignoring malformed settings {:?}: {}", path, e);
                Self::default()
            }
            Err(e) => {
                warn!("Cannot read settings {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save to the user config dir; failures are logged, not fatal
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            self.save_to(&path);
        }
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => match fs::write(path, json) {
                Ok(()) => debug!("Saved settings to {:?}", path),
                Err(e) => warn!("Cannot write settings {:?}: {}", path, e),
            },
            Err(e) => warn!("Cannot serialize settings: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = Settings {
            trace_last_file: Some(PathBuf::from("/captures/config_a_.cfg")),
            last_project: None,
        };
        settings.save_to(&path);
        assert_eq!(Settings::load_from(&path), settings);
    }

    #[test]
    fn test_missing_or_malformed_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(Settings::load_from(&path), Settings::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }
}
