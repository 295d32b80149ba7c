use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading values out of a config document
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing section [{0}]")]
    MissingSection(String),

    #[error("missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("invalid value '{value}' for key '{key}': expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// One `[name]` block of key/value pairs, in file order
#[derive(Debug, Clone, PartialEq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }
}

/// INI-style config document
///
/// Section names are case-sensitive, keys are not (`Prefix` and `prefix`
/// name the same entry). Insertion order is kept so files written back look
/// like the ones that were read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    sections: Vec<Section>,
}

impl ConfigFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Parse config text
    pub fn parse(content: &str) -> std::result::Result<Self, ConfigError> {
        let mut config = Self::new();
        let mut last_key: Option<usize> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            // Indented line continues the previous value
            if raw.starts_with(|c: char| c == ' ' || c == '\t') {
                if let (Some(section), Some(key_idx)) = (config.sections.last_mut(), last_key) {
                    let value = &mut section.entries[key_idx].1;
                    value.push('\n');
                    value.push_str(line);
                    continue;
                }
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::Syntax {
                    line: line_no,
                    message: format!("unterminated section header: {}", line),
                })?;
                config.add_section(name.trim());
                last_key = None;
                continue;
            }

            let split = line.find(|c: char| c == '=' || c == ':').ok_or_else(|| ConfigError::Syntax {
                line: line_no,
                message: format!("expected 'key = value', got: {}", line),
            })?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();

            let section = config.sections.last_mut().ok_or_else(|| ConfigError::Syntax {
                line: line_no,
                message: "key outside of any section".to_string(),
            })?;

            last_key = Some(match section.find(key) {
                Some(pos) => {
                    section.entries[pos] = (key.to_string(), value.to_string());
                    pos
                }
                None => {
                    section.entries.push((key.to_string(), value.to_string()));
                    section.entries.len() - 1
                }
            });
        }

        Ok(config)
    }

    /// Save config to disk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_ini_string())
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Convert to INI text
    pub fn to_ini_string(&self) -> String {
        let mut output = String::new();

        for section in &self.sections {
            output.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.entries {
                // Multi-line values are written as indented continuation lines
                let value = value.replace('\n', "\n\t");
                output.push_str(&format!("{} = {}\n", key, value));
            }
            output.push('\n');
        }

        output
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    /// Add an empty section; does nothing if it already exists
    pub fn add_section(&mut self, name: &str) {
        if !self.has_section(name) {
            self.sections.push(Section::new(name));
        }
    }

    /// Remove a section and all of its keys, returning whether it existed
    pub fn remove_section(&mut self, name: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.name != name);
        before != self.sections.len()
    }

    /// Section names in file order
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// All key/value pairs of a section in file order
    pub fn items(&self, section: &str) -> std::result::Result<&[(String, String)], ConfigError> {
        self.section(section)
            .map(|s| s.entries.as_slice())
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))
    }

    /// Get a raw string value
    pub fn get(&self, section: &str, key: &str) -> std::result::Result<&str, ConfigError> {
        let sec = self
            .section(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;

        sec.find(key)
            .map(|pos| sec.entries[pos].1.as_str())
            .ok_or_else(|| ConfigError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_usize(&self, section: &str, key: &str) -> std::result::Result<usize, ConfigError> {
        self.get_parsed(section, key, "an unsigned integer")
    }

    pub fn get_f64(&self, section: &str, key: &str) -> std::result::Result<f64, ConfigError> {
        self.get_parsed(section, key, "a number")
    }

    /// Booleans accept the spellings config files in the wild use
    pub fn get_bool(&self, section: &str, key: &str) -> std::result::Result<bool, ConfigError> {
        let value = self.get(section, key)?;
        match value.to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                expected: "a boolean",
            }),
        }
    }

    /// Set a value, creating the section if needed
    pub fn set(&mut self, section: &str, key: &str, value: impl ToString) {
        self.add_section(section);
        let value = value.to_string();

        if let Some(sec) = self.sections.iter_mut().find(|s| s.name == section) {
            match sec.find(key) {
                Some(pos) => sec.entries[pos] = (key.to_string(), value),
                None => sec.entries.push((key.to_string(), value)),
            }
        }
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn get_parsed<T: FromStr>(
        &self,
        section: &str,
        key: &str,
        expected: &'static str,
    ) -> std::result::Result<T, ConfigError> {
        let value = self.get(section, key)?;
        value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# capture settings
[Trace Config]
NumTraces = 100
Prefix: 2013.03.26-15.27.50_
Notes = first line
\tsecond line

[Other]
; ignored
key=value
";

    #[test]
    fn test_parse_sections_and_keys() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        let names: Vec<_> = config.section_names().collect();
        assert_eq!(names, vec!["Trace Config", "Other"]);
        assert_eq!(config.get_usize("Trace Config", "NumTraces").unwrap(), 100);
        assert_eq!(config.get("Trace Config", "Prefix").unwrap(), "2013.03.26-15.27.50_");
        assert_eq!(config.get("Other", "key").unwrap(), "value");
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(config.get("Trace Config", "prefix").unwrap(), "2013.03.26-15.27.50_");
        assert_eq!(config.get("Trace Config", "NUMTRACES").unwrap(), "100");
    }

    #[test]
    fn test_continuation_lines() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(config.get("Trace Config", "Notes").unwrap(), "first line\nsecond line");

        let reparsed = ConfigFile::parse(&config.to_ini_string()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_missing_section_and_key() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(
            config.get("Nope", "x"),
            Err(ConfigError::MissingSection("Nope".to_string()))
        );
        assert!(matches!(
            config.get("Trace Config", "Points"),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_invalid_number() {
        let config = ConfigFile::parse("[a]\nn = ten\n").unwrap();
        assert!(matches!(
            config.get_usize("a", "n"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_key_outside_section_is_error() {
        assert!(matches!(
            ConfigFile::parse("n = 1\n"),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_set_replaces_existing_key() {
        let mut config = ConfigFile::new();
        config.set("Trace Config", "Prefix", "a_");
        config.set("Trace Config", "prefix", "b_");
        assert_eq!(config.items("Trace Config").unwrap().len(), 1);
        assert_eq!(config.get("Trace Config", "Prefix").unwrap(), "b_");
    }

    #[test]
    fn test_get_bool() {
        let config = ConfigFile::parse("[p]\na = True\nb = false\nc = maybe\n").unwrap();
        assert!(config.get_bool("p", "a").unwrap());
        assert!(!config.get_bool("p", "b").unwrap());
        assert!(config.get_bool("p", "c").is_err());
    }

    #[test]
    fn test_remove_section() {
        let mut config = ConfigFile::parse(SAMPLE).unwrap();
        assert!(config.remove_section("Other"));
        assert!(!config.has_section("Other"));
        assert!(!config.remove_section("Other"));
    }
}
