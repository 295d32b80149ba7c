use crate::core::config::ConfigFile;
use crate::core::source::TraceSource;
use crate::input;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Section holding the trace set metadata in its config file
pub const TRACE_SECTION: &str = "Trace Config";

/// Global trace index interval assigned to an enabled trace set
///
/// `end` is `start + num_traces`; the set's traces occupy `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappedRange {
    pub start: usize,
    pub end: usize,
}

impl MappedRange {
    /// Whether global index `n` belongs to this set
    pub fn contains(&self, n: usize) -> bool {
        n >= self.start && n < self.end
    }
}

impl fmt::Display for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Metadata of one captured trace set plus its lazily loaded data
pub struct TraceSet {
    /// Included in the global trace index
    pub enabled: bool,
    /// Set only while enabled and after a validation pass
    pub mapped_range: Option<MappedRange>,
    pub num_traces: usize,
    /// Capture date as written by the capture tool
    pub date: String,
    /// File name prefix shared by all data files of the set
    pub prefix: String,
    /// Samples per trace
    pub points: usize,
    pub target_hw: String,
    pub target_sw: String,
    pub scope: String,
    /// Kept as text: capture tools write both plain numbers and labels
    pub sample_rate: String,
    pub y_scale: f64,
    pub y_units: String,
    pub notes: String,

    /// Config file this set was loaded from or last saved to
    pub config_path: Option<PathBuf>,

    pub(crate) data: Option<Box<dyn TraceSource>>,
}

impl Default for TraceSet {
    fn default() -> Self {
        Self {
            enabled: false,
            mapped_range: None,
            num_traces: 0,
            date: String::new(),
            prefix: String::new(),
            points: 0,
            target_hw: String::new(),
            target_sw: String::new(),
            scope: String::new(),
            sample_rate: "0".to_string(),
            y_scale: 1.0,
            y_units: "digits".to_string(),
            notes: String::new(),
            config_path: None,
            data: None,
        }
    }
}

impl fmt::Debug for TraceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSet")
            .field("enabled", &self.enabled)
            .field("mapped_range", &self.mapped_range)
            .field("num_traces", &self.num_traces)
            .field("prefix", &self.prefix)
            .field("points", &self.points)
            .field("config_path", &self.config_path)
            .field("loaded", &self.data.is_some())
            .finish_non_exhaustive()
    }
}

impl TraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a trace set description from its config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = ConfigFile::load(path)?;

        let mut set = Self::from_config(&config)
            .with_context(|| format!("Invalid trace config: {:?}", path))?;
        set.config_path = Some(path.to_path_buf());

        debug!("Loaded trace set {:?}: {} traces x {} points", path, set.num_traces, set.points);
        Ok(set)
    }

    /// Read every schema key; any missing or malformed key fails the whole read
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        let s = TRACE_SECTION;
        Ok(Self {
            num_traces: config.get_usize(s, "NumTraces")?,
            date: config.get(s, "Date")?.to_string(),
            prefix: config.get(s, "Prefix")?.to_string(),
            points: config.get_usize(s, "Points")?,
            target_hw: config.get(s, "TargetHW")?.to_string(),
            target_sw: config.get(s, "TargetSW")?.to_string(),
            scope: config.get(s, "ScopeName")?.to_string(),
            sample_rate: config.get(s, "ScopeSampleRate")?.to_string(),
            y_scale: config.get_f64(s, "ScopeYScale")?,
            y_units: config.get(s, "ScopeYUnits")?.to_string(),
            notes: config.get(s, "Notes")?.to_string(),
            ..Self::default()
        })
    }

    /// Write the schema keys into `config`
    pub fn write_config(&self, config: &mut ConfigFile) {
        let s = TRACE_SECTION;
        config.set(s, "NumTraces", self.num_traces);
        config.set(s, "Date", &self.date);
        config.set(s, "Prefix", &self.prefix);
        config.set(s, "Points", self.points);
        config.set(s, "TargetHW", &self.target_hw);
        config.set(s, "TargetSW", &self.target_sw);
        config.set(s, "ScopeName", &self.scope);
        config.set(s, "ScopeSampleRate", &self.sample_rate);
        config.set(s, "ScopeYScale", self.y_scale);
        config.set(s, "ScopeYUnits", &self.y_units);
        config.set(s, "Notes", &self.notes);
    }

    /// Save to `path`, or to the file the set came from when `None`
    pub fn save(&mut self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            self.config_path = Some(path.to_path_buf());
        }
        let path = self
            .config_path
            .as_deref()
            .context("Trace set has no config file to save to")?;

        let mut config = ConfigFile::new();
        self.write_config(&mut config);
        config.save(path)?;

        info!("Saved trace config {:?}", path);
        Ok(())
    }

    /// Compare against the on-disk copy and name the first field that differs
    ///
    /// Fields are compared in schema order; `None` means the file matches.
    pub fn check(&self, path: Option<&Path>) -> Result<Option<&'static str>> {
        let path = path
            .or(self.config_path.as_deref())
            .context("Trace set has no config file to check against")?;
        let disk = Self::from_config(&ConfigFile::load(path)?)
            .with_context(|| format!("Invalid trace config: {:?}", path))?;

        let changed = [
            ("num_traces", self.num_traces == disk.num_traces),
            ("date", self.date == disk.date),
            ("prefix", self.prefix == disk.prefix),
            ("points", self.points == disk.points),
            ("target_hw", self.target_hw == disk.target_hw),
            ("target_sw", self.target_sw == disk.target_sw),
            ("scope", self.scope == disk.scope),
            ("sample_rate", self.sample_rate == disk.sample_rate),
            ("y_scale", self.y_scale == disk.y_scale),
            ("y_units", self.y_units == disk.y_units),
            ("notes", self.notes == disk.notes),
        ]
        .into_iter()
        .find(|(_, same)| !same)
        .map(|(name, _)| name);

        if let Some(field) = changed {
            debug!("Trace config {:?} changed on disk: {}", path, field);
        }
        Ok(changed)
    }

    /// Directory holding the set's data files
    pub fn data_dir(&self) -> Option<&Path> {
        self.config_path.as_deref().and_then(Path::parent)
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// Attach already loaded trace data
    pub fn set_data(&mut self, data: Box<dyn TraceSource>) {
        self.data = Some(data);
    }

    pub fn data(&self) -> Option<&dyn TraceSource> {
        self.data.as_deref()
    }

    /// Load the trace data next to the config file, once
    pub fn ensure_loaded(&mut self) -> Result<&dyn TraceSource> {
        if self.data.is_none() {
            let dir = self
                .data_dir()
                .context("Trace set has no config file; cannot locate its data")?
                .to_path_buf();
            let batch = input::load_traces(&dir, &self.prefix)?;
            info!("Loaded {} traces for prefix {}", batch.traces.len(), self.prefix);
            self.data = Some(Box::new(batch));
        }

        self.data
            .as_deref()
            .context("Trace data unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigError;

    fn sample_set() -> TraceSet {
        TraceSet {
            num_traces: 50,
            date: "2013-03-26 15:27:50".to_string(),
            prefix: "2013.03.26-15.27.50_".to_string(),
            points: 3000,
            target_hw: "ATMega328P".to_string(),
            target_sw: "AES-128".to_string(),
            scope: "PicoScope 6403".to_string(),
            sample_rate: "100E6".to_string(),
            y_scale: 0.5,
            y_units: "mV".to_string(),
            notes: "bench run".to_string(),
            ..TraceSet::default()
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_2013.03.26-15.27.50_.cfg");

        let mut set = sample_set();
        set.save(Some(&path)).unwrap();

        let loaded = TraceSet::load(&path).unwrap();
        assert_eq!(loaded.num_traces, 50);
        assert_eq!(loaded.prefix, "2013.03.26-15.27.50_");
        assert_eq!(loaded.sample_rate, "100E6");
        assert_eq!(loaded.y_scale, 0.5);
        assert_eq!(loaded.config_path.as_deref(), Some(path.as_path()));
        assert!(!loaded.enabled);
        assert!(loaded.mapped_range.is_none());
    }

    #[test]
    fn test_missing_key_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.cfg");
        std::fs::write(&path, "[Trace Config]\nNumTraces = 5\nDate = today\n").unwrap();

        let err = TraceSet::load(&path).unwrap_err();
        let cause = err.downcast_ref::<ConfigError>().unwrap();
        assert_eq!(
            cause,
            &ConfigError::MissingKey {
                section: TRACE_SECTION.to_string(),
                key: "Prefix".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_number_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_a_.cfg");
        let mut set = sample_set();
        set.save(Some(&path)).unwrap();

        for (key, value) in [("ScopeYScale", "half"), ("NumTraces", "-3"), ("Points", "1e3")] {
            let mut config = ConfigFile::load(&path).unwrap();
            config.set(TRACE_SECTION, key, value);
            let broken = dir.path().join("broken.cfg");
            config.save(&broken).unwrap();

            let err = TraceSet::load(&broken).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<ConfigError>(),
                    Some(ConfigError::InvalidValue { key: k, .. }) if k == key
                ),
                "{} = {} should not load",
                key,
                value
            );
        }
    }

    #[test]
    fn test_check_reports_first_difference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cfg");

        let mut set = sample_set();
        set.save(Some(&path)).unwrap();
        assert_eq!(set.check(None).unwrap(), None);

        // Edit two fields on disk; only the first in schema order is reported
        let mut config = ConfigFile::load(&path).unwrap();
        config.set(TRACE_SECTION, "Notes", "edited");
        config.set(TRACE_SECTION, "Points", 10);
        config.save(&path).unwrap();

        assert_eq!(set.check(None).unwrap(), Some("points"));
    }

    #[test]
    fn test_mapped_range_contains() {
        let range = MappedRange { start: 11, end: 16 };
        assert!(!range.contains(10));
        assert!(range.contains(11));
        assert!(range.contains(15));
        assert!(!range.contains(16));
        assert_eq!(range.to_string(), "11-16");
    }

    #[test]
    fn test_ensure_loaded_without_config_path() {
        let mut set = TraceSet::new();
        assert!(set.ensure_loaded().is_err());
    }
}
