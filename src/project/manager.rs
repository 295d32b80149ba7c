use crate::core::{ConfigFile, TraceSet, TraceSource, TRACE_SECTION};
use crate::input;
use crate::project::mapping::{assign_ranges, TraceIndex};
use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

/// Section of the project file listing its trace sets
pub const PROJECT_SECTION: &str = "Trace Management";

/// Notifications for whoever displays the project
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectEvent {
    TraceAdded { row: usize },
    TraceRemoved { row: usize },
    MappingChanged { num_traces: usize, num_points: usize },
}

/// Asked for a replacement prefix when a copy would overwrite existing files
///
/// Receives the colliding prefix without trailing underscores. An empty
/// answer asks again; returning `None` cancels the copy.
pub trait PrefixPrompt {
    fn new_prefix(&mut self, current: &str) -> Option<String>;
}

impl<F: FnMut(&str) -> Option<String>> PrefixPrompt for F {
    fn new_prefix(&mut self, current: &str) -> Option<String> {
        self(current)
    }
}

/// Parameters for turning a DPA Contest v3 export into a project trace set
#[derive(Debug, Clone, Default)]
pub struct DpaV3Import {
    pub source_dir: PathBuf,
    pub prefix: String,
    pub target_hw: String,
    pub target_sw: String,
    pub scope: String,
    pub sample_rate: String,
    pub notes: String,
}

/// One line of the trace table
#[derive(Debug, Clone, Serialize)]
pub struct TraceRow {
    pub enabled: bool,
    pub mapped_range: Option<String>,
    pub num_traces: usize,
    pub points: usize,
    pub date: String,
    pub file: String,
    pub target_hw: String,
    pub target_sw: String,
    pub scope: String,
    pub sample_rate: String,
    pub notes: String,
}

/// Name of the config file describing the set with `prefix`
pub fn config_file_name(prefix: &str) -> String {
    format!("config_{}.cfg", prefix)
}

/// Directory holding the trace sets of a project file (`foo.cwp` -> `foo_data/traces`)
pub fn project_traces_dir(project_file: &Path) -> PathBuf {
    let stem = project_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    project_dir(project_file).join(format!("{}_data", stem)).join("traces")
}

fn project_dir(project_file: &Path) -> PathBuf {
    project_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// `path` resolved against the working directory; empty means the working directory
fn absolute_path(path: &Path) -> Result<PathBuf> {
    let resolved = if path.as_os_str().is_empty() {
        std::env::current_dir()
    } else {
        std::path::absolute(path)
    };
    resolved.with_context(|| format!("Cannot resolve {:?}", path))
}

/// Express `path` relative to `base`, or absolute if they share no root
fn relative_path(path: &Path, base: &Path) -> Result<PathBuf> {
    let path = absolute_path(path)?;
    let base = absolute_path(base)?;
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();

    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    if common == 0 {
        return Ok(path.clone());
    }

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part);
    }
    Ok(rel)
}

/// Parse the numeric suffix of keys like `tracefile3`
fn key_index(key: &str, stem: &str) -> Option<usize> {
    let lower = key.to_ascii_lowercase();
    lower.strip_prefix(stem)?.parse().ok()
}

/// The trace sets of one project and the global index over them
///
/// Row order is mapping order. Every change to the enabled flags goes
/// through `validate`, which reassigns ranges and refreshes the index.
pub struct TraceManager {
    sets: Vec<TraceSet>,
    index: TraceIndex,
    traces_dir: PathBuf,
    events: Option<Sender<ProjectEvent>>,
}

impl TraceManager {
    /// Manager copying and importing trace sets into `traces_dir`
    pub fn new(traces_dir: impl Into<PathBuf>) -> Self {
        Self {
            sets: Vec::new(),
            index: TraceIndex::new(),
            traces_dir: traces_dir.into(),
            events: None,
        }
    }

    /// Manager for the project stored in `project_file`
    pub fn for_project_file(project_file: &Path) -> Self {
        Self::new(project_traces_dir(project_file))
    }

    /// Receive change notifications; replaces any earlier subscriber
    pub fn subscribe(&mut self) -> Receiver<ProjectEvent> {
        let (tx, rx) = mpsc::channel();
        self.events = Some(tx);
        rx
    }

    fn notify(&self, event: ProjectEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver just means nobody is watching anymore
            let _ = tx.send(event);
        }
    }

    pub fn traces_dir(&self) -> &Path {
        &self.traces_dir
    }

    pub fn sets(&self) -> &[TraceSet] {
        &self.sets
    }

    pub fn index(&self) -> &TraceIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Drop all trace sets
    pub fn new_project(&mut self) {
        self.sets.clear();
        self.index.reset();
    }

    /// Append a trace set as a new row, returning the row
    pub fn push(&mut self, set: TraceSet) -> usize {
        self.sets.push(set);
        let row = self.sets.len() - 1;
        self.notify(ProjectEvent::TraceAdded { row });
        row
    }

    /// Add a reference to a trace set in place; nothing is copied
    pub fn add_existing(&mut self, config_path: &Path) -> Result<usize> {
        let set = TraceSet::load(config_path)?;
        info!("Added reference to {:?}", config_path);
        Ok(self.push(set))
    }

    /// Copy a trace set into the project's traces directory and add it
    ///
    /// Returns `None` when the prompt cancelled a prefix collision.
    pub fn copy_existing(
        &mut self,
        config_path: &Path,
        prompt: &mut dyn PrefixPrompt,
    ) -> Result<Option<usize>> {
        let cfg_name = config_path
            .file_name()
            .with_context(|| format!("Not a config file path: {:?}", config_path))?
            .to_string_lossy()
            .into_owned();
        let src_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut config = ConfigFile::load(config_path)?;
        let prefix = config.get(TRACE_SECTION, "prefix")?.to_string();
        if prefix.is_empty() {
            anyhow::bail!("Trace set {:?} has an empty prefix", config_path);
        }
        let prefix_stem = prefix.trim_end_matches('_').to_string();

        let mut new_prefix = prefix.clone();
        let mut target = self.traces_dir.join(&cfg_name);
        while target.exists() {
            let answer = match prompt.new_prefix(new_prefix.trim_end_matches('_')) {
                Some(answer) => answer,
                None => {
                    info!("Copy of {:?} cancelled", config_path);
                    return Ok(None);
                }
            };
            let answer = answer.trim().trim_end_matches('_');
            if answer.is_empty() {
                continue;
            }

            let renamed = if prefix_stem.is_empty() {
                format!("{}{}", answer, cfg_name)
            } else {
                cfg_name.replace(&prefix_stem, answer)
            };
            target = self.traces_dir.join(renamed);
            new_prefix = format!("{}_", answer);
        }

        fs::create_dir_all(&self.traces_dir)
            .with_context(|| format!("Failed to create {:?}", self.traces_dir))?;
        config.set(TRACE_SECTION, "Prefix", &new_prefix);
        config.save(&target)?;

        // Collect first: the target directory may be the source directory
        let mut sources = Vec::new();
        for entry in fs::read_dir(&src_dir).with_context(|| format!("Failed to list {:?}", src_dir))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_file() {
                if let Some(rest) = name.strip_prefix(&prefix) {
                    sources.push((entry.path(), rest.to_string()));
                }
            }
        }

        for (source, rest) in sources {
            let dest = self.traces_dir.join(format!("{}{}", new_prefix, rest));
            debug!("Copying {:?} -> {:?}", source, dest);
            fs::copy(&source, &dest)
                .with_context(|| format!("Failed to copy {:?} to {:?}", source, dest))?;
        }

        info!("Copied trace set {} into project as {}", prefix, new_prefix);
        let set = TraceSet::load(&target)?;
        Ok(Some(self.push(set)))
    }

    /// Convert a DPA Contest v3 export into a native set in the project
    pub fn import_dpav3(&mut self, request: &DpaV3Import) -> Result<usize> {
        let batch = input::load_dpav3(&request.source_dir, &request.prefix)?;

        let now = Local::now();
        let prefix = self.unused_prefix(&now.format("%Y.%m.%d-%H.%M.%S").to_string());
        input::write_native(&self.traces_dir, &prefix, &batch)?;

        let mut set = TraceSet {
            num_traces: batch.num_traces(),
            date: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            prefix: prefix.clone(),
            points: batch.num_points(),
            target_hw: request.target_hw.clone(),
            target_sw: request.target_sw.clone(),
            scope: request.scope.clone(),
            sample_rate: request.sample_rate.clone(),
            notes: request.notes.clone(),
            ..TraceSet::default()
        };
        if set.sample_rate.is_empty() {
            set.sample_rate = "0".to_string();
        }

        let cfg_path = self.traces_dir.join(config_file_name(&prefix));
        set.save(Some(&cfg_path))?;
        set.set_data(Box::new(batch));

        info!(
            "Imported DPAv3 set {:?} as {} ({} traces)",
            request.source_dir, prefix, set.num_traces
        );
        Ok(self.push(set))
    }

    /// `<stem>_`, or `<stem>-<n>_` if that is taken in the traces directory
    fn unused_prefix(&self, stem: &str) -> String {
        let taken = |p: &str| {
            self.traces_dir.join(config_file_name(p)).exists() || input::native::exists(&self.traces_dir, p)
        };

        let mut candidate = format!("{}_", stem);
        let mut n = 1;
        while taken(&candidate) {
            candidate = format!("{}-{}_", stem, n);
            n += 1;
        }
        candidate
    }

    /// Enable or disable a row, then revalidate
    ///
    /// If the data of an enabled set cannot be loaded the row keeps its
    /// previous flag and the mapping is left as it was.
    pub fn set_enabled(&mut self, row: usize, enabled: bool) -> Result<()> {
        let set = self
            .sets
            .get_mut(row)
            .with_context(|| format!("No trace set in row {}", row))?;
        let previous = std::mem::replace(&mut set.enabled, enabled);

        if let Err(e) = self.validate() {
            self.sets[row].enabled = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a row from the project (files stay on disk)
    pub fn remove(&mut self, row: usize) -> Result<TraceSet> {
        if row >= self.sets.len() {
            anyhow::bail!("No trace set in row {}", row);
        }
        let set = self.sets.remove(row);
        if let Err(e) = self.load_enabled() {
            self.sets.insert(row, set);
            return Err(e);
        }

        self.notify(ProjectEvent::TraceRemoved { row });
        self.remap();
        Ok(set)
    }

    /// Load data for every enabled set, then recompute the mapping
    ///
    /// Ranges and the index only change once all loads succeeded.
    pub fn validate(&mut self) -> Result<()> {
        self.load_enabled()?;
        self.remap();
        Ok(())
    }

    fn load_enabled(&mut self) -> Result<()> {
        for (row, set) in self.sets.iter_mut().enumerate() {
            if set.enabled {
                set.ensure_loaded()
                    .with_context(|| format!("Failed to load trace data for row {}", row))?;
            }
        }
        Ok(())
    }

    fn remap(&mut self) {
        assign_ranges(&mut self.sets);
        self.index.update(&self.sets);
        self.notify(ProjectEvent::MappingChanged {
            num_traces: self.index.num_traces(),
            num_points: self.index.num_points(),
        });
    }

    /// Rows whose config file no longer matches what was loaded, with the first changed field
    pub fn check_project(&self) -> Result<Vec<(usize, &'static str)>> {
        let mut changed = Vec::new();
        for (row, set) in self.sets.iter().enumerate() {
            if let Some(field) = set.check(None)? {
                warn!("Trace set in row {} changed on disk ({})", row, field);
                changed.push((row, field));
            }
        }
        Ok(changed)
    }

    /// Write the trace list into the project config
    ///
    /// Config paths are stored relative to the project file's directory.
    pub fn save_project(&self, config: &mut ConfigFile, project_file: &Path) -> Result<()> {
        let base = project_dir(project_file);

        config.remove_section(PROJECT_SECTION);
        config.add_section(PROJECT_SECTION);

        for (idx, set) in self.sets.iter().enumerate() {
            let Some(path) = &set.config_path else {
                warn!("Trace set in row {} has no config file; not saved", idx);
                continue;
            };
            let rel = relative_path(path, &base)?;
            config.set(PROJECT_SECTION, &format!("tracefile{}", idx), rel.to_string_lossy());
            config.set(
                PROJECT_SECTION,
                &format!("enabled{}", idx),
                if set.enabled { "True" } else { "False" },
            );
        }
        Ok(())
    }

    /// Save the trace list into `project_file`, keeping its other sections
    pub fn save_project_file(&self, project_file: &Path) -> Result<()> {
        let mut config = if project_file.exists() {
            ConfigFile::load(project_file)?
        } else {
            ConfigFile::new()
        };
        self.save_project(&mut config, project_file)?;
        config.save(project_file)?;

        info!("Saved project {:?} ({} trace sets)", project_file, self.sets.len());
        Ok(())
    }

    /// Replace the trace list with the one stored in `project_file`
    pub fn load_project(&mut self, project_file: &Path) -> Result<()> {
        let config = ConfigFile::load(project_file)?;
        let items = config.items(PROJECT_SECTION)?;
        let base = project_dir(project_file);

        let mut files = BTreeMap::new();
        let mut enabled = BTreeMap::new();
        for (key, value) in items {
            if let Some(idx) = key_index(key, "tracefile") {
                files.insert(idx, value.clone());
            } else if let Some(idx) = key_index(key, "enabled") {
                enabled.insert(idx, value.eq_ignore_ascii_case("true"));
            }
        }

        let mut sets = Vec::with_capacity(files.len());
        for (idx, file) in files {
            let path = base.join(&file);
            info!("Opening {:?}", path);
            let mut set = TraceSet::load(&path)?;
            set.enabled = enabled.get(&idx).copied().unwrap_or(false);
            sets.push(set);
        }

        self.new_project();
        self.traces_dir = project_traces_dir(project_file);
        for set in sets {
            self.push(set);
        }

        self.validate()
    }

    /// Table rows for display
    pub fn rows(&self) -> Vec<TraceRow> {
        self.sets
            .iter()
            .map(|s| TraceRow {
                enabled: s.enabled,
                mapped_range: s.mapped_range.map(|r| r.to_string()),
                num_traces: s.num_traces,
                points: s.points,
                date: s.date.clone(),
                file: s
                    .config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                target_hw: s.target_hw.clone(),
                target_sw: s.target_sw.clone(),
                scope: s.scope.clone(),
                sample_rate: s.sample_rate.clone(),
                notes: s.notes.clone(),
            })
            .collect()
    }

    pub fn get_trace(&self, n: usize) -> Result<Vec<f64>> {
        self.index.get_trace(&self.sets, n)
    }

    pub fn get_textin(&self, n: usize) -> Result<Vec<u8>> {
        self.index.get_textin(&self.sets, n)
    }

    pub fn get_textout(&self, n: usize) -> Result<Vec<u8>> {
        self.index.get_textout(&self.sets, n)
    }

    pub fn known_key(&self) -> Option<&[u8]> {
        self.index.known_key()
    }

    pub fn num_traces(&self) -> usize {
        self.index.num_traces()
    }

    pub fn num_points(&self) -> usize {
        self.index.num_points()
    }
}
