use crate::core::TraceBatch;
use crate::input::npy;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path of one native data file: `<dir>/<prefix><name>.npy`
pub fn data_file(dir: &Path, prefix: &str, name: &str) -> PathBuf {
    dir.join(format!("{}{}.npy", prefix, name))
}

/// Whether `dir` holds a native trace set for `prefix`
pub fn exists(dir: &Path, prefix: &str) -> bool {
    data_file(dir, prefix, "traces").is_file()
}

/// Load every trace of a native set into memory
///
/// Only `<prefix>traces.npy` is required; text and key files are optional.
pub fn load_native(dir: &Path, prefix: &str) -> Result<TraceBatch> {
    let traces_path = data_file(dir, prefix, "traces");
    let traces = npy::read(&traces_path)?.to_rows();

    let mut batch = TraceBatch::new(traces);
    batch.textin = load_bytes(&data_file(dir, prefix, "textin"))?;
    batch.textout = load_bytes(&data_file(dir, prefix, "textout"))?;
    batch.known_key = load_bytes(&data_file(dir, prefix, "knownkey"))?
        .into_iter()
        .next();

    batch
        .validate()
        .with_context(|| format!("Inconsistent trace set {:?}", traces_path))?;

    debug!(
        "Native set {}: {} traces, {} points, key {}",
        prefix,
        batch.traces.len(),
        batch.traces.first().map(|t| t.len()).unwrap_or(0),
        if batch.known_key.is_some() { "present" } else { "absent" }
    );
    Ok(batch)
}

fn load_bytes(path: &Path) -> Result<Vec<Vec<u8>>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let rows = npy::read(path)?
        .to_byte_rows()
        .with_context(|| format!("Expected byte values in {:?}", path))?;
    Ok(rows)
}

/// Write a batch as a native set under `dir`
pub fn write_native(dir: &Path, prefix: &str, batch: &TraceBatch) -> Result<()> {
    batch.validate()?;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    npy::write_f64_rows(data_file(dir, prefix, "traces"), &batch.traces)?;
    if !batch.textin.is_empty() {
        npy::write_u8_rows(data_file(dir, prefix, "textin"), &batch.textin)?;
    }
    if !batch.textout.is_empty() {
        npy::write_u8_rows(data_file(dir, prefix, "textout"), &batch.textout)?;
    }
    if let Some(key) = &batch.known_key {
        npy::write_u8(data_file(dir, prefix, "knownkey"), key)?;
    }

    debug!("Wrote native set {} to {:?}", prefix, dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = TraceBatch::new(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);
        batch.textin = vec![vec![0, 1], vec![2, 3]];
        batch.textout = vec![vec![4, 5], vec![6, 7]];
        batch.known_key = Some(vec![0xde, 0xad]);

        write_native(dir.path(), "run1_", &batch).unwrap();
        assert!(exists(dir.path(), "run1_"));
        assert!(dir.path().join("run1_knownkey.npy").is_file());

        let loaded = load_native(dir.path(), "run1_").unwrap();
        assert_eq!(loaded, batch);
    }

    #[test]
    fn test_optional_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        let batch = TraceBatch::new(vec![vec![1.0], vec![2.0]]);
        write_native(dir.path(), "bare_", &batch).unwrap();

        let loaded = load_native(dir.path(), "bare_").unwrap();
        assert!(loaded.textin.is_empty());
        assert!(loaded.known_key.is_none());
    }

    #[test]
    fn test_missing_traces_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!exists(dir.path(), "none_"));
        assert!(load_native(dir.path(), "none_").is_err());
    }

    #[test]
    fn test_key_from_two_dimensional_file() {
        let dir = tempfile::tempdir().unwrap();
        npy::write_f64_rows(data_file(dir.path(), "k_", "traces"), &[vec![1.0]]).unwrap();
        npy::write_u8_rows(data_file(dir.path(), "k_", "knownkey"), &[vec![9, 8], vec![7, 6]]).unwrap();

        let loaded = load_native(dir.path(), "k_").unwrap();
        assert_eq!(loaded.known_key, Some(vec![9, 8]));
    }
}
