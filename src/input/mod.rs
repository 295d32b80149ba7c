pub mod dpav3;
pub mod native;
pub mod npy;

pub use dpav3::load_dpav3;
pub use native::{load_native, write_native};

use crate::core::TraceBatch;
use anyhow::Result;
use std::path::Path;

/// On-disk layout of a trace set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// `.npy` files written by the capture tool
    Native,
    /// DPA Contest v3 text export
    DpaV3,
    Unknown,
}

/// Detect the format of the trace set `prefix` in `dir` by the files present
pub fn detect_format(dir: &Path, prefix: &str) -> InputFormat {
    if native::exists(dir, prefix) {
        return InputFormat::Native;
    }

    if dpav3::exists(dir, prefix) {
        return InputFormat::DpaV3;
    }

    InputFormat::Unknown
}

/// Load a trace set, auto-detecting its format
pub fn load_traces(dir: &Path, prefix: &str) -> Result<TraceBatch> {
    match detect_format(dir, prefix) {
        InputFormat::Native => load_native(dir, prefix),
        InputFormat::DpaV3 => load_dpav3(dir, prefix),
        InputFormat::Unknown => anyhow::bail!("No trace data for prefix '{}' in {:?}", prefix, dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_format(dir.path(), "a_"), InputFormat::Unknown);
        assert!(load_traces(dir.path(), "a_").is_err());

        std::fs::write(dir.path().join("a_traces.txt"), "1 2\n").unwrap();
        assert_eq!(detect_format(dir.path(), "a_"), InputFormat::DpaV3);

        write_native(dir.path(), "a_", &TraceBatch::new(vec![vec![1.0, 2.0]])).unwrap();
        assert_eq!(detect_format(dir.path(), "a_"), InputFormat::Native);
        assert_eq!(load_traces(dir.path(), "a_").unwrap().traces, vec![vec![1.0, 2.0]]);
    }
}
