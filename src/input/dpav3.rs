use crate::core::TraceBatch;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load a trace set exported in the DPA Contest v3 text layout
///
/// Expected files in `dir`:
/// - `<prefix>traces.txt`: one trace per line, whitespace separated samples
/// - `<prefix>textin.txt`, `<prefix>textout.txt`: one line of hex bytes per trace
/// - `<prefix>knownkey.txt`: one line of hex bytes
///
/// Only the traces file is required. Hex bytes may be space separated
/// (`2b 7e 15`, `0 1 f`) or run together (`2b7e15`).
pub fn load_dpav3(dir: &Path, prefix: &str) -> Result<TraceBatch> {
    let traces_path = text_file(dir, prefix, "traces");
    let traces = read_rows(&traces_path)?
        .into_iter()
        .enumerate()
        .map(|(line, tokens)| {
            tokens
                .iter()
                .map(|t| t.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Bad sample on line {} of {:?}", line + 1, traces_path))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut batch = TraceBatch::new(traces);
    batch.textin = load_hex_rows(&text_file(dir, prefix, "textin"))?;
    batch.textout = load_hex_rows(&text_file(dir, prefix, "textout"))?;
    batch.known_key = load_hex_rows(&text_file(dir, prefix, "knownkey"))?
        .into_iter()
        .next();

    batch
        .validate()
        .with_context(|| format!("Inconsistent DPAv3 set {:?}", traces_path))?;

    info!(
        "Read DPAv3 set {}: {} traces, {} points",
        prefix,
        batch.traces.len(),
        batch.traces.first().map(|t| t.len()).unwrap_or(0)
    );
    Ok(batch)
}

/// Path of one DPAv3 text file
pub fn text_file(dir: &Path, prefix: &str, name: &str) -> PathBuf {
    dir.join(format!("{}{}.txt", prefix, name))
}

/// Whether `dir` holds a DPAv3 export for `prefix`
pub fn exists(dir: &Path, prefix: &str) -> bool {
    text_file(dir, prefix, "traces").is_file()
}

/// Read non-empty lines as whitespace separated tokens
fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.with_context(|| format!("Failed to read {:?}", path))?;

        // Runs of spaces give empty fields; tabs stay inside a field
        let tokens: Vec<String> = record
            .iter()
            .flat_map(str::split_whitespace)
            .map(str::to_string)
            .collect();

        if !tokens.is_empty() {
            rows.push(tokens);
        }
    }

    debug!("{:?}: {} rows", path, rows.len());
    Ok(rows)
}

fn load_hex_rows(path: &Path) -> Result<Vec<Vec<u8>>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    read_rows(path)?
        .into_iter()
        .enumerate()
        .map(|(line, tokens)| {
            parse_hex_row(&tokens)
                .with_context(|| format!("Bad hex on line {} of {:?}", line + 1, path))
        })
        .collect()
}

/// Bytes of one hex row: either a single run (`2b7e15`) or separate tokens
/// (`2b 7e 15`), where a lone digit is a byte of its own (`0 1 f`)
fn parse_hex_row(tokens: &[String]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in tokens {
        let digits = strip_hex_prefix(token);
        if digits.len() == 1 {
            bytes.extend(parse_hex(&format!("0{}", digits))?);
        } else {
            bytes.extend(parse_hex(digits)?);
        }
    }
    Ok(bytes)
}

fn strip_hex_prefix(token: &str) -> &str {
    token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token)
}

fn nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

/// Parse a run of hex digit pairs, with an optional `0x` in front
pub fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    let digits = strip_hex_prefix(hex).as_bytes();
    if digits.len() % 2 != 0 {
        anyhow::bail!("Odd number of hex digits in {:?}", hex);
    }

    digits
        .chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(anyhow::anyhow!("Not a hex byte in {:?}", hex)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("2b7eABcd").unwrap(), vec![0x2b, 0x7e, 0xab, 0xcd]);
        assert_eq!(parse_hex("0x2b7e").unwrap(), vec![0x2b, 0x7e]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("a\u{e9}1").is_err());
    }

    #[test]
    fn test_hex_row_tokens() {
        let row = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        assert_eq!(parse_hex_row(&row("0 1 2")).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_hex_row(&row("0x2b 7e f")).unwrap(), vec![0x2b, 0x7e, 0x0f]);
        assert_eq!(parse_hex_row(&row("2b7e15")).unwrap(), vec![0x2b, 0x7e, 0x15]);
        assert!(parse_hex_row(&row("2b 7e1")).is_err());
    }

    #[test]
    fn test_non_ascii_hex_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v_traces.txt", "1 2\n");
        write(dir.path(), "v_textin.txt", "a\u{e9}1\n");

        let err = load_dpav3(dir.path(), "v_").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_load_full_set() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v3_traces.txt", "1 2 3\n4  5\t6\n\n");
        write(dir.path(), "v3_textin.txt", "00 11 22\n33 44 55\n");
        write(dir.path(), "v3_textout.txt", "aabbcc\nddeeff\n");
        write(dir.path(), "v3_knownkey.txt", "2b 7e 15 16\n");

        assert!(exists(dir.path(), "v3_"));
        let batch = load_dpav3(dir.path(), "v3_").unwrap();
        assert_eq!(batch.traces, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(batch.textin[1], vec![0x33, 0x44, 0x55]);
        assert_eq!(batch.textout[0], vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(batch.known_key, Some(vec![0x2b, 0x7e, 0x15, 0x16]));
    }

    #[test]
    fn test_text_row_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v3_traces.txt", "1 2\n3 4\n");
        write(dir.path(), "v3_textin.txt", "00\n");

        assert!(load_dpav3(dir.path(), "v3_").is_err());
    }

    #[test]
    fn test_bad_sample() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v3_traces.txt", "1 x\n");

        let err = load_dpav3(dir.path(), "v3_").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
