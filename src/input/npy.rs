//! Minimal NumPy `.npy` array reader/writer
//!
//! Covers what trace files need: little-endian numeric dtypes, C order,
//! scalars, 1-D and 2-D shapes. Format versions 1.0, 2.0 and 3.0 are read;
//! files are written as version 1.0.

use anyhow::{Context, Result};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";

/// Header plus padding is aligned to this many bytes
const HEADER_ALIGN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum NpyError {
    #[error("not a .npy file (bad magic)")]
    BadMagic,

    #[error("unsupported .npy version {0}.{1}")]
    Version(u8, u8),

    #[error("malformed header: {0}")]
    Header(String),

    #[error("unsupported dtype '{0}'")]
    Dtype(String),

    #[error("fortran-ordered arrays are not supported")]
    FortranOrder,

    #[error("arrays with {0} dimensions are not supported")]
    Dimensions(usize),

    #[error("data holds {actual} bytes, shape needs {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("value {0} does not fit in a byte")]
    NotByte(f64),
}

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F8,
    F4,
    I1,
    I2,
    I4,
    I8,
    U1,
    U2,
    U4,
    U8,
}

impl Dtype {
    /// Parse a numpy `descr` string such as `<f8` or `|u1`
    pub fn parse(descr: &str) -> Result<Self, NpyError> {
        let bad = || NpyError::Dtype(descr.to_string());

        let (order, rest) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
            _ => ('=', descr),
        };

        let dtype = match rest {
            "f8" => Dtype::F8,
            "f4" => Dtype::F4,
            "i1" => Dtype::I1,
            "i2" => Dtype::I2,
            "i4" => Dtype::I4,
            "i8" => Dtype::I8,
            "u1" => Dtype::U1,
            "u2" => Dtype::U2,
            "u4" => Dtype::U4,
            "u8" => Dtype::U8,
            _ => return Err(bad()),
        };

        // Big-endian is only harmless for single-byte types
        if order == '>' && dtype.size() > 1 {
            return Err(bad());
        }
        Ok(dtype)
    }

    pub fn size(&self) -> usize {
        match self {
            Dtype::I1 | Dtype::U1 => 1,
            Dtype::I2 | Dtype::U2 => 2,
            Dtype::F4 | Dtype::I4 | Dtype::U4 => 4,
            Dtype::F8 | Dtype::I8 | Dtype::U8 => 8,
        }
    }

    pub fn descr(&self) -> &'static str {
        match self {
            Dtype::F8 => "<f8",
            Dtype::F4 => "<f4",
            Dtype::I1 => "|i1",
            Dtype::I2 => "<i2",
            Dtype::I4 => "<i4",
            Dtype::I8 => "<i8",
            Dtype::U1 => "|u1",
            Dtype::U2 => "<u2",
            Dtype::U4 => "<u4",
            Dtype::U8 => "<u8",
        }
    }

    fn decode(&self, b: &[u8]) -> f64 {
        match self {
            Dtype::F8 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            Dtype::F4 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Dtype::I1 => b[0] as i8 as f64,
            Dtype::I2 => i16::from_le_bytes([b[0], b[1]]) as f64,
            Dtype::I4 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Dtype::I8 => i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64,
            Dtype::U1 => b[0] as f64,
            Dtype::U2 => u16::from_le_bytes([b[0], b[1]]) as f64,
            Dtype::U4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Dtype::U8 => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64,
        }
    }
}

/// A decoded array, values widened to f64
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl NpyArray {
    /// Rows when viewed as a matrix (1-D and scalars are a single row)
    pub fn rows(&self) -> usize {
        match self.shape.len() {
            0 | 1 => 1,
            _ => self.shape[0],
        }
    }

    /// Columns when viewed as a matrix
    pub fn cols(&self) -> usize {
        match self.shape.len() {
            0 => 1,
            1 => self.shape[0],
            _ => self.shape[1],
        }
    }

    /// Values split into rows
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        let cols = self.cols();
        if cols == 0 {
            return vec![Vec::new(); self.rows()];
        }
        self.values.chunks(cols).map(|c| c.to_vec()).collect()
    }

    /// Rows narrowed to bytes; fails on values outside 0..=255 or fractional
    pub fn to_byte_rows(&self) -> Result<Vec<Vec<u8>>, NpyError> {
        self.to_rows()
            .into_iter()
            .map(|row| row.into_iter().map(to_byte).collect())
            .collect()
    }
}

fn to_byte(v: f64) -> Result<u8, NpyError> {
    if v.fract() == 0.0 && (0.0..=255.0).contains(&v) {
        Ok(v as u8)
    } else {
        Err(NpyError::NotByte(v))
    }
}

/// Read an array from a `.npy` file
pub fn read<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    parse(&bytes).with_context(|| format!("Failed to decode {:?}", path))
}

/// Decode `.npy` bytes
pub fn parse(bytes: &[u8]) -> Result<NpyArray, NpyError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let (major, minor) = (bytes[6], bytes[7]);
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(NpyError::BadMagic);
            }
            (u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize, 12)
        }
        _ => return Err(NpyError::Version(major, minor)),
    };

    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| NpyError::Header("header runs past end of file".to_string()))?;
    let header = std::str::from_utf8(header).map_err(|e| NpyError::Header(e.to_string()))?;

    let dtype = Dtype::parse(&header_str_value(header, "descr")?)?;
    if header_bool_value(header, "fortran_order")? {
        return Err(NpyError::FortranOrder);
    }
    let shape = header_shape(header)?;
    if shape.len() > 2 {
        return Err(NpyError::Dimensions(shape.len()));
    }

    let expected = shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| NpyError::Header(format!("shape {:?} is too large", shape)))?;
    let data = &bytes[data_start..];
    if data.len() < expected {
        return Err(NpyError::Truncated {
            expected,
            actual: data.len(),
        });
    }

    let values = data[..expected]
        .chunks_exact(dtype.size())
        .map(|b| dtype.decode(b))
        .collect();

    Ok(NpyArray { dtype, shape, values })
}

/// Find `'key': ` in the header dict and return the text after it
fn header_field<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle = format!("'{}':", key);
    let pos = header
        .find(&needle)
        .ok_or_else(|| NpyError::Header(format!("missing '{}'", key)))?;
    Ok(header[pos + needle.len()..].trim_start())
}

fn header_str_value(header: &str, key: &str) -> Result<String, NpyError> {
    let rest = header_field(header, key)?;
    let rest = rest
        .strip_prefix('\'')
        .ok_or_else(|| NpyError::Header(format!("'{}' is not a string", key)))?;
    let end = rest
        .find('\'')
        .ok_or_else(|| NpyError::Header(format!("unterminated '{}'", key)))?;
    Ok(rest[..end].to_string())
}

fn header_bool_value(header: &str, key: &str) -> Result<bool, NpyError> {
    let rest = header_field(header, key)?;
    if rest.starts_with("True") {
        Ok(true)
    } else if rest.starts_with("False") {
        Ok(false)
    } else {
        Err(NpyError::Header(format!("'{}' is not a boolean", key)))
    }
}

fn header_shape(header: &str) -> Result<Vec<usize>, NpyError> {
    let rest = header_field(header, "shape")?;
    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| NpyError::Header("'shape' is not a tuple".to_string()))?;
    let end = rest
        .find(')')
        .ok_or_else(|| NpyError::Header("unterminated 'shape'".to_string()))?;

    rest[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            // Python 2 era writers emit long literals like `100L`
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::Header(format!("bad shape dimension '{}'", s)))
        })
        .collect()
}

/// Encode an array as `.npy` bytes (format 1.0)
pub fn encode(dtype: Dtype, shape: &[usize], data: &[u8]) -> Vec<u8> {
    let shape_text = match shape {
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype.descr(),
        shape_text
    );

    // Pad with spaces so the data starts aligned; header ends in a newline
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + data.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Write rows of samples as a 2-D `<f8` array
pub fn write_f64_rows<P: AsRef<Path>>(path: P, rows: &[Vec<f64>]) -> Result<()> {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    let data: Vec<u8> = rows
        .iter()
        .flat_map(|r| r.iter().flat_map(|v| v.to_le_bytes()))
        .collect();
    write_bytes(path.as_ref(), &encode(Dtype::F8, &[rows.len(), cols], &data))
}

/// Write rows of bytes as a 2-D `|u1` array
pub fn write_u8_rows<P: AsRef<Path>>(path: P, rows: &[Vec<u8>]) -> Result<()> {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    let data: Vec<u8> = rows.iter().flatten().copied().collect();
    write_bytes(path.as_ref(), &encode(Dtype::U1, &[rows.len(), cols], &data))
}

/// Write a 1-D `|u1` array
pub fn write_u8<P: AsRef<Path>>(path: P, values: &[u8]) -> Result<()> {
    write_bytes(path.as_ref(), &encode(Dtype::U1, &[values.len()], values))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))
}
