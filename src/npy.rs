//! Minimal parser for the `.npy` array container format (version 1.0/2.0),
//! just enough to locate the raw data buffer and its shape/dtype without
//! depending on a full numpy-compatible crate.

use crate::errors::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DType {
    F16,
    F32,
    F64,
    I16,
    I64,
}

impl DType {
    pub fn itemsize(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I16 => 2,
            DType::I64 => 8,
        }
    }

    fn parse(descr: &str) -> Result<Self> {
        match descr {
            "<f2" => Ok(DType::F16),
            "<f4" => Ok(DType::F32),
            "<f8" => Ok(DType::F64),
            "<i2" => Ok(DType::I16),
            "<i8" => Ok(DType::I64),
            other => Err(CoreError::other(format!("unsupported npy dtype {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NpyHeader {
    pub dtype: DType,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the start of the data buffer, measured from the
    /// beginning of the file/slice.
    pub data_offset: usize,
}

const MAGIC: &[u8] = b"\x93NUMPY";

/// Parse the header of a `.npy` buffer. Does not copy the data; callers
/// slice `buf[header.data_offset..]` themselves (this allows memory-mapped
/// use without an intermediate allocation).
pub fn parse_header(buf: &[u8]) -> Result<NpyHeader> {
    if buf.len() < 10 || &buf[0..6] != MAGIC {
        return Err(CoreError::other("not a valid .npy buffer (bad magic)"));
    }
    let major = buf[6];
    let (header_len, header_start) = if major == 1 {
        let len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        (len, 10)
    } else {
        let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        (len, 12)
    };
    let header_str = std::str::from_utf8(&buf[header_start..header_start + header_len])
        .map_err(|e| CoreError::other(format!("npy header is not valid utf8: {e}")))?;

    let descr = extract_field(header_str, "descr")
        .ok_or_else(|| CoreError::other("npy header missing 'descr'"))?;
    let fortran_order = extract_field(header_str, "fortran_order")
        .map(|v| v.trim() == "True")
        .unwrap_or(false);
    let shape_str = extract_field(header_str, "shape")
        .ok_or_else(|| CoreError::other("npy header missing 'shape'"))?;
    let shape = shape_str
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CoreError::other(format!("invalid npy shape: {e}")))?;

    Ok(NpyHeader {
        dtype: DType::parse(descr.trim_matches(|c| c == '\'' || c == '"'))?,
        fortran_order,
        shape,
        data_offset: header_start + header_len,
    })
}

/// Extract `'key': value` from a Python-dict-literal-shaped header string.
/// Handles the small set of shapes numpy actually emits; not a general
/// Python literal parser.
fn extract_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}'");
    let key_pos = header.find(&needle)?;
    let after_key = &header[key_pos + needle.len()..];
    let colon_pos = after_key.find(':')?;
    let after_colon = &after_key[colon_pos + 1..];

    let value_start = after_colon.find(|c: char| !c.is_whitespace())?;
    let rest = &after_colon[value_start..];
    let end = match rest.as_bytes()[0] {
        b'(' => rest.find(')')? + 1,
        b'\'' => rest[1..].find('\'').map(|i| i + 2)?,
        _ => rest.find(',').unwrap_or(rest.len()),
    };
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(shape: &str, descr: &str) -> Vec<u8> {
        let dict = format!(
            "{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}"
        );
        let mut header = dict.into_bytes();
        // pad to a multiple of 64 bytes including the trailing newline, as numpy does
        header.push(b'\n');
        while (10 + header.len()) % 64 != 0 {
            header.insert(header.len() - 1, b' ');
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(1); // major
        buf.push(0); // minor
        buf.extend_from_slice(&(header.len() as u16).to_le_bytes());
        buf.extend_from_slice(&header);
        buf
    }

    #[test]
    fn parses_shape_and_dtype() {
        let buf = sample_header("(2, 19, 181, 360)", "<f2");
        let header = parse_header(&buf).unwrap();
        assert_eq!(header.shape, vec![2, 19, 181, 360]);
        assert_eq!(header.dtype, DType::F16);
        assert_eq!(header.data_offset, buf.len());
    }

    #[test]
    fn parses_1d_shape() {
        let buf = sample_header("(10440,)", "<i2");
        let header = parse_header(&buf).unwrap();
        assert_eq!(header.shape, vec![10440]);
        assert_eq!(header.dtype, DType::I16);
    }
}
