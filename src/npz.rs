//! Reads the handful of members out of a compressed weather archive
//! (`<cycle>_<model>.npz`): the `data` wind array, plus the small
//! `timestamp` / `interval` / `levels` scalars and vector the Wind Field
//! needs to interpret it. An `.npz` is just a zip of individual `.npy`
//! members, so this is a thin layer over the `zip` crate plus `npy::parse_header`.

use std::io::Read;
use std::path::Path;

use crate::errors::{CoreError, Result};
use crate::npy;

pub struct WeatherMeta {
    pub timestamp: f64,
    pub interval: f64,
    pub levels: Vec<f64>,
}

fn read_member(archive: &mut zip::ZipArchive<std::fs::File>, name: &str) -> Result<Vec<u8>> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| CoreError::CorruptedArchive(format!("missing member {name}: {e}")))?;
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf)
        .map_err(|e| CoreError::CorruptedArchive(format!("failed to read member {name}: {e}")))?;
    Ok(buf)
}

fn npy_to_f64_vec(buf: &[u8]) -> Result<Vec<f64>> {
    let header = npy::parse_header(buf)?;
    let data = &buf[header.data_offset..];
    let count: usize = header.shape.iter().product::<usize>().max(1);
    let mut out = Vec::with_capacity(count);
    match header.dtype {
        npy::DType::F64 => {
            for chunk in data.chunks_exact(8).take(count) {
                out.push(f64::from_le_bytes(chunk.try_into().unwrap()));
            }
        }
        npy::DType::F32 => {
            for chunk in data.chunks_exact(4).take(count) {
                out.push(f32::from_le_bytes(chunk.try_into().unwrap()) as f64);
            }
        }
        npy::DType::I64 => {
            for chunk in data.chunks_exact(8).take(count) {
                out.push(i64::from_le_bytes(chunk.try_into().unwrap()) as f64);
            }
        }
        other => return Err(CoreError::other(format!("unexpected scalar dtype {other:?}"))),
    }
    Ok(out)
}

/// Validate the archive opens and has the expected members, without fully
/// decompressing the (large) data array. Used right after download.
pub fn validate(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::CorruptedArchive(format!("not a valid zip/npz: {e}")))?;
    for required in ["data.npy", "timestamp.npy", "interval.npy", "levels.npy"] {
        archive
            .by_name(required)
            .map_err(|_| CoreError::CorruptedArchive(format!("archive missing member {required}")))?;
    }
    Ok(())
}

pub fn read_meta(path: &Path) -> Result<WeatherMeta> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::CorruptedArchive(format!("not a valid zip/npz: {e}")))?;

    let timestamp = npy_to_f64_vec(&read_member(&mut archive, "timestamp.npy")?)?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::CorruptedArchive("timestamp member is empty".into()))?;
    let interval = npy_to_f64_vec(&read_member(&mut archive, "interval.npy")?)?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::CorruptedArchive("interval member is empty".into()))?;
    let levels = npy_to_f64_vec(&read_member(&mut archive, "levels.npy")?)?;

    Ok(WeatherMeta {
        timestamp,
        interval,
        levels,
    })
}

/// Decompress the `data` member to a raw `.npy`-formatted buffer, suitable
/// for writing to a memory-mappable sibling file.
pub fn extract_data_npy(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::CorruptedArchive(format!("not a valid zip/npz: {e}")))?;
    read_member(&mut archive, "data.npy")
}
