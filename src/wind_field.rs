//! A single model's wind array: 4-D (time, pressure level, lat, lon) vector
//! field loaded from a decompressed `.npz.data.npy` sibling, either fully
//! resident (`preload`) or memory-mapped.

use std::path::Path;
use std::sync::Mutex;

use memmap2::Mmap;

use crate::errors::{CoreError, Result};
use crate::npy::{self, DType};
use crate::npz;

const EARTH_RADIUS_M: f64 = 6.371e6;
const ALT_CACHE_SIZE: usize = 4096;
const COS_LAT_BUCKET: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadMode {
    Preload,
    Memmap,
}

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// A fully loaded wind array for one model. Constructed with either a
/// `preload` (in RAM) or `memmap` backing for the raw data region.
pub struct WindField {
    backing: Option<Backing>,
    data_offset: usize,
    dtype: DType,
    shape: Vec<usize>,

    base_timestamp: f64,
    interval: f64,
    levels_sorted: Vec<f64>,
    level_order: Vec<usize>,

    lat_multiplier: f64,
    lon_multiplier: f64,

    alt_to_pressure_cache: Mutex<lru::LruCache<f64>>,
    cos_lat_cache: Mutex<lru::LruCache<f64>>,
}

mod lru {
    //! Tiny fixed-capacity LRU keyed by i64, enough for the two caches above
    //! without pulling in a general-purpose crate for two call sites.
    use std::collections::VecDeque;

    pub struct LruCache<V> {
        cap: usize,
        entries: VecDeque<(i64, V)>,
    }

    impl<V: Copy> LruCache<V> {
        pub fn new(cap: usize) -> Self {
            Self { cap, entries: VecDeque::with_capacity(cap) }
        }

        pub fn get(&mut self, key: i64) -> Option<V> {
            if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
                let entry = self.entries.remove(pos).unwrap();
                let val = entry.1;
                self.entries.push_back((key, val));
                Some(val)
            } else {
                None
            }
        }

        pub fn put(&mut self, key: i64, val: V) {
            if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
                self.entries.remove(pos);
            } else if self.entries.len() >= self.cap {
                self.entries.pop_front();
            }
            self.entries.push_back((key, val));
        }
    }
}

impl WindField {
    pub fn load(npz_path: &Path, data_npy_path: &Path, mode: LoadMode) -> Result<Self> {
        let meta = npz::read_meta(npz_path)?;
        if meta.levels.is_empty() {
            return Err(CoreError::other("wind field has no pressure levels"));
        }

        let mut order: Vec<usize> = (0..meta.levels.len()).collect();
        order.sort_by(|&a, &b| meta.levels[a].partial_cmp(&meta.levels[b]).unwrap());
        let levels_sorted: Vec<f64> = order.iter().map(|&i| meta.levels[i]).collect();

        let (backing, header) = match mode {
            LoadMode::Preload => {
                let bytes = std::fs::read(data_npy_path)?;
                let header = npy::parse_header(&bytes)?;
                (Backing::Owned(bytes), header)
            }
            LoadMode::Memmap => {
                let file = std::fs::File::open(data_npy_path)?;
                let mmap = unsafe { Mmap::map(&file)? };
                let header = npy::parse_header(&mmap)?;
                (Backing::Mapped(mmap), header)
            }
        };

        if header.shape.len() < 5 {
            return Err(CoreError::other(format!(
                "wind data array has {} dims, expected >= 5",
                header.shape.len()
            )));
        }

        let lat_dim = header.shape[1];
        let lon_dim = header.shape[2];
        let lat_multiplier = (lat_dim as f64 - 1.0) / 180.0;
        let lon_multiplier = (lon_dim as f64 - 1.0) / 360.0;

        Ok(Self {
            backing: Some(backing),
            data_offset: header.data_offset,
            dtype: header.dtype,
            shape: header.shape,
            base_timestamp: meta.timestamp,
            interval: meta.interval,
            levels_sorted,
            level_order: order,
            lat_multiplier,
            lon_multiplier,
            alt_to_pressure_cache: Mutex::new(lru::LruCache::new(ALT_CACHE_SIZE)),
            cos_lat_cache: Mutex::new(lru::LruCache::new(ALT_CACHE_SIZE)),
        })
    }

    /// Release the resident array. Memory-mapped backings are simply
    /// dropped; the OS page cache reclaims them independently.
    pub fn release(&mut self) {
        self.backing = None;
    }

    pub fn is_released(&self) -> bool {
        self.backing.is_none()
    }

    pub fn base_timestamp(&self) -> f64 {
        self.base_timestamp
    }

    pub fn alt_to_pressure(&self, alt_m: f64) -> f64 {
        let key = alt_m.round() as i64;
        if let Some(p) = self.alt_to_pressure_cache.lock().unwrap().get(key) {
            return p;
        }
        let p = if alt_m < 11_000.0 {
            (1.0 - alt_m / 44_330.7).powf(5.2558) * 1013.25
        } else {
            (-alt_m / 6_341.73).exp() * 1282.41
        };
        self.alt_to_pressure_cache.lock().unwrap().put(key, p);
        p
    }

    pub fn pressure_to_alt(&self, hpa: f64) -> f64 {
        if hpa > 226.325 {
            44_330.7 * (1.0 - (hpa / 1013.25).powf(0.190266))
        } else {
            -6_341.73 * (hpa.ln() - 7.1565)
        }
    }

    fn cos_lat(&self, lat: f64) -> f64 {
        let key = (lat / COS_LAT_BUCKET).round() as i64;
        if let Some(c) = self.cos_lat_cache.lock().unwrap().get(key) {
            return c;
        }
        let c = lat.to_radians().cos();
        self.cos_lat_cache.lock().unwrap().put(key, c);
        c
    }

    fn time_steps(&self) -> usize {
        self.shape[3]
    }

    fn max_time(&self) -> f64 {
        self.base_timestamp + self.interval * (self.time_steps() as f64 - 1.0)
    }

    /// Continuous index of `alt_m` into the (sorted) pressure-level axis,
    /// clamped to the array's extent, mapped back through `level_order`.
    fn level_index(&self, alt_m: f64) -> f64 {
        let target_hpa = self.alt_to_pressure(alt_m);
        let levels = &self.levels_sorted;
        let n = levels.len();
        if n == 1 {
            return self.level_order[0] as f64;
        }
        // levels_sorted is ascending; pressure decreases with altitude, so
        // search for the bracketing pair directly.
        let pos = levels.partition_point(|&l| l < target_hpa);
        let (lo, hi, frac) = if pos == 0 {
            (0usize, 0usize, 0.0)
        } else if pos >= n {
            (n - 1, n - 1, 0.0)
        } else {
            let lo = pos - 1;
            let span = levels[pos] - levels[lo];
            let frac = if span.abs() < f64::EPSILON { 0.0 } else { (target_hpa - levels[lo]) / span };
            (lo, pos, frac.clamp(0.0, 1.0))
        };
        let sorted_idx = lo as f64 + frac * (hi as f64 - lo as f64);
        // Map the sorted-axis continuous index back to original-axis index
        // by interpolating the permutation itself (monotone by construction
        // since order was produced by a stable sort of levels_sorted).
        let lo_i = sorted_idx.floor() as usize;
        let hi_i = (lo_i + 1).min(n - 1);
        let t = sorted_idx - lo_i as f64;
        let orig_lo = self.level_order[lo_i] as f64;
        let orig_hi = self.level_order[hi_i] as f64;
        orig_lo + t * (orig_hi - orig_lo)
    }

    fn read_component(&self, time_idx: usize, level_idx: usize, lat_idx: usize, lon_idx: usize, component: usize) -> f64 {
        let shape = &self.shape;
        let lat_dim = shape[1];
        let lon_dim = shape[2];
        let level_dim = shape[0];
        let time_dim = shape[3];
        let comp_dim = shape[4];

        let level_idx = level_idx.min(level_dim - 1);
        let time_idx = time_idx.min(time_dim - 1);
        let lat_idx = lat_idx.min(lat_dim - 1);
        let lon_idx = lon_idx.min(lon_dim - 1);
        let component = component.min(comp_dim - 1);

        let flat = ((((level_idx * lat_dim + lat_idx) * lon_dim + lon_idx) * time_dim + time_idx) * comp_dim) + component;
        let itemsize = self.dtype.itemsize();
        let offset = self.data_offset + flat * itemsize;

        let backing = match &self.backing {
            Some(b) => b.as_slice(),
            None => return 0.0,
        };
        if offset + itemsize > backing.len() {
            return 0.0;
        }
        let bytes = &backing[offset..offset + itemsize];
        match self.dtype {
            DType::F16 => half_to_f64(u16::from_le_bytes([bytes[0], bytes[1]])),
            DType::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            DType::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
            DType::I16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            DType::I64 => i64::from_le_bytes(bytes.try_into().unwrap()) as f64,
        }
    }

    /// Query wind at a point, returning `(u, v)` in m/s.
    pub fn get(&self, lat: f64, lon: f64, alt: f64, time: f64) -> Result<(f64, f64)> {
        if self.backing.is_none() {
            return Err(CoreError::RaceWithCleanup(0));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoreError::OutOfRange(format!("lat {lat} out of range")));
        }
        if !(-180.0..=360.0).contains(&lon) {
            return Err(CoreError::OutOfRange(format!("lon {lon} out of range")));
        }
        let base = self.base_timestamp;
        let max_t = self.max_time();
        if time < base || time > max_t {
            return Err(CoreError::OutOfRange(format!("time {time} outside [{base}, {max_t}]")));
        }

        let lon_norm = if lon < 0.0 { lon + 360.0 } else { lon };
        let lat_i = (90.0 - lat) * self.lat_multiplier;
        let lon_i = (lon_norm % 360.0) * self.lon_multiplier;
        let time_i = (time - base) / self.interval;
        let level_i = self.level_index(alt);

        let u = self.interp4(level_i, lat_i, lon_i, time_i, 0);
        let v = self.interp4(level_i, lat_i, lon_i, time_i, 1);
        Ok((u, v))
    }

    #[allow(clippy::too_many_arguments)]
    fn interp4(&self, level_i: f64, lat_i: f64, lon_i: f64, time_i: f64, component: usize) -> f64 {
        let l0 = level_i.floor() as usize;
        let l1 = l0 + 1;
        let lf = level_i - l0 as f64;

        let a0 = lat_i.floor().max(0.0) as usize;
        let a1 = a0 + 1;
        let af = lat_i - a0 as f64;

        let o0 = lon_i.floor().max(0.0) as usize;
        let o1 = o0 + 1;
        let of = lon_i - o0 as f64;

        let t0 = time_i.floor().max(0.0) as usize;
        let t1 = t0 + 1;
        let tf = time_i - t0 as f64;

        let mut total = 0.0;
        for (li, lw) in [(l0, 1.0 - lf), (l1, lf)] {
            for (ai, aw) in [(a0, 1.0 - af), (a1, af)] {
                for (oi, ow) in [(o0, 1.0 - of), (o1, of)] {
                    for (ti, tw) in [(t0, 1.0 - tf), (t1, tf)] {
                        let weight = lw * aw * ow * tw;
                        if weight == 0.0 {
                            continue;
                        }
                        total += weight * self.read_component(ti, li, ai, oi, component);
                    }
                }
            }
        }
        total
    }

    /// Convert wind (u, v in m/s) into angular rates (deg/s) at `lat`.
    pub fn to_angular_rates(&self, lat: f64, u: f64, v: f64) -> (f64, f64) {
        let cos_lat = self.cos_lat(lat);
        let dlat = (v / EARTH_RADIUS_M).to_degrees();
        let dlon = (u / (EARTH_RADIUS_M * cos_lat)).to_degrees();
        (dlat, dlon)
    }
}

fn half_to_f64(bits: u16) -> f64 {
    let sign = (bits >> 15) & 1;
    let exp = (bits >> 10) & 0x1f;
    let frac = bits & 0x3ff;

    let value = if exp == 0 {
        (frac as f64) * 2f64.powi(-24)
    } else if exp == 0x1f {
        if frac == 0 { f64::INFINITY } else { f64::NAN }
    } else {
        (1.0 + frac as f64 / 1024.0) * 2f64.powi(exp as i32 - 15)
    };
    if sign == 1 { -value } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn altitude_pressure_round_trip() {
        let field = dummy_field();
        for alt in [0.0, 500.0, 5000.0, 11000.0, 20000.0, 40000.0] {
            let hpa = field.alt_to_pressure(alt);
            let back = field.pressure_to_alt(hpa);
            assert!((back - alt).abs() < 1.0, "alt {alt} round-tripped to {back}");
        }
    }

    #[test]
    fn half_float_decodes_known_values() {
        assert_eq!(half_to_f64(0x0000), 0.0);
        assert!((half_to_f64(0x3C00) - 1.0).abs() < 1e-9);
        assert!((half_to_f64(0xBC00) + 1.0).abs() < 1e-9);
    }

    fn dummy_field() -> WindField {
        WindField {
            backing: None,
            data_offset: 0,
            dtype: DType::F16,
            shape: vec![1, 2, 2, 1, 2],
            base_timestamp: 0.0,
            interval: 10800.0,
            levels_sorted: vec![1000.0],
            level_order: vec![0],
            lat_multiplier: 1.0,
            lon_multiplier: 1.0,
            alt_to_pressure_cache: Mutex::new(lru::LruCache::new(8)),
            cos_lat_cache: Mutex::new(lru::LruCache::new(8)),
        }
    }
}
