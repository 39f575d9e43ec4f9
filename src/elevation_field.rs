//! Global elevation grid: a single memory-mapped file of signed 16-bit
//! elevations, loaded lazily on first query and shared for the lifetime of
//! the process.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use memmap2::Mmap;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::Result;
use crate::weather_store::WeatherArrayStore;

const ELEVATION_FILE_NAME: &str = "worldelev.npy";
/// `(2, height, width)` i16 grid described by the object store layout.
const GRID_WIDTH: usize = 43200;
const GRID_HEIGHT: usize = 21600;

struct Grid {
    mmap: Mmap,
    data_offset: usize,
    width: usize,
    height: usize,
}

/// Bilinear elevation lookups over the pinned global grid. Initialization is
/// double-checked: the first caller to need elevation data pays the mmap
/// setup cost, everyone else observes the already-initialized grid.
pub struct ElevationField {
    store: Arc<WeatherArrayStore>,
    init_lock: AsyncMutex<()>,
    grid: OnceLock<Grid>,
}

impl ElevationField {
    pub fn new(store: Arc<WeatherArrayStore>) -> Self {
        Self {
            store,
            init_lock: AsyncMutex::new(()),
            grid: OnceLock::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.grid.get().is_some()
    }

    /// Drop the grid so the next call reloads it. Used by the Lifecycle
    /// Manager during deep cleanup.
    pub fn release(&mut self) {
        self.grid = OnceLock::new();
    }

    async fn ensure_loaded(&self) -> Result<&Grid> {
        if let Some(g) = self.grid.get() {
            return Ok(g);
        }
        let _guard = self.init_lock.lock().await;
        if let Some(g) = self.grid.get() {
            return Ok(g);
        }

        let path: PathBuf = self.store.ensure_cached(ELEVATION_FILE_NAME).await?;
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = crate::npy::parse_header(&mmap)?;

        let (height, width) = match header.shape.as_slice() {
            [h, w] => (*h, *w),
            [_, h, w] => (*h, *w),
            _ => (GRID_HEIGHT, GRID_WIDTH),
        };

        let grid = Grid { mmap, data_offset: header.data_offset, width, height };
        let _ = self.grid.set(grid);
        Ok(self.grid.get().unwrap())
    }

    /// Elevation in meters at `(lat, lon)`, clamped to `[0, inf)` and rounded
    /// to 2 decimal places, per the pixel-center bilinear lookup used by the
    /// live service.
    pub async fn get(&self, lat: f64, lon: f64) -> Result<f64> {
        let grid = self.ensure_loaded().await?;

        let lat = lat.clamp(-90.0, 90.0);
        let mut lon_norm = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
        if lon_norm == -180.0 {
            lon_norm = -180.0;
        }

        let w = grid.width as f64;
        let h = grid.height as f64;
        let col_f = (lon_norm + 180.0) / 360.0 * w - 0.5;
        let row_f = (90.0 - lat) / 180.0 * h - 0.5;

        let col0 = col_f.floor().clamp(0.0, w - 1.0) as usize;
        let row0 = row_f.floor().clamp(0.0, h - 1.0) as usize;
        let col1 = (col0 + 1).min(grid.width - 1);
        let row1 = (row0 + 1).min(grid.height - 1);

        let cf = (col_f - col0 as f64).clamp(0.0, 1.0);
        let rf = (row_f - row0 as f64).clamp(0.0, 1.0);

        let v00 = sample(grid, row0, col0) as f64;
        let v01 = sample(grid, row0, col1) as f64;
        let v10 = sample(grid, row1, col0) as f64;
        let v11 = sample(grid, row1, col1) as f64;

        let top = v00 * (1.0 - cf) + v01 * cf;
        let bottom = v10 * (1.0 - cf) + v11 * cf;
        let value = top * (1.0 - rf) + bottom * rf;

        Ok((value.max(0.0) * 100.0).round() / 100.0)
    }
}

fn sample(grid: &Grid, row: usize, col: usize) -> i16 {
    let flat = row * grid.width + col;
    let offset = grid.data_offset + flat * 2;
    if offset + 2 > grid.mmap.len() {
        return 0;
    }
    i16::from_le_bytes([grid.mmap[offset], grid.mmap[offset + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longitude_wraps_into_range() {
        let lon = 200.0_f64;
        let wrapped = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
        assert!((-180.0..180.0).contains(&wrapped));
        assert!((wrapped - (-160.0)).abs() < 1e-9);
    }

    #[test]
    fn latitude_clamps() {
        assert_eq!(91.0_f64.clamp(-90.0, 90.0), 90.0);
        assert_eq!((-91.0_f64).clamp(-90.0, 90.0), -90.0);
    }
}
