use std::path::PathBuf;

/// Process-wide configuration assembled once at startup from the environment.
///
/// Mirrors the rest of this codebase's convention of small, explicit
/// env-driven config structs rather than a configuration framework.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub object_store_url: String,
    pub object_store_secret: String,
    pub cache_dir: PathBuf,
    pub download_control_run: bool,
    pub num_perturbed_members: u32,
    pub bind_addr: String,
}

impl CoreConfig {
    /// Load configuration from the environment, loading a local `.env` file
    /// first if present (non-fatal if absent).
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let object_store_url = std::env::var("OBJECT_STORE_URL")
            .map_err(|_| anyhow::anyhow!("OBJECT_STORE_URL environment variable is not set"))?
            .trim_end_matches('/')
            .to_string();
        let object_store_secret = std::env::var("OBJECT_STORE_SECRET")
            .map_err(|_| anyhow::anyhow!("OBJECT_STORE_SECRET environment variable is not set"))?;

        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_cache_dir());

        let download_control_run = std::env::var("DOWNLOAD_CONTROL_RUN")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let num_perturbed_members = std::env::var("NUM_PERTURBED_MEMBERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:1337".to_string());

        Ok(Self {
            object_store_url,
            object_store_secret,
            cache_dir,
            download_control_run,
            num_perturbed_members,
            bind_addr,
        })
    }

    /// All configured model ids: control run (0) if enabled, followed by
    /// perturbed members 1..=N.
    pub fn model_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        if self.download_control_run {
            ids.push(0);
        }
        ids.extend(1..=self.num_perturbed_members);
        ids
    }
}

fn default_cache_dir() -> PathBuf {
    if PathBuf::from("/opt/render/project/src").exists() {
        PathBuf::from("/opt/render/project/src/data/gefs")
    } else if PathBuf::from("/app/data").exists() {
        PathBuf::from("/app/data/gefs")
    } else {
        std::env::temp_dir().join("stratocast-cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_with_control() {
        let cfg = CoreConfig {
            object_store_url: String::new(),
            object_store_secret: String::new(),
            cache_dir: PathBuf::new(),
            download_control_run: true,
            num_perturbed_members: 2,
            bind_addr: String::new(),
        };
        assert_eq!(cfg.model_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn model_ids_without_control() {
        let cfg = CoreConfig {
            object_store_url: String::new(),
            object_store_secret: String::new(),
            cache_dir: PathBuf::new(),
            download_control_run: false,
            num_perturbed_members: 3,
            bind_addr: String::new(),
        };
        assert_eq!(cfg.model_ids(), vec![1, 2, 3]);
    }
}
