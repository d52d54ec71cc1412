use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

/// Tunable download constants. A missing `config.toml` (or a partial one)
/// falls back to the code defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Size in bytes of a single accounting chunk. Must be a power of two.
    pub chunk_size: u64,
    /// Capacity of the producer/consumer queue, in chunks. Bounds worst-case
    /// memory at `queue_capacity * chunk_size`.
    pub queue_capacity: usize,
    /// Lower bound on the byte range a single connection is worth opening for.
    pub min_bytes_per_connection: u64,
    /// connect timeout in seconds (can be fractional)
    pub connect_timeout_secs: f64,
    /// socket read timeout in seconds (can be fractional)
    pub read_timeout_secs: f64,
    /// how long the writer waits on an empty queue before giving up
    pub chunk_wait_timeout_secs: f64,
    /// upper bound on the whole run
    pub run_timeout_secs: f64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 64,
            queue_capacity: 1000,
            min_bytes_per_connection: 1024 * 1024,
            connect_timeout_secs: 25.0,
            read_timeout_secs: 20.0,
            chunk_wait_timeout_secs: 120.0,
            run_timeout_secs: 60.0 * 60.0 * 24.0,
        }
    }
}

impl DownloadConfig {
    /// Path to the config file inside the provided directory.
    pub fn config_path_for_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
        let mut p = dir.as_ref().to_path_buf();
        p.push("config.toml");
        p
    }

    /// Load configuration from the given directory's `config.toml`.
    /// If file does not exist, returns Ok(Default::default()).
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<DownloadConfig, io::Error> {
        let path = DownloadConfig::config_path_for_dir(dir);
        if !path.exists() {
            return Ok(DownloadConfig::default());
        }
        let s = fs::read_to_string(&path)?;
        let cfg: DownloadConfig =
            toml::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(cfg)
    }

    /// Save configuration to `dir/config.toml`. Creates parent dir if needed.
    pub fn save_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), io::Error> {
        let cfg_path = DownloadConfig::config_path_for_dir(dir);
        if let Some(p) = cfg_path.parent() {
            fs::create_dir_all(p)?;
        }
        let s =
            toml::to_string_pretty(&self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(cfg_path, s)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_secs)
    }

    pub fn chunk_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_wait_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_timeout_secs)
    }
}
