use bufferhub::MemfdAllocator;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket")]
    pub socket: String,

    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub allocator: AllocatorConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_bytes_per_pixel")]
    pub bytes_per_pixel: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            bytes_per_pixel: default_bytes_per_pixel(),
        }
    }
}

impl AllocatorConfig {
    pub fn build(&self) -> MemfdAllocator {
        MemfdAllocator::new(self.bytes_per_pixel)
    }
}

fn default_socket() -> String {
    "/tmp/bufferhubd.sock".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_bytes_per_pixel() -> u32 {
    4
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: default_socket(),
            log_filter: default_log_filter(),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if config.allocator.bytes_per_pixel == 0 {
            eyre::bail!("allocator.bytes_per_pixel must be positive");
        }
        Ok(config)
    }
}
