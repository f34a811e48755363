// Configuration management module
// Handles TOML configuration loading, validation, and path resolution

pub mod settings;

pub use settings::{
    ChunkingConfig, Config, ConfigError, GenerationConfig, OllamaConfig, RetrievalConfig,
    TimeoutConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
