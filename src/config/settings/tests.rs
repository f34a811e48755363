use super::*;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.ollama.protocol, "http");
    assert_eq!(config.ollama.host, "localhost");
    assert_eq!(config.ollama.port, 11434);
    assert_eq!(config.ollama.embedding_model, "nomic-embed-text:latest");
    assert_eq!(config.ollama.chat_model, "llama3.1:latest");
    assert_eq!(config.ollama.embedding_dimension, 768);
    assert_eq!(config.chunking.chunk_size, 500);
    assert_eq!(config.chunking.overlap, 50);
    assert_eq!(config.retrieval.top_k, 5);
    assert_eq!(config.generation.max_context_chars, 4000);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.ollama.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.embedding_model = String::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.chat_model = String::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.batch_size = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.ollama.embedding_dimension = 63;
    assert!(invalid_config.validate().is_err());
}

#[test]
fn chunking_validation() {
    let mut config = Config::default();
    config.chunking.chunk_size = 100;
    config.chunking.overlap = 100;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidOverlap(100, 100))
    ));

    config.chunking.overlap = 150;
    assert!(config.validate().is_err());

    config.chunking.overlap = 99;
    assert!(config.validate().is_ok());

    config.chunking.chunk_size = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidChunkSize(0))
    ));
}

#[test]
fn retrieval_validation() {
    let mut config = Config::default();
    config.retrieval.top_k = 0;
    assert!(config.validate().is_err());

    config.retrieval.top_k = 21;
    assert!(config.validate().is_err());

    config.retrieval.top_k = 20;
    assert!(config.validate().is_ok());

    config.retrieval.similarity_threshold = 1.5;
    assert!(config.validate().is_err());

    config.retrieval.similarity_threshold = -0.1;
    assert!(config.validate().is_err());
}

#[test]
fn generation_validation() {
    let mut config = Config::default();
    config.generation.temperature = 2.5;
    assert!(config.validate().is_err());

    config.generation.temperature = 0.0;
    assert!(config.validate().is_ok());

    config.generation.max_tokens = 0;
    assert!(config.validate().is_err());

    config.generation.max_tokens = 1;
    config.generation.max_context_chars = 0;
    assert!(config.validate().is_err());
}

#[test]
fn base_url_generation() {
    let config = Config::default();
    let url = config
        .ollama
        .base_url()
        .expect("should generate base URL successfully");
    assert_eq!(url.as_str(), "http://localhost:11434/");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn load_missing_file_returns_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config::load(temp_dir.path()).expect("should load defaults");
    assert_eq!(config.ollama, OllamaConfig::default());
    assert_eq!(config.base_dir, temp_dir.path());
}

#[test]
fn save_and_reload_round_trip() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.ollama.host = "embeddings.internal".to_string();
    config.retrieval.top_k = 8;

    config.save().expect("should save config");

    let reloaded = Config::load(temp_dir.path()).expect("should reload config");
    assert_eq!(reloaded.ollama.host, "embeddings.internal");
    assert_eq!(reloaded.retrieval.top_k, 8);
}

#[test]
fn load_rejects_invalid_file() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    std::fs::write(
        temp_dir.path().join("config.toml"),
        "[chunking]\nchunk_size = 100\noverlap = 100\n",
    )
    .expect("should write config file");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
fn derived_paths() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    assert_eq!(config.config_file_path(), temp_dir.path().join("config.toml"));
    assert_eq!(config.vector_database_path(), temp_dir.path().join("vectors"));
}
