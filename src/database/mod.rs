// Database module
// LanceDB-backed persistence for indexed chunks and their embeddings

pub mod lancedb;
