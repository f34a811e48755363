use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::RagError;
use crate::config::{Config, get_config_dir};
use crate::database::lancedb::VectorStore;
use crate::embeddings::OllamaClient;
use futures::StreamExt;

use crate::pipeline::{Pipeline, SourceDocument};
use crate::retrieval::RetrievalQuery;

async fn build_pipeline() -> Result<Pipeline> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).context("Failed to load configuration")?;

    let client = Arc::new(OllamaClient::new(&config).context("Failed to create Ollama client")?);
    let store = Arc::new(
        VectorStore::open(&config)
            .await
            .context("Failed to open vector store")?,
    );

    Ok(Pipeline::new(
        config,
        Arc::clone(&client) as Arc<dyn crate::embeddings::EmbeddingProvider>,
        client as Arc<dyn crate::generation::GenerationProvider>,
        store,
    ))
}

fn load_query(config: &Config, text: &str, top_k: Option<usize>, threshold: Option<f32>) -> RetrievalQuery {
    RetrievalQuery::new(
        text,
        top_k.unwrap_or(config.retrieval.top_k),
        threshold.unwrap_or(config.retrieval.similarity_threshold),
    )
}

/// Print the effective configuration, creating a default file if none exists.
#[inline]
pub fn show_config() -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).context("Failed to load configuration")?;

    if !config.config_file_path().exists() {
        config.save().context("Failed to write default config")?;
        println!(
            "Created default configuration at {}",
            config.config_file_path().display()
        );
        println!();
    }

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("Configuration ({})", config.config_file_path().display());
    println!();
    println!("{}", rendered);
    Ok(())
}

/// Index all plain-text documents under a path.
#[inline]
pub async fn index_path(path: PathBuf, parallelism: usize) -> Result<()> {
    let documents = load_documents(&path)?;
    if documents.is_empty() {
        println!("No .txt or .md documents found under {}", path.display());
        return Ok(());
    }

    println!(
        "Indexing {} documents from {}",
        documents.len(),
        path.display()
    );

    let pipeline = build_pipeline().await?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner} {msg}").context("Invalid progress template")?,
    );
    progress.set_message("Chunking, embedding, and upserting...");
    progress.enable_steady_tick(Duration::from_millis(120));

    let stats = pipeline.index_batch(documents, parallelism).await;
    progress.finish_and_clear();

    for error in &stats.errors {
        println!("  {} {}", style("!").yellow(), error);
    }

    println!();
    println!("Indexing complete:");
    println!("  Documents indexed: {}", stats.documents_processed);
    if stats.documents_failed > 0 {
        println!(
            "  Documents failed:  {}",
            style(stats.documents_failed).red()
        );
    }
    println!("  Chunks indexed:    {}", stats.chunks_indexed);
    if stats.chunks_failed > 0 {
        println!("  Chunks failed:     {}", style(stats.chunks_failed).red());
    }

    Ok(())
}

fn load_documents(path: &Path) -> Result<Vec<SourceDocument>> {
    let mut files = Vec::new();
    collect_text_files(path, &mut files)?;
    files.sort();

    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let source_ref = file
            .strip_prefix(path)
            .map(|p| p.display().to_string())
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| file.display().to_string());
        documents.push(SourceDocument { source_ref, text });
    }

    info!("Loaded {} documents from {}", documents.len(), path.display());
    Ok(documents)
}

fn collect_text_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("Failed to read directory {}", path.display()))?
        {
            collect_text_files(&entry?.path(), files)?;
        }
        return Ok(());
    }

    let is_text = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"));
    if is_text {
        files.push(path.to_path_buf());
    }
    Ok(())
}

/// Retrieval-only search, printing ranked snippets.
#[inline]
pub async fn search(query_text: String, top_k: Option<usize>, threshold: Option<f32>) -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir)?;
    let query = load_query(&config, &query_text, top_k, threshold);

    let pipeline = build_pipeline().await?;
    let results = pipeline.search(&query).await?;

    if results.is_empty() {
        println!("No chunks matched the query above the similarity threshold.");
        return Ok(());
    }

    println!("Found {} matching chunks:", results.len());
    println!();
    for (rank, result) in results.iter().enumerate() {
        println!(
            "{} {} (similarity {:.3})",
            style(format!("{}.", rank + 1)).bold(),
            style(&result.chunk.source_ref).cyan(),
            result.similarity
        );
        println!("   {}", snippet(&result.chunk.content, 200));
        println!();
    }

    Ok(())
}

fn snippet(content: &str, max_chars: usize) -> String {
    let trimmed: String = content.chars().take(max_chars).collect();
    if trimmed.chars().count() < content.chars().count() {
        format!("{}...", trimmed)
    } else {
        trimmed
    }
}

/// Ask a question and print a grounded answer, optionally streamed.
#[inline]
pub async fn ask(
    query_text: String,
    top_k: Option<usize>,
    threshold: Option<f32>,
    stream: bool,
) -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir)?;
    let query = load_query(&config, &query_text, top_k, threshold);

    let pipeline = build_pipeline().await?;

    if stream {
        return ask_streaming(&pipeline, &query).await;
    }

    match pipeline.answer(&query, None).await {
        Ok(answer) => {
            println!("{}", answer.text);
            print_sources(&answer.sources, answer.truncated);
            Ok(())
        }
        Err(RagError::EmptyContext) => {
            println!(
                "{}",
                style("No grounded answer found. Try rephrasing the question or indexing more documents.")
                    .yellow()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn ask_streaming(pipeline: &Pipeline, query: &RetrievalQuery) -> Result<()> {
    let mut streamed = match pipeline.answer_stream(query, None).await {
        Ok(streamed) => streamed,
        Err(RagError::EmptyContext) => {
            println!(
                "{}",
                style("No grounded answer found. Try rephrasing the question or indexing more documents.")
                    .yellow()
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut stdout = std::io::stdout();
    while let Some(fragment) = streamed.fragments.next().await {
        match fragment {
            Ok(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            Err(e) => {
                println!();
                println!(
                    "{}",
                    style(format!("Stream interrupted: {}", e)).red()
                );
                // Already-printed text stands; the answer is provisional.
                return Ok(());
            }
        }
    }
    println!();

    print_sources(&streamed.sources, streamed.truncated);
    Ok(())
}

fn print_sources(sources: &[crate::generation::SourceAttribution], truncated: bool) {
    if sources.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for source in sources {
        println!(
            "  - {} (similarity {:.3})",
            source.source_ref, source.similarity
        );
    }
    if truncated {
        println!(
            "  {}",
            style("(some retrieved chunks were dropped to fit the context budget)").dim()
        );
    }
}

/// Remove a source's chunks from the index.
#[inline]
pub async fn delete_source(source_ref: String) -> Result<()> {
    let pipeline = build_pipeline().await?;
    pipeline.delete_source(&source_ref).await?;
    println!("Deleted all chunks for source: {}", source_ref);
    Ok(())
}

/// Print corpus statistics.
#[inline]
pub async fn show_stats() -> Result<()> {
    let pipeline = build_pipeline().await?;
    let stats = pipeline.stats().await?;

    println!("Corpus statistics:");
    println!("  Indexed chunks: {}", stats.count);
    match (&stats.earliest_created_at, &stats.latest_created_at) {
        (Some(earliest), Some(latest)) => {
            println!("  Earliest indexed: {}", earliest);
            println!("  Latest indexed:   {}", latest);
        }
        _ => println!("  The index is empty."),
    }
    Ok(())
}

/// Report connectivity of the model provider and the vector store.
#[inline]
pub async fn show_status() -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).unwrap_or_default();

    println!("docs-qa status");
    println!("{}", "=".repeat(40));

    println!("Ollama:");
    match OllamaClient::new(&config) {
        Ok(client) => match client.health_check().await {
            Ok(()) => {
                println!(
                    "  {} Connected ({}:{})",
                    style("ok").green(),
                    config.ollama.host,
                    config.ollama.port
                );
                println!("  Embedding model: {}", config.ollama.embedding_model);
                println!("  Chat model:      {}", config.ollama.chat_model);
                println!(
                    "  Embedding dimension: {}",
                    config.ollama.embedding_dimension
                );
            }
            Err(e) => println!("  {} Unhealthy: {}", style("!!").yellow(), e),
        },
        Err(e) => println!("  {} Failed to create client: {}", style("xx").red(), e),
    }

    println!("Vector store:");
    match VectorStore::open(&config).await {
        Ok(store) => {
            println!(
                "  {} Open at {} (dimension {})",
                style("ok").green(),
                config.vector_database_path().display(),
                store.dimension()
            );
            match store.stats().await {
                Ok(stats) => println!("  Indexed chunks: {}", stats.count),
                Err(e) => println!("  {} Failed to read stats: {}", style("!!").yellow(), e),
            }
        }
        Err(e) => println!("  {} Failed to open: {}", style("xx").red(), e),
    }

    Ok(())
}
