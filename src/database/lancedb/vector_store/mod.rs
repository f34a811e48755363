
use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::{
    Connection, DistanceType,
    query::{ExecutableQuery, QueryBase},
};
use tracing::{debug, info};

use super::{IndexStats, IndexedChunk};
use crate::chunking::Chunk;
use crate::config::Config;
use crate::retrieval::RetrievalResult;
use crate::{RagError, Result};

const TABLE_NAME: &str = "chunks";

/// Access layer over the LanceDB store holding indexed chunks.
///
/// Persistence and scanning belong to LanceDB; this type owns the schema, the
/// dimensionality contract, and the ordering semantics of search results.
pub struct VectorStore {
    connection: Connection,
    table_name: String,
    dimension: usize,
}

impl VectorStore {
    /// Open (or create) the store and validate its dimensionality against
    /// configuration.
    ///
    /// A table created with a different vector width fails here with
    /// `DimensionMismatch`: the configured dimension is authoritative and the
    /// store is never silently rebuilt around it.
    #[inline]
    pub async fn open(config: &Config) -> Result<Self> {
        let db_path = config.vector_database_path();
        debug!("Opening LanceDB at path: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RagError::Store(format!("Failed to create vector database directory: {}", e))
            })?;
        }

        let uri = format!("file://{}", db_path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to connect to LanceDB: {}", e)))?;

        let dimension = config.ollama.embedding_dimension as usize;
        let store = Self {
            connection,
            table_name: TABLE_NAME.to_string(),
            dimension,
        };

        store.initialize_table().await?;

        info!(
            "Vector store ready at {:?} with dimension {}",
            db_path, dimension
        );
        Ok(store)
    }

    /// Configured vector dimensionality for this store.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    async fn initialize_table(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to list tables: {}", e)))?;

        if table_names.contains(&self.table_name) {
            let stored = self.stored_vector_dimension().await?;
            if stored != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: stored,
                });
            }
            debug!("Chunks table exists with matching dimension {}", stored);
            return Ok(());
        }

        let schema = self.create_schema();
        self.connection
            .create_empty_table(&self.table_name, schema)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to create table: {}", e)))?;

        info!(
            "Created chunks table with {} vector dimensions",
            self.dimension
        );
        Ok(())
    }

    async fn stored_vector_dimension(&self) -> Result<usize> {
        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to open existing table: {}", e)))?;

        let schema = table
            .schema()
            .await
            .map_err(|e| RagError::Store(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(RagError::Store(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    fn create_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dimension as i32,
                ),
                false,
            ),
            Field::new("content", DataType::Utf8, false),
            Field::new("source_ref", DataType::Utf8, false),
            Field::new("position", DataType::UInt32, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    /// Insert or replace chunks by id.
    ///
    /// Uses LanceDB's merge-insert keyed on `id`, so replacing a chunk is
    /// atomic per id and readers never observe a half-written row.
    #[inline]
    pub async fn upsert(&self, records: Vec<IndexedChunk>) -> Result<()> {
        if records.is_empty() {
            debug!("No chunks to upsert");
            return Ok(());
        }

        for record in &records {
            if record.embedding.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: record.embedding.len(),
                });
            }
        }

        debug!("Upserting batch of {} chunks", records.len());

        let record_batch = self.create_record_batch(&records)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to open table: {}", e)))?;

        let mut merge = table.merge_insert(&["id"]);
        merge.when_matched_update_all(None);
        merge.when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| RagError::Store(format!("Failed to upsert chunks: {}", e)))?;

        info!("Upserted {} chunks", records.len());
        Ok(())
    }

    fn create_record_batch(&self, records: &[IndexedChunk]) -> Result<RecordBatch> {
        let len = records.len();

        let mut ids = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut source_refs = Vec::with_capacity(len);
        let mut positions = Vec::with_capacity(len);
        let mut metadatas = Vec::with_capacity(len);
        let mut created_ats = Vec::with_capacity(len);

        for record in records {
            ids.push(record.chunk.id.as_str());
            contents.push(record.chunk.content.as_str());
            source_refs.push(record.chunk.source_ref.as_str());
            positions.push(record.chunk.position as u32);
            metadatas.push(
                serde_json::to_string(&record.chunk.metadata)
                    .map_err(|e| RagError::Store(format!("Failed to serialize metadata: {}", e)))?,
            );
            created_ats.push(record.created_at.as_str());
        }

        let mut flat_values = Vec::with_capacity(len * self.dimension);
        for record in records {
            flat_values.extend_from_slice(&record.embedding);
        }
        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| RagError::Store(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(contents)),
            Arc::new(StringArray::from(source_refs)),
            Arc::new(UInt32Array::from(positions)),
            Arc::new(StringArray::from(metadatas)),
            Arc::new(StringArray::from(created_ats)),
        ];

        RecordBatch::try_new(self.create_schema(), arrays)
            .map_err(|e| RagError::Store(format!("Failed to create record batch: {}", e)))
    }

    /// Search for the most similar chunks by cosine similarity.
    ///
    /// Returns at most `top_k` results, all with similarity at or above
    /// `similarity_threshold`, in descending similarity order. Ties resolve by
    /// insertion order (`created_at`, then source and position) so identical
    /// inputs always rank identically.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if query_vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query_vector.len(),
            });
        }

        debug!(
            "Searching for similar chunks (top_k={}, threshold={})",
            top_k, similarity_threshold
        );

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to open table: {}", e)))?;

        let query = table
            .vector_search(query_vector)
            .map_err(|e| RagError::Store(format!("Failed to create vector search: {}", e)))?
            .distance_type(DistanceType::Cosine)
            .column("vector")
            .limit(top_k);

        let mut stream = query
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to execute search: {}", e)))?;

        let mut rows = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::Store(format!("Failed to read result stream: {}", e)))?
        {
            rows.extend(self.parse_search_batch(&batch)?);
        }

        rows.retain(|row| row.result.similarity >= similarity_threshold);
        rows.sort_by(|a, b| {
            b.result
                .similarity
                .partial_cmp(&a.result.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.result.chunk.source_ref.cmp(&b.result.chunk.source_ref))
                .then_with(|| a.result.chunk.position.cmp(&b.result.chunk.position))
        });
        rows.truncate(top_k);

        debug!("Search returned {} results", rows.len());
        Ok(rows.into_iter().map(|row| row.result).collect())
    }

    fn parse_search_batch(&self, batch: &RecordBatch) -> Result<Vec<SearchRow>> {
        let num_rows = batch.num_rows();

        let ids = string_column(batch, "id")?;
        let contents = string_column(batch, "content")?;
        let source_refs = string_column(batch, "source_ref")?;
        let metadatas = string_column(batch, "metadata")?;
        let created_ats = string_column(batch, "created_at")?;

        let positions = batch
            .column_by_name("position")
            .ok_or_else(|| RagError::Store("Missing position column".to_string()))?
            .as_any()
            .downcast_ref::<UInt32Array>()
            .ok_or_else(|| RagError::Store("Invalid position column type".to_string()))?;

        let distances = batch
            .column_by_name("_distance")
            .map(|col| col.as_any().downcast_ref::<Float32Array>());

        let mut rows = Vec::with_capacity(num_rows);
        for row in 0..num_rows {
            let metadata = serde_json::from_str(metadatas.value(row)).unwrap_or_default();

            let chunk = Chunk {
                id: ids.value(row).to_string(),
                content: contents.value(row).to_string(),
                source_ref: source_refs.value(row).to_string(),
                position: positions.value(row) as usize,
                metadata,
            };

            let distance = distances
                .flatten()
                .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

            // Cosine similarity from cosine distance
            let similarity = 1.0 - distance;

            rows.push(SearchRow {
                created_at: created_ats.value(row).to_string(),
                result: RetrievalResult { chunk, similarity },
            });
        }

        Ok(rows)
    }

    /// Remove every chunk that originated from the given source.
    #[inline]
    pub async fn delete_source(&self, source_ref: &str) -> Result<()> {
        debug!("Deleting chunks for source: {}", source_ref);

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to open table: {}", e)))?;

        let predicate = format!("source_ref = '{}'", source_ref.replace('\'', "''"));
        table
            .delete(&predicate)
            .await
            .map_err(|e| RagError::Store(format!("Failed to delete source chunks: {}", e)))?;

        info!("Deleted chunks for source: {}", source_ref);
        Ok(())
    }

    /// Corpus statistics: chunk count and the created-at range.
    #[inline]
    pub async fn stats(&self) -> Result<IndexStats> {
        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to open table: {}", e)))?;

        let count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::Store(format!("Failed to count rows: {}", e)))?
            as u64;

        if count == 0 {
            return Ok(IndexStats {
                count,
                earliest_created_at: None,
                latest_created_at: None,
            });
        }

        let mut stream = table
            .query()
            .execute()
            .await
            .map_err(|e| RagError::Store(format!("Failed to scan table: {}", e)))?;

        let mut earliest: Option<String> = None;
        let mut latest: Option<String> = None;

        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::Store(format!("Failed to read scan stream: {}", e)))?
        {
            let created_ats = string_column(&batch, "created_at")?;
            for row in 0..batch.num_rows() {
                let value = created_ats.value(row);
                if earliest.as_deref().is_none_or(|e| value < e) {
                    earliest = Some(value.to_string());
                }
                if latest.as_deref().is_none_or(|l| value > l) {
                    latest = Some(value.to_string());
                }
            }
        }

        Ok(IndexStats {
            count,
            earliest_created_at: earliest,
            latest_created_at: latest,
        })
    }
}

struct SearchRow {
    created_at: String,
    result: RetrievalResult,
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::Store(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RagError::Store(format!("Invalid {} column type", name)))
}
