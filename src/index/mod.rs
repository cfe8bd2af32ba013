pub mod flat;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ParentStoreKind, SearchConfig, SearchType, VectorBackendKind};
use crate::db::Database;
use crate::docstore::{InMemoryParentStore, ParentStore};
use crate::error::{ConfigError, RetrievalError};
use crate::llm::Embedder;
use crate::models::{ChildChunk, ConditionRecord, IndexManifest, Metadata, ParentDocument, SOURCE_KEY};
use crate::qdrant_store::QdrantStore;

use self::flat::FlatIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceMetric {
    L2,
    Cosine,
}

impl DistanceMetric {
    /// Maps a backend distance onto a 0..1 relevance scale, higher is better.
    /// L2 assumes unit-normalised embeddings.
    pub fn relevance(self, distance: f32) -> f32 {
        match self {
            DistanceMetric::L2 => 1.0 - distance / std::f32::consts::SQRT_2,
            DistanceMetric::Cosine => 1.0 - distance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendHit {
    pub chunk: ChildChunk,
    pub distance: f32,
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn metric(&self) -> DistanceMetric;

    async fn add(&self, chunks: &[ChildChunk]) -> Result<()>;

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<BackendHit>>;

    async fn persist(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn reset(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchMode {
    Similarity,
    SimilarityScoreThreshold { score_threshold: f32 },
    Mmr { fetch_k: usize, lambda_mult: f32 },
}

impl SearchMode {
    pub fn from_config(search: &SearchConfig) -> Self {
        match search.search_type {
            SearchType::Similarity => SearchMode::Similarity,
            SearchType::SimilarityScoreThreshold => SearchMode::SimilarityScoreThreshold {
                score_threshold: search.score_threshold,
            },
            SearchType::Mmr => SearchMode::Mmr {
                fetch_k: search.fetch_k.max(search.k),
                lambda_mult: search.lambda_mult,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum IndexHits {
    /// Child hits in backend order with their score. Plain similarity carries
    /// the raw distance; the threshold mode carries relevance.
    Scored(Vec<(ChildChunk, f32)>),
    Diverse(Vec<ChildChunk>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub parent_count: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return vec![];
        }

        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.len() <= self.chunk_size {
            return vec![normalized];
        }

        let step = self.chunk_size.saturating_sub(self.chunk_overlap).max(1);
        let mut windows = Vec::new();
        let mut start = 0;
        while start < tokens.len() {
            let end = (start + self.chunk_size).min(tokens.len());
            windows.push(tokens[start..end].join(" "));
            if end == tokens.len() {
                break;
            }
            start += step;
        }
        windows
    }

    pub fn split_parent(&self, parent: &ParentDocument) -> Vec<ChildChunk> {
        self.split(&parent.text)
            .into_iter()
            .map(|text| ChildChunk {
                id: Uuid::new_v4().to_string(),
                text,
                parent_id: parent.id.clone(),
                embedding: Vec::new(),
            })
            .collect()
    }
}

pub struct ChunkParentIndex {
    embedder: Arc<dyn Embedder>,
    splitter: TextSplitter,
    backend: Arc<dyn VectorBackend>,
    parents: Arc<dyn ParentStore>,
    batch_size: usize,
}

impl ChunkParentIndex {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        splitter: TextSplitter,
        backend: Arc<dyn VectorBackend>,
        parents: Arc<dyn ParentStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            splitter,
            backend,
            parents,
            batch_size: batch_size.max(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn VectorBackend> {
        &self.backend
    }

    pub fn parents(&self) -> &Arc<dyn ParentStore> {
        &self.parents
    }

    pub async fn build(&self, texts: Vec<String>, metadatas: Vec<Metadata>) -> Result<BuildStats> {
        if texts.len() != metadatas.len() {
            return Err(ConfigError::MetadataMismatch {
                documents: texts.len(),
                metadatas: metadatas.len(),
            }
            .into());
        }

        let documents = texts
            .into_iter()
            .zip(metadatas)
            .map(|(text, metadata)| ParentDocument {
                id: Uuid::new_v4().to_string(),
                text,
                metadata,
            })
            .collect();
        self.add_documents(documents).await
    }

    /// Inserts children batch by batch in document order. Each batch writes
    /// the parents it introduces with a single store call.
    pub async fn add_documents(&self, documents: Vec<ParentDocument>) -> Result<BuildStats> {
        let mut children = Vec::new();
        for document in &documents {
            children.extend(self.splitter.split_parent(document));
        }

        let by_id: HashMap<&str, &ParentDocument> =
            documents.iter().map(|doc| (doc.id.as_str(), doc)).collect();
        let mut written: HashSet<&str> = HashSet::new();
        for batch in children.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .context("failed embedding child chunks")?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }

            let embedded: Vec<ChildChunk> = batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(mut chunk, vector)| {
                    chunk.embedding = vector;
                    chunk
                })
                .collect();
            self.backend
                .add(&embedded)
                .await
                .with_context(|| format!("failed adding chunks to {}", self.backend.name()))?;

            let mut introduced: Vec<ParentDocument> = Vec::new();
            for chunk in batch {
                if let Some(doc) = by_id.get(chunk.parent_id.as_str()) {
                    if written.insert(doc.id.as_str()) {
                        introduced.push((*doc).clone());
                    }
                }
            }
            if !introduced.is_empty() {
                self.parents.mset(&introduced).await?;
            }
        }

        // Parents too short to yield any child are still retrievable by id.
        let orphans: Vec<ParentDocument> = documents
            .iter()
            .filter(|doc| !written.contains(doc.id.as_str()))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            self.parents.mset(&orphans).await?;
        }

        Ok(BuildStats {
            parent_count: documents.len(),
            chunk_count: children.len(),
        })
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        mode: &SearchMode,
    ) -> Result<IndexHits, RetrievalError> {
        let vector = self
            .embedder
            .embed_query(query)
            .await
            .map_err(|err| RetrievalError::Embedding(format!("{err:#}")))?;

        let fetch = match mode {
            SearchMode::Mmr { fetch_k, .. } => (*fetch_k).max(k),
            _ => k,
        };
        let hits = self
            .backend
            .search(&vector, fetch)
            .await
            .map_err(|err| RetrievalError::Search {
                backend: self.backend.name().to_string(),
                message: format!("{err:#}"),
            })?;

        Ok(match mode {
            SearchMode::Similarity => IndexHits::Scored(
                hits.into_iter()
                    .map(|hit| (hit.chunk, hit.distance))
                    .collect(),
            ),
            SearchMode::SimilarityScoreThreshold { score_threshold } => {
                let metric = self.backend.metric();
                IndexHits::Scored(
                    hits.into_iter()
                        .map(|hit| {
                            let relevance = metric.relevance(hit.distance);
                            (hit.chunk, relevance)
                        })
                        .filter(|(_, relevance)| *relevance >= *score_threshold)
                        .collect(),
                )
            }
            SearchMode::Mmr { lambda_mult, .. } => {
                let embeddings: Vec<&[f32]> =
                    hits.iter().map(|hit| hit.chunk.embedding.as_slice()).collect();
                let picked = maximal_marginal_relevance(&vector, &embeddings, *lambda_mult, k);
                IndexHits::Diverse(picked.into_iter().map(|i| hits[i].chunk.clone()).collect())
            }
        })
    }

    pub async fn persist(&self) -> Result<()> {
        self.backend.persist().await
    }

    pub async fn is_populated(&self) -> Result<bool> {
        Ok(self.backend.len().await? > 0 && self.parents.len().await? > 0)
    }

    pub async fn reset(&self) -> Result<()> {
        self.backend.reset().await?;
        self.parents.clear().await
    }
}

pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[&[f32]],
    lambda_mult: f32,
    k: usize,
) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return vec![];
    }

    let to_query: Vec<f32> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c))
        .collect();

    let first = to_query
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut selected = vec![first];

    while selected.len() < k.min(candidates.len()) {
        let mut best: Option<(usize, f32)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if selected.contains(&i) {
                continue;
            }
            let redundancy = selected
                .iter()
                .map(|&s| cosine_similarity(candidate, candidates[s]))
                .fold(f32::NEG_INFINITY, f32::max);
            let score = lambda_mult * to_query[i] - (1.0 - lambda_mult) * redundancy;
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        match best {
            Some((i, _)) => selected.push(i),
            None => break,
        }
    }

    selected
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn normalize_text(text: &str) -> String {
    text.replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn load_conditions(path: &Path) -> Result<Vec<ConditionRecord>> {
    let file =
        File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parsed: ConditionRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path.display(), idx + 1))?;
        records.push(parsed);
    }

    Ok(records)
}

pub fn conditions_to_columns(records: Vec<ConditionRecord>) -> (Vec<String>, Vec<Metadata>) {
    records
        .into_iter()
        .map(|record| {
            let mut metadata = Metadata::new();
            metadata.insert(SOURCE_KEY.to_string(), record.condition_title);
            (record.condition_content, metadata)
        })
        .unzip()
}

pub async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading file for hash: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Copy)]
pub struct IndexStatus {
    pub loaded: bool,
    pub stats: BuildStats,
}

/// Loads the persisted index when allowed and present, otherwise wipes any
/// stale data and rebuilds from the conditions file.
pub async fn open_index(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
    db: &Database,
) -> Result<(ChunkParentIndex, IndexStatus)> {
    let parents: Arc<dyn ParentStore> = match config.index.parent_store {
        ParentStoreKind::Memory => Arc::new(InMemoryParentStore::new()),
        ParentStoreKind::Sqlite => Arc::new(db.clone()),
    };

    let backend: Arc<dyn VectorBackend> = match config.index.backend {
        VectorBackendKind::Flat => {
            let path = config.snapshot_path();
            if !config.index.force_create && FlatIndex::exists(&path) {
                Arc::new(FlatIndex::load(&path, config.index.trust_source).await?)
            } else {
                Arc::new(FlatIndex::new(path))
            }
        }
        VectorBackendKind::Qdrant => Arc::new(QdrantStore::new(
            config.index.qdrant_url.clone(),
            config.index.qdrant_collection.clone(),
        )),
    };

    let index = ChunkParentIndex::new(
        embedder,
        TextSplitter::new(config.index.chunk_size, config.index.chunk_overlap),
        backend,
        parents,
        config.index.batch_size,
    );

    if !config.index.force_create && index.is_populated().await? {
        let stats = BuildStats {
            parent_count: index.parents.len().await?,
            chunk_count: index.backend.len().await?,
        };
        info!(
            backend = index.backend.name(),
            parents = stats.parent_count,
            chunks = stats.chunk_count,
            "loaded persisted index"
        );
        return Ok((index, IndexStatus { loaded: true, stats }));
    }

    if config.index.force_create {
        info!("force_create set; rebuilding index");
    } else {
        warn!(
            location = %config.index.persist_dir.display(),
            "no persisted index found; rebuilding from source"
        );
    }

    index.reset().await?;

    let conditions_file = &config.index.conditions_file;
    let records = load_conditions(conditions_file)?;
    let (texts, metadatas) = conditions_to_columns(records);
    let stats = index.build(texts, metadatas).await?;
    index.persist().await?;

    db.record_manifest(&IndexManifest {
        source_hash: file_sha256(conditions_file).await?,
        backend: config.index.backend.as_str().to_string(),
        parent_count: stats.parent_count as i64,
        chunk_count: stats.chunk_count as i64,
        created_at: Utc::now(),
    })
    .await?;

    info!(
        backend = index.backend.name(),
        parents = stats.parent_count,
        chunks = stats.chunk_count,
        "index built"
    );
    Ok((index, IndexStatus { loaded: false, stats }))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    const VOCAB: [&str; 8] = [
        "fever", "chills", "sore", "throat", "cough", "rash", "headache", "nausea",
    ];

    pub(crate) struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| keyword_vector(t)).collect())
        }
    }

    pub(crate) fn keyword_vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = VOCAB
            .iter()
            .map(|w| lower.matches(w).count() as f32)
            .collect();
        v.push(0.01);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    struct RecordingStore {
        inner: InMemoryParentStore,
        writes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ParentStore for RecordingStore {
        async fn mget(&self, ids: &[String]) -> Result<Vec<Option<ParentDocument>>> {
            self.inner.mget(ids).await
        }

        async fn mset(&self, documents: &[ParentDocument]) -> Result<()> {
            self.writes.lock().unwrap().push(documents.len());
            self.inner.mset(documents).await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    fn meta(source: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert(SOURCE_KEY.to_string(), source.to_string());
        m
    }

    #[test]
    fn splitter_windows_overlap() {
        let text = (1..=120)
            .map(|n| format!("word{n}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = TextSplitter::new(50, 10).split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("word1 "));
        assert!(chunks[1].starts_with("word41 "));
        assert!(chunks[2].ends_with("word120"));
    }

    #[test]
    fn short_text_stays_single_chunk() {
        let chunks = TextSplitter::new(10, 2).split("  a\u{00A0}short   note ");
        assert_eq!(chunks, vec!["a short note".to_string()]);
        assert!(TextSplitter::new(10, 2).split("   ").is_empty());
    }

    #[tokio::test]
    async fn build_rejects_mismatched_metadata() {
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(8, 2),
            Arc::new(FlatIndex::new("unused.json")),
            Arc::new(InMemoryParentStore::new()),
            4,
        );
        let err = index
            .build(vec!["a".into(), "b".into()], vec![meta("a")])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MetadataMismatch { documents: 2, metadatas: 1 })
        ));
    }

    #[tokio::test]
    async fn batched_insert_writes_parents_once_per_batch() {
        let store = Arc::new(RecordingStore {
            inner: InMemoryParentStore::new(),
            writes: Mutex::new(Vec::new()),
        });
        let backend = Arc::new(FlatIndex::new("unused.json"));
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(4, 0),
            backend.clone(),
            store.clone(),
            2,
        );

        // 8 words -> 2 chunks, 4 words -> 1 chunk, 4 words -> 1 chunk.
        let stats = index
            .build(
                vec![
                    "fever chills fever chills sore throat sore throat".into(),
                    "cough cough cough cough".into(),
                    "rash rash rash rash".into(),
                ],
                vec![meta("flu"), meta("bronchitis"), meta("eczema")],
            )
            .await
            .unwrap();

        assert_eq!(stats, BuildStats { parent_count: 3, chunk_count: 4 });
        assert_eq!(*store.writes.lock().unwrap(), vec![1, 2]);
        assert_eq!(backend.len().await.unwrap(), 4);
        assert_eq!(store.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn threshold_mode_filters_by_relevance() {
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(16, 2),
            Arc::new(FlatIndex::new("unused.json")),
            Arc::new(InMemoryParentStore::new()),
            8,
        );
        index
            .build(
                vec!["fever and chills".into(), "itchy rash".into()],
                vec![meta("flu"), meta("eczema")],
            )
            .await
            .unwrap();

        let mode = SearchMode::SimilarityScoreThreshold { score_threshold: 0.4 };
        let IndexHits::Scored(hits) = index.search("fever", 2, &mode).await.unwrap() else {
            panic!("threshold search must be scored");
        };
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.text.contains("fever"));
        assert!(hits[0].1 >= 0.4);
    }

    #[tokio::test]
    async fn mmr_prefers_diverse_children() {
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(16, 2),
            Arc::new(FlatIndex::new("unused.json")),
            Arc::new(InMemoryParentStore::new()),
            8,
        );
        index
            .build(
                vec![
                    "fever fever chills".into(),
                    "fever fever chills again".into(),
                    "fever and nausea".into(),
                ],
                vec![meta("flu"), meta("flu-2"), meta("gastro")],
            )
            .await
            .unwrap();

        let mode = SearchMode::Mmr { fetch_k: 3, lambda_mult: 0.3 };
        let IndexHits::Diverse(children) = index.search("fever chills", 2, &mode).await.unwrap()
        else {
            panic!("mmr search must be diverse");
        };
        assert_eq!(children.len(), 2);
        assert!(children[1].text.contains("nausea"));
    }

    #[test]
    fn relevance_scales() {
        assert!((DistanceMetric::Cosine.relevance(0.25) - 0.75).abs() < 1e-6);
        assert!((DistanceMetric::L2.relevance(0.0) - 1.0).abs() < 1e-6);
        assert!(DistanceMetric::L2.relevance(std::f32::consts::SQRT_2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rebuilds_when_nothing_is_persisted_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let conditions = dir.path().join("conditions.jsonl");
        std::fs::write(
            &conditions,
            concat!(
                r#"{"condition_title":"flu","condition_content":"fever and chills"}"#,
                "\n",
                r#"{"condition_title":"tonsillitis","condition_content":"sore throat"}"#,
                "\n"
            ),
        )
        .unwrap();

        let overrides = crate::config::ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            conditions_file: Some(conditions.clone()),
            trust_source: Some(true),
            ..Default::default()
        };
        let config = AppConfig::from_overrides(overrides).unwrap();
        let db = Database::new(&config).await.unwrap();

        let (fresh, status) = open_index(&config, Arc::new(KeywordEmbedder), &db)
            .await
            .unwrap();
        assert!(!status.loaded);
        assert_eq!(status.stats.parent_count, 2);
        let manifest = db.latest_manifest().await.unwrap().unwrap();
        assert_eq!(manifest.source_hash, file_sha256(&conditions).await.unwrap());

        let (loaded, status) = open_index(&config, Arc::new(KeywordEmbedder), &db)
            .await
            .unwrap();
        assert!(status.loaded);

        let mode = SearchMode::Similarity;
        let ids = |hits: IndexHits| match hits {
            IndexHits::Scored(hits) => hits
                .into_iter()
                .map(|(c, _)| c.parent_id)
                .collect::<Vec<_>>(),
            IndexHits::Diverse(_) => unreachable!(),
        };
        let a = ids(fresh.search("I have a fever", 2, &mode).await.unwrap());
        let b = ids(loaded.search("I have a fever", 2, &mode).await.unwrap());
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn untrusted_snapshot_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conditions = dir.path().join("conditions.jsonl");
        std::fs::write(
            &conditions,
            r#"{"condition_title":"flu","condition_content":"fever and chills"}"#,
        )
        .unwrap();
        let mut overrides = crate::config::ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            conditions_file: Some(conditions),
            ..Default::default()
        };
        let config = AppConfig::from_overrides(overrides.clone()).unwrap();
        let db = Database::new(&config).await.unwrap();
        open_index(&config, Arc::new(KeywordEmbedder), &db)
            .await
            .unwrap();

        let err = open_index(&config, Arc::new(KeywordEmbedder), &db)
            .await
            .err()
            .expect("loading an untrusted snapshot must fail");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UntrustedSource(_))
        ));

        overrides.force_create = Some(true);
        let forced = AppConfig::from_overrides(overrides).unwrap();
        let (_, status) = open_index(&forced, Arc::new(KeywordEmbedder), &db)
            .await
            .unwrap();
        assert!(!status.loaded);
    }
}
