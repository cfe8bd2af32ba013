use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{BackendHit, DistanceMetric, VectorBackend};
use crate::error::ConfigError;
use crate::models::ChildChunk;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: Option<usize>,
    chunks: Vec<ChildChunk>,
}

pub struct FlatIndex {
    path: PathBuf,
    chunks: RwLock<Vec<ChildChunk>>,
}

impl FlatIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Snapshots are only read when the caller vouches for where they came from.
    pub async fn load(path: &Path, trust_source: bool) -> Result<Self> {
        if !trust_source {
            return Err(ConfigError::UntrustedSource(path.display().to_string()).into());
        }

        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed reading index snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("corrupt index snapshot {}", path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "index snapshot {} has version {}, expected {}",
                path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            chunks: RwLock::new(snapshot.chunks),
        })
    }
}

#[async_trait]
impl VectorBackend for FlatIndex {
    fn name(&self) -> &str {
        "flat"
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::L2
    }

    async fn add(&self, chunks: &[ChildChunk]) -> Result<()> {
        let mut stored = self.chunks.write().await;
        let expected = stored.first().map(|c| c.embedding.len());
        for chunk in chunks {
            let dimension = expected.unwrap_or(chunk.embedding.len());
            if chunk.embedding.is_empty() || chunk.embedding.len() != dimension {
                anyhow::bail!(
                    "chunk {} has embedding dimension {}, expected {}",
                    chunk.id,
                    chunk.embedding.len(),
                    dimension
                );
            }
        }
        stored.extend_from_slice(chunks);
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<BackendHit>> {
        let stored = self.chunks.read().await;
        if let Some(first) = stored.first() {
            if first.embedding.len() != query.len() {
                anyhow::bail!(
                    "query dimension {} does not match index dimension {}",
                    query.len(),
                    first.embedding.len()
                );
            }
        }

        let mut scored: Vec<(usize, f32)> = stored
            .iter()
            .enumerate()
            .map(|(i, chunk)| (i, l2_distance(query, &chunk.embedding)))
            .collect();
        // Stable: equal distances keep insertion order.
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, distance)| BackendHit {
                chunk: stored[i].clone(),
                distance,
            })
            .collect())
    }

    async fn persist(&self) -> Result<()> {
        let stored = self.chunks.read().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            dimension: stored.first().map(|c| c.embedding.len()),
            chunks: stored.clone(),
        };
        let body = serde_json::to_vec(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.chunks.read().await.len())
    }

    async fn reset(&self) -> Result<()> {
        self.chunks.write().await.clear();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed removing {}", self.path.display())),
        }
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
