use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::index::{BackendHit, DistanceMetric, VectorBackend};
use crate::models::ChildChunk;

const UPSERT_BATCH: usize = 64;

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            known_vector_size: Arc::new(RwLock::new(None)),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        {
            let known = self.known_vector_size.read().await;
            if *known == Some(vector_size) {
                return Ok(());
            }
        }

        let existing = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .context("failed to contact qdrant while checking collection")?;
        if existing.status() == StatusCode::NOT_FOUND {
            let payload = json!({
                "vectors": {
                    "size": vector_size,
                    "distance": "Cosine"
                }
            });
            self.client
                .put(self.collection_url())
                .json(&payload)
                .send()
                .await
                .context("failed to contact qdrant while creating collection")?
                .error_for_status()
                .context("qdrant failed to create collection")?;
        } else {
            existing
                .error_for_status()
                .context("qdrant collection lookup returned non-success status")?;
        }

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }

    async fn upsert_points(&self, points: &[QdrantPoint<'_>]) -> Result<()> {
        let url = format!("{}/points?wait=true", self.collection_url());
        self.client
            .put(url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("failed to contact qdrant during upsert")?
            .error_for_status()
            .context("qdrant upsert returned non-success status")?;
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for QdrantStore {
    fn name(&self) -> &str {
        "qdrant"
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    async fn add(&self, chunks: &[ChildChunk]) -> Result<()> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };
        self.ensure_collection(first.embedding.len()).await?;

        for batch in chunks.chunks(UPSERT_BATCH) {
            let points: Vec<QdrantPoint<'_>> = batch
                .iter()
                .map(|chunk| QdrantPoint {
                    id: &chunk.id,
                    vector: &chunk.embedding,
                    payload: QdrantPayload {
                        chunk_id: chunk.id.clone(),
                        parent_id: chunk.parent_id.clone(),
                        text: chunk.text.clone(),
                    },
                })
                .collect();
            self.upsert_points(&points).await?;
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<BackendHit>> {
        if query.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let url = format!("{}/points/search", self.collection_url());
        let body = json!({
            "vector": query,
            "limit": k,
            "with_payload": true,
            "with_vector": true,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload?;
                Some(BackendHit {
                    chunk: ChildChunk {
                        id: payload.chunk_id,
                        text: payload.text,
                        parent_id: payload.parent_id,
                        embedding: point.vector.unwrap_or_default(),
                    },
                    distance: 1.0 - point.score,
                })
            })
            .collect())
    }

    async fn persist(&self) -> Result<()> {
        // Qdrant writes with wait=true, nothing is buffered locally.
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let url = format!("{}/points/count", self.collection_url());
        let response = self
            .client
            .post(url)
            .json(&json!({ "exact": true }))
            .send()
            .await
            .context("failed to contact qdrant during count")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }

        let parsed = response
            .error_for_status()
            .context("qdrant count returned non-success status")?
            .json::<QdrantCountResponse>()
            .await
            .context("failed to decode qdrant count response")?;
        Ok(parsed.result.count)
    }

    async fn reset(&self) -> Result<()> {
        let response = self
            .client
            .delete(self.collection_url())
            .send()
            .await
            .context("failed to contact qdrant while deleting collection")?;
        if response.status() != StatusCode::NOT_FOUND {
            response
                .error_for_status()
                .context("qdrant failed to delete collection")?;
        }
        *self.known_vector_size.write().await = None;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct QdrantPoint<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: QdrantPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QdrantPayload {
    chunk_id: String,
    parent_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<QdrantPayload>,
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct QdrantCountResponse {
    result: QdrantCount,
}

#[derive(Debug, Deserialize)]
struct QdrantCount {
    count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_maps_score_to_distance() {
        let raw = r#"{
            "result": [
                {"id": "c1", "score": 0.75, "payload": {"chunk_id": "c1", "parent_id": "p1", "text": "fever"}, "vector": [0.6, 0.8]},
                {"id": "c2", "score": 0.5, "payload": null}
            ],
            "status": "ok",
            "time": 0.001
        }"#;
        let parsed: QdrantSearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.len(), 2);
        let first = &parsed.result[0];
        assert_eq!(first.payload.as_ref().unwrap().parent_id, "p1");
        assert_eq!(first.vector.as_deref(), Some(&[0.6, 0.8][..]));
        assert!((DistanceMetric::Cosine.relevance(1.0 - first.score) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn point_serializes_with_payload() {
        let embedding = vec![1.0, 0.0];
        let point = QdrantPoint {
            id: "c1",
            vector: &embedding,
            payload: QdrantPayload {
                chunk_id: "c1".into(),
                parent_id: "p1".into(),
                text: "sore throat".into(),
            },
        };
        let value = serde_json::to_value(&point).unwrap();
        assert_eq!(value["payload"]["parent_id"], "p1");
        assert_eq!(value["vector"][0], 1.0);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let store = QdrantStore::new("http://localhost:6333/", "chunks");
        assert_eq!(store.collection_url(), "http://localhost:6333/collections/chunks");
    }
}
