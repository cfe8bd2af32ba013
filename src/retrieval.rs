use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::RetrievalError;
use crate::index::{ChunkParentIndex, IndexHits, SearchMode};
use crate::models::{ParentDocument, RetrievalHit, SubDocument};

/// Lifts child-chunk hits to their parents, keeping the order in which each
/// parent first appeared among the raw hits.
#[derive(Clone)]
pub struct ScoredRetriever {
    index: Arc<ChunkParentIndex>,
    k: usize,
    mode: SearchMode,
}

impl ScoredRetriever {
    pub fn new(index: Arc<ChunkParentIndex>, k: usize, mode: SearchMode) -> Self {
        Self { index, k, mode }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn mode(&self) -> &SearchMode {
        &self.mode
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let hits = self.index.search(query, self.k, &self.mode).await?;

        let out: Vec<RetrievalHit> = match hits {
            IndexHits::Diverse(children) => {
                let mut ids: Vec<String> = Vec::new();
                for child in children {
                    if !ids.contains(&child.parent_id) {
                        ids.push(child.parent_id);
                    }
                }
                let parents = self.fetch_parents(&ids).await?;
                ids.iter()
                    .zip(parents)
                    .filter_map(|(id, parent)| match parent {
                        Some(document) => Some(RetrievalHit::unscored(document)),
                        None => {
                            warn!(parent_id = %id, "dropping hit whose parent is missing");
                            None
                        }
                    })
                    .collect()
            }
            IndexHits::Scored(children) => {
                let mut order: Vec<String> = Vec::new();
                let mut grouped: HashMap<String, Vec<SubDocument>> = HashMap::new();
                for (child, score) in children {
                    let sub = SubDocument {
                        text: child.text,
                        score,
                    };
                    match grouped.get_mut(&child.parent_id) {
                        Some(subs) => subs.push(sub),
                        None => {
                            order.push(child.parent_id.clone());
                            grouped.insert(child.parent_id, vec![sub]);
                        }
                    }
                }

                let parents = self.fetch_parents(&order).await?;
                order
                    .iter()
                    .zip(parents)
                    .filter_map(|(id, parent)| {
                        let Some(document) = parent else {
                            warn!(parent_id = %id, "dropping hit whose parent is missing");
                            return None;
                        };
                        Some(RetrievalHit {
                            document,
                            sub_docs: grouped.remove(id).unwrap_or_default(),
                        })
                    })
                    .collect()
            }
        };

        debug!(query, hits = out.len(), "retrieval finished");
        Ok(out)
    }

    async fn fetch_parents(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<ParentDocument>>, RetrievalError> {
        self.index
            .parents()
            .mget(ids)
            .await
            .map_err(|err| RetrievalError::ParentStore(format!("{err:#}")))
    }
}

pub fn format_tool_content(hits: &[RetrievalHit]) -> String {
    hits.iter()
        .map(|hit| {
            let score = hit
                .representative_score()
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "Source: {}\nScore: {}\nContent: {}",
                hit.source(),
                score,
                hit.document.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::docstore::{InMemoryParentStore, ParentStore};
    use crate::index::tests::KeywordEmbedder;
    use crate::index::{BackendHit, DistanceMetric, TextSplitter, VectorBackend};
    use crate::models::{ChildChunk, Metadata, SOURCE_KEY};

    struct ScriptedBackend {
        hits: Vec<(ChildChunk, f32)>,
    }

    #[async_trait]
    impl VectorBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn metric(&self) -> DistanceMetric {
            DistanceMetric::L2
        }

        async fn add(&self, _chunks: &[ChildChunk]) -> Result<()> {
            Ok(())
        }

        async fn search(&self, _query: &[f32], k: usize) -> Result<Vec<BackendHit>> {
            Ok(self
                .hits
                .iter()
                .take(k)
                .map(|(chunk, distance)| BackendHit {
                    chunk: chunk.clone(),
                    distance: *distance,
                })
                .collect())
        }

        async fn persist(&self) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(self.hits.len())
        }

        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl VectorBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn metric(&self) -> DistanceMetric {
            DistanceMetric::L2
        }

        async fn add(&self, _chunks: &[ChildChunk]) -> Result<()> {
            Ok(())
        }

        async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<BackendHit>> {
            anyhow::bail!("connection refused")
        }

        async fn persist(&self) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }

        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    fn parent(id: &str, source: &str, text: &str) -> ParentDocument {
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), source.to_string());
        ParentDocument {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
        }
    }

    fn child(id: &str, parent_id: &str, text: &str) -> ChildChunk {
        ChildChunk {
            id: id.to_string(),
            text: text.to_string(),
            parent_id: parent_id.to_string(),
            embedding: crate::index::tests::keyword_vector(text),
        }
    }

    async fn retriever_over(
        hits: Vec<(ChildChunk, f32)>,
        parents: Vec<ParentDocument>,
        k: usize,
        mode: SearchMode,
    ) -> ScoredRetriever {
        let store = Arc::new(InMemoryParentStore::new());
        store.mset(&parents).await.unwrap();
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(16, 0),
            Arc::new(ScriptedBackend { hits }),
            store,
            8,
        );
        ScoredRetriever::new(Arc::new(index), k, mode)
    }

    #[tokio::test]
    async fn first_hit_order_wins_over_score() {
        // A's chunk comes back first even though its distance is worse.
        let retriever = retriever_over(
            vec![
                (child("c1", "A", "fever and chills"), 0.9),
                (child("c2", "B", "sore throat"), 0.1),
            ],
            vec![
                parent("A", "flu", "fever and chills"),
                parent("B", "tonsillitis", "sore throat"),
            ],
            2,
            SearchMode::Similarity,
        )
        .await;

        let hits = retriever.retrieve("I have a fever").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(hits[0].representative_score(), Some(0.9));
    }

    #[tokio::test]
    async fn children_group_under_one_parent() {
        let retriever = retriever_over(
            vec![
                (child("c1", "A", "fever"), 0.4),
                (child("c2", "B", "rash"), 0.5),
                (child("c3", "A", "chills"), 0.2),
            ],
            vec![parent("A", "flu", "fever chills"), parent("B", "eczema", "rash")],
            3,
            SearchMode::Similarity,
        )
        .await;

        let hits = retriever.retrieve("fever").await.unwrap();
        assert_eq!(hits.len(), 2);
        let unique: HashSet<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(unique.len(), hits.len());

        let a = &hits[0];
        assert_eq!(a.document.id, "A");
        assert_eq!(
            a.sub_docs,
            vec![
                SubDocument { text: "fever".into(), score: 0.4 },
                SubDocument { text: "chills".into(), score: 0.2 },
            ]
        );
        // First encountered, not best.
        assert_eq!(a.representative_score(), Some(0.4));
    }

    #[tokio::test]
    async fn missing_parents_are_dropped() {
        let retriever = retriever_over(
            vec![
                (child("c1", "gone", "fever"), 0.1),
                (child("c2", "B", "rash"), 0.3),
            ],
            vec![parent("B", "eczema", "rash")],
            2,
            SearchMode::Similarity,
        )
        .await;

        let hits = retriever.retrieve("fever").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source(), "eczema");
    }

    #[tokio::test]
    async fn mmr_dedupes_parents_without_scores() {
        let retriever = retriever_over(
            vec![
                (child("c1", "A", "fever fever"), 0.1),
                (child("c2", "A", "fever chills"), 0.2),
                (child("c3", "B", "nausea"), 0.3),
            ],
            vec![parent("A", "flu", "fever"), parent("B", "gastro", "nausea")],
            3,
            SearchMode::Mmr { fetch_k: 3, lambda_mult: 0.5 },
        )
        .await;

        let hits = retriever.retrieve("fever").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"A") && ids.contains(&"B"));
        assert!(hits.iter().all(|h| h.sub_docs.is_empty()));
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_retrieval_error() {
        let index = ChunkParentIndex::new(
            Arc::new(KeywordEmbedder),
            TextSplitter::new(16, 0),
            Arc::new(FailingBackend),
            Arc::new(InMemoryParentStore::new()),
            8,
        );
        let retriever = ScoredRetriever::new(Arc::new(index), 2, SearchMode::Similarity);
        let err = retriever.retrieve("fever").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Search { ref backend, .. } if backend == "failing"));
    }

    #[test]
    fn tool_content_lists_source_and_score() {
        let hit = RetrievalHit {
            document: parent("A", "flu", "fever and chills"),
            sub_docs: vec![SubDocument { text: "fever".into(), score: 0.12345 }],
        };
        let unscored = RetrievalHit::unscored(parent("B", "gastro", "nausea"));
        let rendered = format_tool_content(&[hit, unscored]);
        assert_eq!(
            rendered,
            "Source: flu\nScore: 0.123\nContent: fever and chills\n\n\
             Source: gastro\nScore: n/a\nContent: nausea"
        );
    }
}
