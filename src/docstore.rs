use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::ParentDocument;

#[async_trait]
pub trait ParentStore: Send + Sync {
    async fn mget(&self, ids: &[String]) -> Result<Vec<Option<ParentDocument>>>;

    async fn mset(&self, documents: &[ParentDocument]) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryParentStore {
    documents: RwLock<HashMap<String, ParentDocument>>,
}

impl InMemoryParentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParentStore for InMemoryParentStore {
    async fn mget(&self, ids: &[String]) -> Result<Vec<Option<ParentDocument>>> {
        let documents = self.documents.read().await;
        Ok(ids.iter().map(|id| documents.get(id).cloned()).collect())
    }

    async fn mset(&self, documents: &[ParentDocument]) -> Result<()> {
        let mut stored = self.documents.write().await;
        for document in documents {
            stored.insert(document.id.clone(), document.clone());
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.documents.read().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.documents.write().await.clear();
        Ok(())
    }
}
