use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::{Message, RetrievalHit};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub system_messages: Vec<Message>,
    pub rag_input_messages: Vec<Message>,
    pub retriever_queries: Vec<String>,
    pub context: Vec<Vec<RetrievalHit>>,
    pub reranked_context: Vec<Option<Vec<RetrievalHit>>>,
    pub reranker_response: Vec<Option<String>>,
    pub reranker_parsed_titles: Vec<Vec<String>>,
    pub reranker_success: Vec<Option<bool>>,
    pub demographics: Option<String>,
    /// Raw clinical judgments, kept out of `messages` in conversational mode.
    pub t0_reasoning: Vec<String>,
}

impl ConversationState {
    pub fn latest_context(&self) -> &[RetrievalHit] {
        self.context.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest_reranked(&self) -> Option<&[RetrievalHit]> {
        self.reranked_context.last().and_then(|r| r.as_deref())
    }

    pub fn generation_context(&self) -> &[RetrievalHit] {
        self.latest_reranked()
            .unwrap_or_else(|| self.latest_context())
    }

    pub fn visible_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.is_conversational())
            .cloned()
            .collect()
    }
}

/// Per-thread conversation state. Threads appear on their first turn and live
/// until cleared. A turn holds its thread's lock from start to commit, so
/// turns on one thread never interleave.
#[derive(Default)]
pub struct ConversationMemory {
    threads: RwLock<HashMap<String, Arc<Mutex<ConversationState>>>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin_turn(&self, thread_id: &str) -> OwnedMutexGuard<ConversationState> {
        let slot = {
            let mut threads = self.threads.write().await;
            threads
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationState::default())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub async fn get(&self, thread_id: &str) -> Option<ConversationState> {
        let slot = self.threads.read().await.get(thread_id).cloned()?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    pub async fn history(&self, thread_id: &str) -> Option<Vec<Message>> {
        self.get(thread_id)
            .await
            .map(|state| state.visible_messages())
    }

    pub async fn contains(&self, thread_id: &str) -> bool {
        self.threads.read().await.contains_key(thread_id)
    }

    pub async fn clear(&self, thread_id: &str) -> bool {
        self.threads.write().await.remove(thread_id).is_some()
    }

    pub async fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
