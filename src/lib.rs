pub mod chat;
pub mod cli;
pub mod config;
pub mod db;
pub mod decoding;
pub mod docstore;
pub mod error;
pub mod evaluate;
pub mod graph;
pub mod index;
pub mod judgment;
pub mod llm;
pub mod memory;
pub mod models;
pub mod ollama;
pub mod openai;
pub mod prompts;
pub mod qdrant_store;
pub mod request_log;
pub mod rerank;
pub mod retrieval;
pub mod server;
pub mod tools;

pub use config::AppConfig;
pub use server::run_server;
