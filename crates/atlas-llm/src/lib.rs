//! `atlas-llm` — OpenAI-compatible HTTP clients.
//!
//! Chat completions (blocking and SSE streaming, with tool calls),
//! embeddings, and rerank. Everything speaks the `/v1` wire format;
//! which endpoint and key to use comes from the AI registry or the
//! RAG configuration.

pub mod chat;
pub mod embedding;
pub mod error;
pub mod rerank;
pub mod stream;

pub use chat::{ChatApi, ChatRequest, ChatResponse, OpenAiCompatClient, ToolCall, ToolDefinition};
pub use error::LlmError;
pub use stream::StreamEvent;
