//! Context-aware conversational QA agent: per-conversation state, optional
//! MCP tool augmentation, and streamed or buffered answers from a hosted
//! language model.

pub mod api;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod llm;
pub mod prompt;
pub mod protocol;
pub mod tools;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Conversation identifier type. Opaque; supplied by the caller or
/// generated per request when absent.
pub type ContextId = Arc<str>;

/// One QA request as the engine sees it, independent of transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRequest {
    /// The user's question. Must be non-empty after trimming.
    pub input_text: String,
    /// Conversation to continue. Absent means a fresh ephemeral context.
    pub context_id: Option<String>,
    /// Situational text from the host caller (e.g. page content).
    pub host_context: Option<String>,
    /// Caller's delivery preference.
    pub streaming: bool,
}

impl QaRequest {
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            context_id: None,
            host_context: None,
            streaming: false,
        }
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_host_context(mut self, host_context: impl Into<String>) -> Self {
        self.host_context = Some(host_context.into());
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// The completed answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaResponse {
    /// Final answer text. For streaming requests this is the assembled
    /// concatenation of every delivered fragment.
    pub text: String,
    /// The conversation this turn was recorded under. Echoes the request's
    /// id, or the generated one for ephemeral contexts.
    pub context_id: String,
    /// Every tool invocation attempted for this turn, in order.
    pub tools_used: Vec<tools::ToolInvocation>,
}
