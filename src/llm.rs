//! Model backend seam and provider client.

pub mod client;

pub use client::LlmClient;

use crate::error::LlmError;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// A lazy, finite, forward-only sequence of answer fragments.
pub type FragmentStream = BoxStream<'static, Result<String, LlmError>>;

/// The language-model backend as the engine sees it: a black-box
/// completion service with a buffered and a streaming mode.
///
/// Implementations must treat the remote service as slow, rate-limited,
/// and fallible; every failure surfaces as [`LlmError`], never a panic.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Complete the prompt and return the full answer text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Stream the answer as text fragments. The stream ends after the
    /// provider's explicit end marker; a transport drop before that marker
    /// yields a final `Err` item.
    async fn stream(&self, prompt: &str) -> Result<FragmentStream, LlmError>;
}
