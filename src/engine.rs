//! QA engine: orchestrates one request end-to-end.
//!
//! Sequencing per request: load/create the conversation, apply host
//! context, let the tool policy pick tools, invoke them (concurrently,
//! all bounded), compose the prompt, call the model, and write the
//! exchange back, only on success. Tool failures are absorbed; model
//! failures are terminal and leave history untouched.

use crate::config::EngineConfig;
use crate::context::ConversationStore;
use crate::error::EngineError;
use crate::llm::ModelBackend;
use crate::prompt::PromptComposer;
use crate::tools::{ToolDescriptor, ToolGateway, ToolInvocation};
use crate::{QaRequest, QaResponse};

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// One tool call the policy decided to make.
#[derive(Debug, Clone)]
pub struct ToolPlan {
    pub tool_name: String,
    pub arguments: Value,
}

/// Decides which tools to invoke for a question. Implementations must be
/// deterministic given the same input text and tool registry.
pub trait ToolPolicy: Send + Sync {
    fn select(&self, tools: &[ToolDescriptor], input_text: &str) -> Vec<ToolPlan>;
}

/// Default trigger policy: URLs in the question route to web-ish tools,
/// and descriptor name tokens found in the question select that tool.
pub struct KeywordToolPolicy;

impl ToolPolicy for KeywordToolPolicy {
    fn select(&self, tools: &[ToolDescriptor], input_text: &str) -> Vec<ToolPlan> {
        let lowered = input_text.to_lowercase();
        let url = extract_url(input_text);

        let mut plans: Vec<ToolPlan> = Vec::new();
        for tool in tools {
            let haystack = format!("{} {}", tool.name, tool.description).to_lowercase();

            if let Some(url) = &url {
                let takes_url = tool
                    .input_schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .is_some_and(|properties| properties.contains_key("url"));
                if takes_url
                    && ["url", "web", "fetch", "page", "browse"]
                        .iter()
                        .any(|marker| haystack.contains(marker))
                {
                    plans.push(ToolPlan {
                        tool_name: tool.name.clone(),
                        arguments: serde_json::json!({ "url": url }),
                    });
                    continue;
                }
            }

            let name_matches = tool
                .name
                .split(['_', '-'])
                .any(|token| token.len() >= 4 && lowered.contains(&token.to_lowercase()));
            if name_matches {
                let arguments = query_arguments(tool, input_text);
                plans.push(ToolPlan {
                    tool_name: tool.name.clone(),
                    arguments,
                });
            }
        }

        plans.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        plans.dedup_by(|a, b| a.tool_name == b.tool_name);
        plans
    }
}

fn query_arguments(tool: &ToolDescriptor, input_text: &str) -> Value {
    let properties = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object);
    for key in ["query", "q", "question", "text"] {
        if properties.is_some_and(|map| map.contains_key(key)) {
            return serde_json::json!({ key: input_text });
        }
    }
    serde_json::json!({})
}

fn extract_url(input_text: &str) -> Option<String> {
    input_text
        .split_whitespace()
        .find(|word| word.starts_with("http://") || word.starts_with("https://"))
        .map(|word| word.trim_end_matches(['.', ',', ')', ']', '>', '!', '?']).to_string())
}

/// Incremental delivery from [`QaEngine::answer_stream`].
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    /// One answer fragment, forwarded as the backend produced it.
    Fragment(String),
    /// Terminal event: the full assembled response, already written back.
    Done(QaResponse),
}

/// The context-aware execution layer.
#[derive(Clone)]
pub struct QaEngine {
    store: Arc<ConversationStore>,
    gateway: Arc<dyn ToolGateway>,
    backend: Arc<dyn ModelBackend>,
    policy: Arc<dyn ToolPolicy>,
    composer: PromptComposer,
    config: EngineConfig,
}

/// Everything assembled before the model call. The guard serializes
/// requests sharing a context id and is held until the exchange is
/// written back (or abandoned).
struct PreparedTurn {
    context_id: String,
    input_text: String,
    prompt: String,
    invocations: Vec<ToolInvocation>,
    _guard: OwnedMutexGuard<()>,
}

impl QaEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        gateway: Arc<dyn ToolGateway>,
        backend: Arc<dyn ModelBackend>,
        policy: Arc<dyn ToolPolicy>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            backend,
            policy,
            composer: PromptComposer::new(config.prompt_budget_chars),
            config,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn ToolGateway> {
        &self.gateway
    }

    /// Answer a request in buffered mode.
    pub async fn answer(&self, request: QaRequest) -> Result<QaResponse, EngineError> {
        let prepared = self.prepare(&request).await?;

        let text = self
            .backend
            .complete(&prepared.prompt)
            .await
            .map_err(|error| {
                tracing::warn!(context_id = %prepared.context_id, %error, "model invocation failed");
                EngineError::from(error)
            })?;

        self.store
            .append_exchange(&prepared.context_id, &prepared.input_text, &text)
            .await;

        tracing::info!(
            context_id = %prepared.context_id,
            tools = prepared.invocations.len(),
            "request completed"
        );

        Ok(QaResponse {
            text,
            context_id: prepared.context_id,
            tools_used: prepared.invocations,
        })
    }

    /// Answer a request in streaming mode.
    ///
    /// Fragments are forwarded as the backend yields them; the full text is
    /// accumulated alongside and written back only after the backend
    /// signals a clean end-of-stream. Dropping the returned stream stops
    /// the relay and skips the writeback.
    pub async fn answer_stream(
        &self,
        request: QaRequest,
    ) -> Result<BoxStream<'static, Result<AnswerEvent, EngineError>>, EngineError> {
        let prepared = self.prepare(&request).await?;

        let mut fragments = self
            .backend
            .stream(&prepared.prompt)
            .await
            .map_err(|error| {
                tracing::warn!(context_id = %prepared.context_id, %error, "model stream setup failed");
                EngineError::from(error)
            })?;

        let store = self.store.clone();
        let stream = async_stream::stream! {
            let prepared = prepared;
            let mut assembled = String::new();

            while let Some(item) = fragments.next().await {
                match item {
                    Ok(fragment) => {
                        assembled.push_str(&fragment);
                        yield Ok(AnswerEvent::Fragment(fragment));
                    }
                    Err(error) => {
                        // Fragments already delivered are not retracted;
                        // the terminal error marks the answer incomplete
                        // and nothing is recorded.
                        tracing::warn!(
                            context_id = %prepared.context_id,
                            %error,
                            "model stream failed mid-answer"
                        );
                        yield Err(EngineError::from(error));
                        return;
                    }
                }
            }

            store
                .append_exchange(&prepared.context_id, &prepared.input_text, &assembled)
                .await;

            tracing::info!(
                context_id = %prepared.context_id,
                tools = prepared.invocations.len(),
                "streaming request completed"
            );

            yield Ok(AnswerEvent::Done(QaResponse {
                text: assembled,
                context_id: prepared.context_id.clone(),
                tools_used: prepared.invocations.clone(),
            }));
        };

        Ok(stream.boxed())
    }

    /// Validate, load context, run tools, and compose the prompt.
    async fn prepare(&self, request: &QaRequest) -> Result<PreparedTurn, EngineError> {
        let input_text = request.input_text.trim();
        if input_text.is_empty() {
            return Err(EngineError::InvalidRequest("input text is empty".into()));
        }
        let input_text = input_text.to_string();

        let context_id = request
            .context_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Serialize with other requests on the same conversation for the
        // rest of this turn.
        let guard = self.store.begin_turn(&context_id).await;

        if let Some(host_context) = &request.host_context {
            self.store.set_host_context(&context_id, host_context).await;
        }

        let tools = self.gateway.list_tools().await;
        let plans = self.policy.select(&tools, &input_text);

        let invocations = if plans.is_empty() {
            Vec::new()
        } else {
            tracing::debug!(
                context_id = %context_id,
                count = plans.len(),
                "invoking tools"
            );
            let calls = plans
                .iter()
                .map(|plan| self.gateway.invoke(&plan.tool_name, plan.arguments.clone()));
            futures::future::join_all(calls).await
        };

        for invocation in &invocations {
            if !invocation.outcome.is_success() {
                tracing::warn!(
                    context_id = %context_id,
                    tool = %invocation.tool_name,
                    outcome = ?invocation.outcome,
                    "tool invocation did not succeed, continuing without it"
                );
            }
        }

        let history = self
            .store
            .history_window(&context_id, self.config.history_window)
            .await;
        let snapshot = self.store.snapshot(&context_id).await;

        let prompt = self.composer.compose(
            &history,
            snapshot.host_context.as_deref(),
            &invocations,
            &input_text,
        );

        Ok(PreparedTurn {
            context_id,
            input_text,
            prompt,
            invocations,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::FragmentStream;
    use crate::tools::ToolOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Backend returning a fixed reply; streaming splits it into small
    /// fragments so both modes exercise assembly.
    struct StaticBackend {
        reply: String,
    }

    #[async_trait]
    impl ModelBackend for StaticBackend {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.reply.clone())
        }

        async fn stream(&self, _prompt: &str) -> Result<FragmentStream, LlmError> {
            let fragments: Vec<String> = self
                .reply
                .chars()
                .collect::<Vec<_>>()
                .chunks(3)
                .map(|chunk| chunk.iter().collect())
                .collect();
            Ok(futures::stream::iter(fragments.into_iter().map(Ok)).boxed())
        }
    }

    /// Backend recording every prompt it receives.
    struct CaptureBackend {
        prompts: Mutex<Vec<String>>,
        reply: String,
    }

    impl CaptureBackend {
        fn new(reply: &str) -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                reply: reply.into(),
            }
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelBackend for CaptureBackend {
        async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        async fn stream(&self, prompt: &str) -> Result<FragmentStream, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(futures::stream::iter([Ok(self.reply.clone())]).boxed())
        }
    }

    /// Backend that always fails; streaming fails after one fragment.
    struct FailingBackend;

    #[async_trait]
    impl ModelBackend for FailingBackend {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError::Timeout(30))
        }

        async fn stream(&self, _prompt: &str) -> Result<FragmentStream, LlmError> {
            Ok(futures::stream::iter([
                Ok("partial ".to_string()),
                Err(LlmError::StreamTruncated),
            ])
            .boxed())
        }
    }

    /// Gateway advertising one tool that is never reachable.
    struct UnreachableGateway;

    #[async_trait]
    impl ToolGateway for UnreachableGateway {
        async fn invoke(&self, tool_name: &str, _arguments: Value) -> ToolInvocation {
            ToolInvocation {
                tool_name: tool_name.to_string(),
                outcome: ToolOutcome::Unavailable("connection refused".into()),
            }
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                server: "runner".into(),
                name: "search".into(),
                description: "search the knowledge base".into(),
                input_schema: serde_json::json!({"properties": {"query": {"type": "string"}}}),
            }]
        }
    }

    /// Gateway with no tools at all.
    struct EmptyGateway;

    #[async_trait]
    impl ToolGateway for EmptyGateway {
        async fn invoke(&self, tool_name: &str, _arguments: Value) -> ToolInvocation {
            ToolInvocation {
                tool_name: tool_name.to_string(),
                outcome: ToolOutcome::Unavailable("no tools configured".into()),
            }
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            Vec::new()
        }
    }

    fn engine_with(backend: Arc<dyn ModelBackend>, gateway: Arc<dyn ToolGateway>) -> QaEngine {
        QaEngine::new(
            Arc::new(ConversationStore::new(20)),
            gateway,
            backend,
            Arc::new(KeywordToolPolicy),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn hello_scenario_records_both_turns() {
        let engine = engine_with(
            Arc::new(StaticBackend {
                reply: "Hello!".into(),
            }),
            Arc::new(EmptyGateway),
        );

        let response = engine
            .answer(QaRequest::new("Hi").with_context_id("c1"))
            .await
            .unwrap();

        assert_eq!(response.text, "Hello!");
        assert_eq!(response.context_id, "c1");

        let snapshot = engine.store().snapshot("c1").await;
        let turns: Vec<(String, String)> = snapshot
            .turns
            .iter()
            .map(|t| (t.role.to_string(), t.text.clone()))
            .collect();
        assert_eq!(
            turns,
            [
                ("user".to_string(), "Hi".to_string()),
                ("agent".to_string(), "Hello!".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn n_requests_leave_2n_alternating_turns() {
        let engine = engine_with(
            Arc::new(StaticBackend { reply: "ok".into() }),
            Arc::new(EmptyGateway),
        );

        for index in 0..3 {
            engine
                .answer(QaRequest::new(format!("question {index}")).with_context_id("c1"))
                .await
                .unwrap();
        }

        let snapshot = engine.store().snapshot("c1").await;
        assert_eq!(snapshot.turns.len(), 6);
        for (index, turn) in snapshot.turns.iter().enumerate() {
            let expected = if index % 2 == 0 { "user" } else { "agent" };
            assert_eq!(turn.role.to_string(), expected);
        }
        assert_eq!(snapshot.turns[4].text, "question 2");
    }

    #[tokio::test]
    async fn failed_model_call_leaves_history_unchanged() {
        let store = Arc::new(ConversationStore::new(20));
        store.append_exchange("c1", "earlier", "answer").await;

        let engine = QaEngine::new(
            store.clone(),
            Arc::new(EmptyGateway),
            Arc::new(FailingBackend),
            Arc::new(KeywordToolPolicy),
            EngineConfig::default(),
        );

        let error = engine
            .answer(QaRequest::new("doomed").with_context_id("c1"))
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::ModelUnavailable { .. }));
        assert_eq!(store.history_len("c1").await, 2);
    }

    #[tokio::test]
    async fn truncated_stream_writes_nothing_back() {
        let engine = engine_with(Arc::new(FailingBackend), Arc::new(EmptyGateway));

        let mut stream = engine
            .answer_stream(QaRequest::new("doomed").with_context_id("c1").streaming(true))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, AnswerEvent::Fragment(ref f) if f == "partial "));

        let second = stream.next().await.unwrap();
        assert!(matches!(
            second,
            Err(EngineError::ModelUnavailable { retryable: true, .. })
        ));
        assert!(stream.next().await.is_none());

        assert_eq!(engine.store().history_len("c1").await, 0);
    }

    #[tokio::test]
    async fn unreachable_tools_never_block_completion() {
        let engine = engine_with(
            Arc::new(StaticBackend {
                reply: "still answered".into(),
            }),
            Arc::new(UnreachableGateway),
        );

        // "search" appears in the question, so the policy selects the tool.
        let response = engine
            .answer(QaRequest::new("please search for rust").with_context_id("c1"))
            .await
            .unwrap();

        assert_eq!(response.text, "still answered");
        assert_eq!(response.tools_used.len(), 1);
        assert!(matches!(
            response.tools_used[0].outcome,
            ToolOutcome::Unavailable(_)
        ));
        assert_eq!(engine.store().history_len("c1").await, 2);
    }

    #[tokio::test]
    async fn streaming_assembles_the_same_text_as_buffered() {
        let reply = "an answer long enough to split across fragments";
        let engine = engine_with(
            Arc::new(StaticBackend {
                reply: reply.into(),
            }),
            Arc::new(EmptyGateway),
        );

        let buffered = engine
            .answer(QaRequest::new("same input").with_context_id("a"))
            .await
            .unwrap();

        let mut stream = engine
            .answer_stream(QaRequest::new("same input").with_context_id("b").streaming(true))
            .await
            .unwrap();

        let mut assembled = String::new();
        let mut done_text = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                AnswerEvent::Fragment(fragment) => assembled.push_str(&fragment),
                AnswerEvent::Done(response) => done_text = Some(response.text),
            }
        }

        assert_eq!(buffered.text, reply);
        assert_eq!(assembled, reply);
        assert_eq!(done_text.as_deref(), Some(reply));
        assert_eq!(engine.store().history_len("b").await, 2);
    }

    #[tokio::test]
    async fn second_request_sees_prior_turns_in_prompt() {
        let backend = Arc::new(CaptureBackend::new("Hello!"));
        let engine = engine_with(backend.clone(), Arc::new(EmptyGateway));

        engine
            .answer(QaRequest::new("Hi").with_context_id("c1"))
            .await
            .unwrap();
        engine
            .answer(QaRequest::new("What's my name?").with_context_id("c1"))
            .await
            .unwrap();

        let prompt = backend.last_prompt();
        assert!(prompt.contains("Hi"));
        assert!(prompt.contains("Hello!"));
        assert!(prompt.ends_with("What's my name?"));
    }

    #[tokio::test]
    async fn newer_host_context_replaces_older_in_prompts() {
        let backend = Arc::new(CaptureBackend::new("ok"));
        let engine = engine_with(backend.clone(), Arc::new(EmptyGateway));

        engine
            .answer(
                QaRequest::new("first")
                    .with_context_id("c1")
                    .with_host_context("A"),
            )
            .await
            .unwrap();
        engine
            .answer(
                QaRequest::new("second")
                    .with_context_id("c1")
                    .with_host_context("B"),
            )
            .await
            .unwrap();

        let prompt = backend.last_prompt();
        assert!(prompt.contains("## Page context\n\nB"));
        assert!(!prompt.contains("## Page context\n\nA"));
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_any_state_change() {
        let engine = engine_with(
            Arc::new(StaticBackend { reply: "x".into() }),
            Arc::new(EmptyGateway),
        );

        let error = engine
            .answer(QaRequest::new("   ").with_context_id("c1"))
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::InvalidRequest(_)));
        assert_eq!(engine.store().history_len("c1").await, 0);
    }

    #[tokio::test]
    async fn absent_context_id_gets_generated() {
        let engine = engine_with(
            Arc::new(StaticBackend { reply: "x".into() }),
            Arc::new(EmptyGateway),
        );

        let response = engine.answer(QaRequest::new("hello")).await.unwrap();
        assert!(!response.context_id.is_empty());
        assert_eq!(engine.store().history_len(&response.context_id).await, 2);
    }

    #[test]
    fn keyword_policy_is_deterministic_and_url_aware() {
        let tools = vec![
            ToolDescriptor {
                server: "web".into(),
                name: "fetch_page".into(),
                description: "fetch a web page by url".into(),
                input_schema: serde_json::json!({"properties": {"url": {"type": "string"}}}),
            },
            ToolDescriptor {
                server: "kb".into(),
                name: "search".into(),
                description: "keyword search".into(),
                input_schema: serde_json::json!({"properties": {"query": {"type": "string"}}}),
            },
        ];

        let policy = KeywordToolPolicy;
        let input = "summarize https://example.com/post, please";
        let first = policy.select(&tools, input);
        let second = policy.select(&tools, input);

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tool_name, "fetch_page");
        assert_eq!(first[0].arguments["url"], "https://example.com/post");
        assert_eq!(first.len(), second.len());

        let none = policy.select(&tools, "what time is it?");
        assert!(none.is_empty());
    }
}
