//! Protocol executor: drives one QA turn and translates engine events
//! into task events on an outbound channel.
//!
//! Every `execute` call pushes exactly one terminal status update, even
//! on failure. If the receiver hangs up mid-stream the relay stops and
//! no further events are produced.

use crate::config::AgentIdentity;
use crate::engine::{AnswerEvent, QaEngine};
use crate::protocol::{
    AgentCapabilities, AgentCard, AgentSkill, ExecuteRequest, TaskEvent, TaskState,
};
use crate::QaRequest;

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Name of the single artifact carrying the assembled answer.
const ANSWER_ARTIFACT: &str = "qa_response";

pub struct TaskExecutor {
    engine: Arc<QaEngine>,
    identity: AgentIdentity,
}

impl TaskExecutor {
    pub fn new(engine: Arc<QaEngine>, identity: AgentIdentity) -> Self {
        Self { engine, identity }
    }

    pub fn engine(&self) -> &Arc<QaEngine> {
        &self.engine
    }

    /// Run one task, emitting events on `events` until the terminal one.
    pub async fn execute(&self, request: ExecuteRequest, events: mpsc::Sender<TaskEvent>) {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let context_id = request
            .context_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let input_text = request.message.text();
        if input_text.trim().is_empty() {
            self.finish(
                &events,
                &task_id,
                &context_id,
                TaskState::Failed,
                Some("message contained no text".into()),
            )
            .await;
            return;
        }

        let mut qa_request = QaRequest::new(input_text)
            .with_context_id(&context_id)
            .streaming(true);
        if let Some(host_context) = request.host_context() {
            qa_request = qa_request.with_host_context(host_context);
        }

        let mut stream = match self.engine.answer_stream(qa_request).await {
            Ok(stream) => stream,
            Err(error) => {
                self.finish(
                    &events,
                    &task_id,
                    &context_id,
                    TaskState::Failed,
                    Some(error.to_string()),
                )
                .await;
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                Ok(AnswerEvent::Fragment(fragment)) => {
                    let update = TaskEvent::StatusUpdate {
                        task_id: task_id.clone(),
                        context_id: context_id.clone(),
                        state: TaskState::Working,
                        message: Some(fragment),
                        is_final: false,
                    };
                    if events.send(update).await.is_err() {
                        // Receiver gone; dropping the stream abandons the
                        // turn without recording it.
                        tracing::debug!(task_id = %task_id, "event receiver dropped, aborting task");
                        return;
                    }
                }
                Ok(AnswerEvent::Done(response)) => {
                    let artifact = TaskEvent::ArtifactUpdate {
                        task_id: task_id.clone(),
                        context_id: context_id.clone(),
                        name: ANSWER_ARTIFACT.into(),
                        text: response.text,
                        last_chunk: true,
                    };
                    if events.send(artifact).await.is_err() {
                        return;
                    }
                    self.finish(&events, &task_id, &context_id, TaskState::Completed, None)
                        .await;
                    return;
                }
                Err(error) => {
                    self.finish(
                        &events,
                        &task_id,
                        &context_id,
                        TaskState::Failed,
                        Some(error.to_string()),
                    )
                    .await;
                    return;
                }
            }
        }

        // A well-behaved engine stream ends with Done or Err; cover the
        // empty-stream case anyway so the terminal event is never lost.
        self.finish(
            &events,
            &task_id,
            &context_id,
            TaskState::Failed,
            Some("answer stream ended without completing".into()),
        )
        .await;
    }

    /// Cancel a task: emits the terminal canceled status. In-flight model
    /// work is abandoned by dropping its stream at the call site.
    pub async fn cancel(&self, task_id: &str, context_id: &str, events: &mpsc::Sender<TaskEvent>) {
        tracing::info!(task_id = %task_id, "task canceled");
        self.finish(events, task_id, context_id, TaskState::Canceled, None)
            .await;
    }

    async fn finish(
        &self,
        events: &mpsc::Sender<TaskEvent>,
        task_id: &str,
        context_id: &str,
        state: TaskState,
        message: Option<String>,
    ) {
        let _ = events
            .send(TaskEvent::StatusUpdate {
                task_id: task_id.to_string(),
                context_id: context_id.to_string(),
                state,
                message,
                is_final: true,
            })
            .await;
    }

    /// Build the discovery card, listing one skill per currently reachable
    /// MCP tool plus the built-in QA skill.
    pub async fn agent_card(&self) -> AgentCard {
        let mut skills = vec![AgentSkill {
            id: "contextual_qa".into(),
            name: "Contextual question answering".into(),
            description: "Answers questions using conversation history and host-supplied context"
                .into(),
            tags: vec!["qa".into(), "chat".into()],
            examples: vec!["What does this page say about pricing?".into()],
        }];

        for tool in self.engine.gateway().list_tools().await {
            let (id, tags) = if tool.server == "builtin" {
                (tool.name.clone(), vec!["builtin".to_string()])
            } else {
                (
                    format!("mcp_{}_{}", tool.server, tool.name),
                    vec!["mcp".to_string(), tool.server.clone()],
                )
            };
            skills.push(AgentSkill {
                id,
                name: tool.name.clone(),
                description: tool.description.clone(),
                tags,
                examples: Vec::new(),
            });
        }

        AgentCard {
            name: self.identity.name.clone(),
            description: self.identity.description.clone(),
            url: self.identity.public_url.clone(),
            version: self.identity.version.clone(),
            default_input_modes: vec!["text/plain".into()],
            default_output_modes: vec!["text/plain".into()],
            capabilities: AgentCapabilities {
                streaming: true,
                push_notifications: false,
            },
            skills,
        }
    }
}
