//! Prompt composition: system preamble, host context, history window,
//! tool evidence, and the new question, assembled in a fixed order under a
//! character budget.

use crate::context::{Role, Turn};
use crate::tools::{ToolInvocation, ToolOutcome};

/// Default system preamble for plain QA.
pub const DEFAULT_PREAMBLE: &str = "You are a question answering assistant embedded in a website.\n\
Answer the visitor's question directly and completely, in the language the question was asked in.\n\
Prefer information from the page context and tool evidence sections when they are present.\n\
Do not describe yourself or your capabilities unless asked.";

/// Builds prompts. Composition is a pure function of its inputs: the same
/// history, host context, tool results, and question always produce the
/// same prompt text.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    preamble: String,
    budget_chars: usize,
}

impl PromptComposer {
    pub fn new(budget_chars: usize) -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            budget_chars,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// Compose the full prompt.
    ///
    /// Only `Success` tool outcomes are rendered; the engine logs the rest.
    /// When the budget is exceeded, history turns are dropped oldest-first.
    /// Host context and the new question are never truncated.
    pub fn compose(
        &self,
        history: &[Turn],
        host_context: Option<&str>,
        tool_results: &[ToolInvocation],
        input_text: &str,
    ) -> String {
        let fixed = self.render(&[], host_context, tool_results, input_text);
        let fixed_chars = fixed.chars().count();

        // Walk newest-first so the oldest turns fall off the budget. When
        // the fixed sections alone exceed the budget, history goes entirely
        // but host context and the question stay whole.
        let mut keep = 0;
        if fixed_chars < self.budget_chars {
            let mut remaining = self.budget_chars - fixed_chars;
            for turn in history.iter().rev() {
                let cost = rendered_turn_len(turn);
                if cost > remaining {
                    break;
                }
                remaining -= cost;
                keep += 1;
            }
        }

        let window = &history[history.len() - keep..];
        self.render(window, host_context, tool_results, input_text)
    }

    fn render(
        &self,
        history: &[Turn],
        host_context: Option<&str>,
        tool_results: &[ToolInvocation],
        input_text: &str,
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str(&self.preamble);
        prompt.push_str("\n\n");

        if let Some(host) = host_context.filter(|text| !text.trim().is_empty()) {
            prompt.push_str("## Page context\n\n");
            prompt.push_str(host.trim());
            prompt.push_str("\n\n");
        }

        if !history.is_empty() {
            prompt.push_str("## Conversation so far\n\n");
            for turn in history {
                push_turn(&mut prompt, turn);
            }
            prompt.push('\n');
        }

        let successes: Vec<(&str, &str)> = tool_results
            .iter()
            .filter_map(|invocation| match &invocation.outcome {
                ToolOutcome::Success(payload) => {
                    Some((invocation.tool_name.as_str(), payload.as_str()))
                }
                _ => None,
            })
            .collect();

        if !successes.is_empty() {
            prompt.push_str("## Tool evidence\n\n");
            for (name, payload) in successes {
                prompt.push_str(&format!("[tool:{name}]\n{payload}\n\n"));
            }
        }

        prompt.push_str("## Question\n\n");
        prompt.push_str(input_text);
        prompt
    }
}

fn push_turn(prompt: &mut String, turn: &Turn) {
    let label = match turn.role {
        Role::User => "User",
        Role::Agent => "Agent",
    };
    prompt.push_str(&format!("{label}: {}\n", turn.text));
}

// Budgeting counts characters, not bytes, so multibyte text is not
// penalized.
fn rendered_turn_len(turn: &Turn) -> usize {
    // "User: " / "Agent: " prefix + text + newline.
    let label_len = match turn.role {
        Role::User => 6,
        Role::Agent => 7,
    };
    label_len + turn.text.chars().count() + 1
}
