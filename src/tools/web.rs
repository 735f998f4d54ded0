//! Built-in web analyzer tool: fetches a URL and reduces the page to
//! markdown so it can be fed to the model as tool evidence. Runs behind
//! [`ToolGateway`] like any MCP tool, but needs no external server.

use crate::tools::{
    MAX_TOOL_OUTPUT_BYTES, ToolDescriptor, ToolGateway, ToolInvocation, ToolOutcome,
    truncate_output,
};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::time::Duration;

pub const WEB_ANALYZER_TOOL: &str = "web_analyzer";

const USER_AGENT: &str = "Mozilla/5.0 (compatible; webqa/0.1)";

/// Containers whose descendants are boilerplate, not page content.
const SKIP_ANCESTORS: [&str; 6] = ["nav", "footer", "header", "aside", "form", "noscript"];

pub struct WebAnalyzer {
    http: reqwest::Client,
    fetch_timeout: Duration,
}

impl WebAnalyzer {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            fetch_timeout,
        }
    }

    fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            server: "builtin".to_string(),
            name: WEB_ANALYZER_TOOL.to_string(),
            description: "Fetch a web page and extract its content as markdown".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The page URL to analyze"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, ToolOutcome> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ToolOutcome::Unavailable(format!(
                        "fetching {url} timed out after {}s",
                        self.fetch_timeout.as_secs()
                    ))
                } else {
                    ToolOutcome::Unavailable(format!("failed to fetch {url}: {error}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolOutcome::Failed(format!(
                "request to {url} returned status {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|error| ToolOutcome::Unavailable(format!("failed to read {url}: {error}")))
    }
}

#[async_trait]
impl ToolGateway for WebAnalyzer {
    async fn invoke(&self, tool_name: &str, arguments: serde_json::Value) -> ToolInvocation {
        if tool_name != WEB_ANALYZER_TOOL {
            return ToolInvocation {
                tool_name: tool_name.to_string(),
                outcome: ToolOutcome::Unavailable(format!(
                    "'{tool_name}' is not a builtin tool"
                )),
            };
        }

        let url = arguments
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if url.is_empty() {
            return ToolInvocation {
                tool_name: tool_name.to_string(),
                outcome: ToolOutcome::Failed("url parameter is required".to_string()),
            };
        }

        let url = ensure_url_scheme(url);
        let outcome = match self.fetch(&url).await {
            Err(outcome) => outcome,
            Ok(html) => {
                let markdown = extract_markdown(&html);
                if markdown.is_empty() {
                    ToolOutcome::Success("[no extractable content]".to_string())
                } else {
                    ToolOutcome::Success(truncate_output(&markdown, MAX_TOOL_OUTPUT_BYTES))
                }
            }
        };

        ToolInvocation {
            tool_name: tool_name.to_string(),
            outcome,
        }
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![Self::descriptor()]
    }
}

fn ensure_url_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Reduce an HTML document to markdown: headings, paragraphs, list items,
/// quotes, and code blocks in document order, boilerplate containers
/// skipped, duplicates and fragments dropped.
fn extract_markdown(html: &str) -> String {
    let document = Html::parse_document(html);

    let Ok(content) = Selector::parse("h1, h2, h3, h4, h5, h6, p, li, blockquote, pre") else {
        return String::new();
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut blocks: Vec<String> = Vec::new();

    if let Ok(title) = Selector::parse("title") {
        if let Some(element) = document.select(&title).next() {
            let text = normalize_text(element);
            if !text.is_empty() {
                seen.insert(text.clone());
                blocks.push(format!("# {text}"));
            }
        }
    }

    for element in document.select(&content) {
        if in_skipped_container(element) {
            continue;
        }

        let tag = element.value().name();
        let text = if tag == "pre" {
            element.text().collect::<String>().trim().to_string()
        } else {
            normalize_text(element)
        };

        // Fragments and repeats add noise, not content.
        if text.chars().count() < 10 || !seen.insert(text.clone()) {
            continue;
        }

        let block = match tag {
            "h1" => format!("# {text}"),
            "h2" => format!("## {text}"),
            "h3" => format!("### {text}"),
            "h4" => format!("#### {text}"),
            "h5" => format!("##### {text}"),
            "h6" => format!("###### {text}"),
            "li" => format!("- {text}"),
            "blockquote" => format!("> {text}"),
            "pre" => format!("```\n{text}\n```"),
            _ => text,
        };
        blocks.push(block);
    }

    blocks.join("\n\n")
}

fn in_skipped_container(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| SKIP_ANCESTORS.contains(&ancestor.value().name()))
}

fn normalize_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
