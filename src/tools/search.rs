//! Optional web search tool backed by the DuckDuckGo instant-answer API

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::registry::{ToolArguments, ToolContext, ToolDescriptor, ToolError, ToolHandler};

pub const SEARCH_TOOL: &str = "search";

/// Results returned per query
pub const MAX_SEARCH_RESULTS: usize = 4;

const DEFAULT_ENDPOINT: &str = "https://api.duckduckgo.com/";

/// One search result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default, rename = "AbstractText")]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    results: Vec<Topic>,
    #[serde(default)]
    related_topics: Vec<Topic>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Topic {
    Entry {
        #[serde(rename = "Text")]
        text: String,
        #[serde(rename = "FirstURL")]
        first_url: String,
    },
    Group {
        #[serde(rename = "Topics")]
        topics: Vec<Topic>,
    },
}

impl Topic {
    fn collect_into(self, hits: &mut Vec<SearchHit>) {
        match self {
            Topic::Entry { text, first_url } => {
                let title = text.split(" - ").next().unwrap_or(&text).to_string();
                hits.push(SearchHit {
                    title,
                    url: first_url,
                    body: text,
                });
            }
            Topic::Group { topics } => {
                for topic in topics {
                    topic.collect_into(hits);
                }
            }
        }
    }
}

/// Extract up to `MAX_SEARCH_RESULTS` hits from an instant-answer response
pub fn parse_instant_answer(raw: &str) -> Result<Vec<SearchHit>, ToolError> {
    let answer: InstantAnswer =
        serde_json::from_str(raw).map_err(|e| ToolError::Search(format!("bad response: {}", e)))?;

    let mut hits = Vec::new();
    if !answer.abstract_text.is_empty() {
        hits.push(SearchHit {
            title: answer.heading,
            url: answer.abstract_url,
            body: answer.abstract_text,
        });
    }
    for topic in answer.results.into_iter().chain(answer.related_topics) {
        topic.collect_into(&mut hits);
    }
    hits.truncate(MAX_SEARCH_RESULTS);
    Ok(hits)
}

/// Render hits as `title\nurl\nbody\n\n` blocks
pub fn render_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| format!("{}\n{}\n{}\n\n", h.title, h.url, h.body))
        .collect()
}

/// Web search tool
#[derive(Clone)]
pub struct WebSearchTool {
    endpoint: String,
    client: reqwest::Client,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl WebSearchTool {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            SEARCH_TOOL,
            "Searches the web for the query and returns the top 4 results.",
        )
        .required("query", "The search query")
    }

    /// Run one query and return the rendered hits
    pub async fn search(&self, query: &str) -> Result<String, ToolError> {
        debug!(query = %query, "Web search");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| ToolError::Search(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Search(format!("HTTP {}", status)));
        }
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Search(e.to_string()))?;

        Ok(render_hits(&parse_instant_answer(&text)?))
    }
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    async fn call(&self, args: &ToolArguments, _ctx: &ToolContext) -> Result<String, ToolError> {
        self.search(args.require("query")?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Heading": "Rust (programming language)",
        "AbstractText": "Rust is a general-purpose programming language.",
        "AbstractURL": "https://en.wikipedia.org/wiki/Rust_(programming_language)",
        "Results": [],
        "RelatedTopics": [
            {"Text": "Cargo - Rust package manager", "FirstURL": "https://duckduckgo.com/Cargo"},
            {"Name": "See also", "Topics": [
                {"Text": "Ferris - Rust mascot", "FirstURL": "https://duckduckgo.com/Ferris"},
                {"Text": "Crates.io - Registry", "FirstURL": "https://duckduckgo.com/Crates"},
                {"Text": "Clippy - Linter", "FirstURL": "https://duckduckgo.com/Clippy"}
            ]}
        ]
    }"#;

    #[test]
    fn test_parse_caps_results_and_flattens_groups() {
        let hits = parse_instant_answer(SAMPLE).unwrap();
        assert_eq!(hits.len(), MAX_SEARCH_RESULTS);
        assert_eq!(hits[0].title, "Rust (programming language)");
        assert_eq!(hits[1].title, "Cargo");
        assert_eq!(hits[2].url, "https://duckduckgo.com/Ferris");
        assert_eq!(hits[3].title, "Crates.io");
    }

    #[test]
    fn test_render_hits() {
        let hits = vec![SearchHit {
            title: "T".to_string(),
            url: "u".to_string(),
            body: "b".to_string(),
        }];
        assert_eq!(render_hits(&hits), "T\nu\nb\n\n");
        assert_eq!(render_hits(&[]), "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_instant_answer("<html>"), Err(ToolError::Search(_))));
    }
}
