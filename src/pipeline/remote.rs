//! Boundary to the remote annotation service. Everything behind
//! [`AnnotateService`] is opaque: a marker-tagged payload goes out, an
//! annotated payload comes back, and any transport or shape problem
//! surfaces as one typed error for the whole call.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingScript {
    Furigana,
    Romaji,
}

impl ReadingScript {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingScript::Furigana => "furigana",
            ReadingScript::Romaji => "romaji",
        }
    }
}

/// Annotation options. `script` and `first_occurrence_only` change what the
/// service returns; `display_min_level` is applied client-side through
/// `data-level` attributes and must not vary the request or the cache key.
#[derive(Clone, Debug)]
pub struct AnnotateOptions {
    pub script: ReadingScript,
    pub first_occurrence_only: bool,
    /// Fixed maximum detail level requested from the service. Narrower
    /// per-user filtering happens on the client.
    pub max_level: u8,
    pub display_min_level: u8,
}

impl Default for AnnotateOptions {
    fn default() -> Self {
        Self {
            script: ReadingScript::Furigana,
            first_occurrence_only: false,
            max_level: 5,
            display_min_level: 0,
        }
    }
}

impl AnnotateOptions {
    /// Cache-key suffix over annotation-affecting options only.
    pub fn cache_suffix(&self) -> String {
        format!(
            ":{}:{}",
            self.script.as_str(),
            if self.first_occurrence_only { "first" } else { "all" }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionSense {
    pub gloss: String,
    pub pos: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionEntry {
    pub term: String,
    #[serde(default)]
    pub reading: String,
    pub senses: Vec<DefinitionSense>,
}

#[async_trait]
pub trait AnnotateService: Send + Sync {
    /// One atomic annotation call for a marker-tagged payload.
    async fn annotate(
        &self,
        payload: &str,
        opts: &AnnotateOptions,
    ) -> Result<String, PipelineError>;

    /// Single-term dictionary lookup.
    async fn define(&self, term: &str) -> Result<Vec<DefinitionEntry>, PipelineError>;
}

static CONTAINER_OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<div[^>]*\bid="annotated"[^>]*>"#).expect("container open regex")
});

static DIV_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<div\b[^>]*>|</div>").expect("div token regex"));

/// Inner markup of the known annotated-output container in an HTML body.
/// The closing tag is found by depth counting, so nested `<div>`s inside
/// the container do not truncate the result.
pub(crate) fn extract_container_html(body: &str) -> Option<String> {
    let open = CONTAINER_OPEN_RE.find(body)?;
    let inner = &body[open.end()..];
    let mut depth = 1usize;
    for token in DIV_TOKEN_RE.find_iter(inner) {
        if token.as_str().starts_with("</") {
            depth -= 1;
            if depth == 0 {
                return Some(inner[..token.start()].to_string());
            }
        } else {
            depth += 1;
        }
    }
    None
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    text: &'a str,
    script: &'a str,
    first_only: bool,
    max_level: u8,
}

#[derive(Deserialize)]
struct DefineResponse {
    entries: Vec<DefinitionEntry>,
}

pub struct HttpAnnotateService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnnotateService {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl AnnotateService for HttpAnnotateService {
    async fn annotate(
        &self,
        payload: &str,
        opts: &AnnotateOptions,
    ) -> Result<String, PipelineError> {
        let request = AnnotateRequest {
            text: payload,
            script: opts.script.as_str(),
            first_only: opts.first_occurrence_only,
            max_level: opts.max_level,
        };
        let resp = self
            .client
            .post(self.url("annotate"))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Transport(format!(
                "annotate returned {status}"
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        // Either a JSON payload with an `html` field, or an HTML document
        // carrying the known output container.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            return value
                .get("html")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    PipelineError::MalformedResponse("json response missing `html` field".into())
                });
        }
        extract_container_html(&body).ok_or_else(|| {
            PipelineError::MalformedResponse("html response missing annotated container".into())
        })
    }

    async fn define(&self, term: &str) -> Result<Vec<DefinitionEntry>, PipelineError> {
        let resp = self
            .client
            .post(self.url("define"))
            .json(&serde_json::json!({ "term": term }))
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Transport(format!("define returned {status}")));
        }
        let parsed: DefineResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;
        Ok(parsed.entries)
    }
}
