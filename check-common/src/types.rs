use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A caller-named unit of work to be checked. The `id` is assigned by the
/// caller and is not required to be unique across jobs.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct Snippet {
    pub id: String,
    pub code: String,
}

/// How much of the elaboration info tree the checker should return.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Infotree {
    Full,
    Tactics,
    Original,
    Substantive,
}

impl fmt::Display for Infotree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Infotree::Full => write!(f, "full"),
            Infotree::Tactics => write!(f, "tactics"),
            Infotree::Original => write!(f, "original"),
            Infotree::Substantive => write!(f, "substantive"),
        }
    }
}

/// The body of a check submission: an ordered sequence of snippets plus
/// per-request execution options.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct CheckRequest {
    pub snippets: Vec<Snippet>,
    /// Per-snippet checker timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_reuse")]
    pub reuse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infotree: Option<Infotree>,
}

fn default_timeout() -> u64 {
    30
}

fn default_reuse() -> bool {
    true
}

/// The synchronous checker's reply: one response per submitted snippet, in
/// submission order.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct CheckResponse {
    pub results: Vec<ReplResponse>,
}

/// The per-snippet outcome produced by the checker. Exactly one of
/// `response` and `error` is expected to be populated; `None` fields are
/// omitted when serialized.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct ReplResponse {
    pub id: String,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplResponse {
    /// A failure outcome carrying only the snippet id and the error detail.
    pub fn failure(id: &str, error: &str) -> Self {
        Self {
            id: id.to_owned(),
            time: 0.0,
            response: None,
            error: Some(error.to_owned()),
        }
    }
}
