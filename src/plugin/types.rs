//! Core plugin types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Manifest entry name inside a package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Package file extension.
pub const PACKAGE_EXTENSION: &str = "xpkg";

/// Optional configuration schema entry inside a package.
pub const SCHEMA_FILE: &str = "config.schema.json";

/// Payload path of an out-of-process plugin executable.
pub const PROCESS_BINARY: &str = "bin/plugin";

/// A capability tag a plugin may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Text embedding.
    Embedding,
    /// Result reranking.
    Rerank,
    /// Chat completion.
    Chat,
    /// Speech synthesis (reserved, no dispatch contract).
    Tts,
    /// Speech recognition (reserved, no dispatch contract).
    Stt,
    /// Image generation (reserved, no dispatch contract).
    Image,
}

impl Capability {
    /// All known capability tags.
    pub const ALL: [Self; 6] =
        [Self::Embedding, Self::Rerank, Self::Chat, Self::Tts, Self::Stt, Self::Image];

    /// Wire name of this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Rerank => "rerank",
            Self::Chat => "chat",
            Self::Tts => "tts",
            Self::Stt => "stt",
            Self::Image => "image",
        }
    }

    /// Get the display name for this capability.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Embedding => "Embedding",
            Self::Rerank => "Rerank",
            Self::Chat => "Chat",
            Self::Tts => "Text to Speech",
            Self::Stt => "Speech to Text",
            Self::Image => "Image",
        }
    }

    /// Whether the runtime can dispatch calls for this capability.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Embedding | Self::Rerank | Self::Chat)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

/// Identity reported by a running plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Provider identifier.
    #[serde(default)]
    pub provider: Option<String>,
    /// Capabilities the instance implements.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

/// A document submitted for reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    /// Caller-side document id.
    pub id: u64,
    /// Document text.
    pub content: String,
    /// Score from the first-stage retriever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A reranked document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// The document.
    pub document: RerankDocument,
    /// Relevance score assigned by the reranker.
    pub score: f64,
    /// Position after reranking, starting at 0.
    pub rank: usize,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// A chat completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name; empty means the plugin default.
    #[serde(default)]
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Plugin-specific parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, serde_json::Value>,
}

/// One completion choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: String,
}

/// Token accounting for a chat call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A chat completion response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: ChatUsage,
}

impl ChatResponse {
    /// Text of the first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A partial chat completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Position of the chunk in the generated sequence.
    pub index: usize,
    /// Text delta.
    pub delta: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_wire_names() {
        assert_eq!(serde_json::to_string(&Capability::Embedding).unwrap(), "\"embedding\"");
        let parsed: Capability = serde_json::from_str("\"rerank\"").unwrap();
        assert_eq!(parsed, Capability::Rerank);
        assert_eq!("CHAT".parse::<Capability>().unwrap(), Capability::Chat);
        assert!("vision".parse::<Capability>().is_err());
    }

    #[test]
    fn test_reserved_capabilities_not_dispatchable() {
        assert!(Capability::Chat.is_dispatchable());
        assert!(!Capability::Tts.is_dispatchable());
        assert!(!Capability::Image.is_dispatchable());
    }

    #[test]
    fn test_chat_request_defaults() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(req.model.is_empty());
        assert_eq!(req.messages, vec![ChatMessage::user("hi")]);
        assert!(req.temperature.is_none());
    }
}
