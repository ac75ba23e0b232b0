//! Chat prompt formatting.
//!
//! [`ChatTemplateFormatter`] renders plain conversations for the two most
//! common template families. Structured output and tool calling need a
//! template engine and are left to injected [`PromptFormatter`]s.

use cactus_engine::{ChatMessage, EngineError, FormatOptions, PromptFormatter};
use cactus_runtime::Logger;
use serde_json::Value;

use crate::error::{CactusError, Result};

/// Supported template families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    ChatMl,
    Llama3,
}

impl ChatTemplate {
    /// Resolve a template name or a raw template string.
    pub fn detect(template: &str) -> Option<Self> {
        match template {
            "chatml" => Some(ChatTemplate::ChatMl),
            "llama3" => Some(ChatTemplate::Llama3),
            raw if raw.contains("<|im_start|>") => Some(ChatTemplate::ChatMl),
            raw if raw.contains("<|start_header_id|>") => Some(ChatTemplate::Llama3),
            _ => None,
        }
    }

    /// Render `messages` and open an assistant turn.
    pub fn apply(self, messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for m in messages {
                    out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
                }
                out.push_str("<|im_start|>assistant\n");
            }
            ChatTemplate::Llama3 => {
                for m in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        m.role,
                        m.content.trim()
                    ));
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
        }
        out
    }
}

/// Reference [`PromptFormatter`]. Without a template it falls back to chatml.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatTemplateFormatter;

impl PromptFormatter for ChatTemplateFormatter {
    fn format(
        &self,
        messages: &[ChatMessage],
        template: Option<&str>,
        options: &FormatOptions,
    ) -> cactus_engine::Result<String> {
        if options.json_schema.is_some() || options.tools.is_some() {
            return Err(EngineError::Unsupported(
                "json_schema and tools require a template-engine formatter".into(),
            ));
        }
        let template = match template {
            None => ChatTemplate::ChatMl,
            Some(t) => ChatTemplate::detect(t)
                .ok_or_else(|| EngineError::Format(format!("unsupported chat template: {t}")))?,
        };
        Ok(template.apply(messages))
    }
}

/// Parse OpenAI-style `[{"role": .., "content": ..}]` messages.
///
/// `content` may be a string or an array of `{"type": "text", "text": ..}`
/// parts. Entries without a usable role or content are skipped with a
/// warning.
///
/// # Errors
/// - `Json`: `json` is not valid JSON
/// - `InvalidRequest`: the document is not an array
pub fn parse_messages_json(json: &str, logger: &dyn Logger) -> Result<Vec<ChatMessage>> {
    let value: Value = serde_json::from_str(json)?;
    let Value::Array(entries) = value else {
        return Err(CactusError::InvalidRequest(
            "messages must be a JSON array".into(),
        ));
    };

    let mut messages = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let role = entry.get("role").and_then(Value::as_str);
        let content = entry.get("content").and_then(message_text);
        match (role, content) {
            (Some(role), Some(content)) => messages.push(ChatMessage::new(role, content)),
            _ => logger.warn(format_args!("Skipping malformed chat message at index {i}")),
        }
    }
    Ok(messages)
}

fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}
