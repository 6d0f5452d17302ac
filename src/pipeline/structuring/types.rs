use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an assistant reply turned out to be, decided once per reply.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantOutput {
    /// Ordinary prose (failed the JSON pre-check). Holds the unsanitized text.
    PlainText(String),
    /// Schema-bearing JSON with a display field.
    Structured(StructuredReply),
    /// Looked like structured output but no display field could be recovered.
    Unparseable,
}

/// A structured reply split into its display field and side-channel data.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredReply {
    /// Name of the field the display text came from (e.g. `assistant_message`).
    pub display_field: String,
    /// Unsanitized value of the display field.
    pub message: String,
    /// The parsed object without the display field. `Value::Null` when the
    /// message was recovered by the robust extractor.
    pub data: Value,
    /// True when strict parsing failed and the regex extractor was used.
    pub recovered: bool,
}

/// Result of display extraction: what the renderer gets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayExtraction {
    pub display_text: String,
    pub structured_data: Option<Value>,
}

/// Typed view of the structured side channel, read leniently: unknown or
/// malformed entries are skipped rather than failing the whole reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub mode: Option<String>,
    pub homework: Vec<HomeworkItem>,
    pub tool_calls: Vec<Value>,
    pub emotion_ratings: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeworkItem {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due: Option<String>,
}

impl ReplyMetadata {
    pub fn from_structured(data: &Value) -> Self {
        let Some(obj) = data.as_object() else {
            return Self::default();
        };

        let mode = obj
            .get("mode")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let homework = as_items(obj.get("homework"))
            .iter()
            .filter_map(parse_homework_item)
            .collect();

        let tool_calls = as_items(obj.get("tool_calls"))
            .into_iter()
            .filter(|v| v.is_object())
            .cloned()
            .collect();

        let emotion_ratings = obj.get("emotion_ratings").filter(|v| !v.is_null()).cloned();

        Self {
            mode,
            homework,
            tool_calls,
            emotion_ratings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.homework.is_empty()
            && self.tool_calls.is_empty()
            && self.emotion_ratings.is_none()
    }
}

/// A field that should be a list may arrive as a single item.
fn as_items(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    }
}

fn parse_homework_item(value: &&Value) -> Option<HomeworkItem> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(HomeworkItem {
            title: s.trim().to_string(),
            description: None,
            due: None,
        }),
        Value::Object(_) => serde_json::from_value::<HomeworkItem>((*value).clone())
            .ok()
            .filter(|h| !h.title.trim().is_empty()),
        _ => None,
    }
}
