use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chat request accepted from callers (OpenAI chat-completions shape)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Workflow inputs; only workflow adaptors read these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Remaining caller fields, forwarded by pass-through adaptors
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// The message whose content becomes the active query
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Text of the last message with the given role
    pub fn last_text_for_role(&self, role: &str) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == role)
            .map(|m| m.text())
    }
}

/// Message in the conversation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Content as an ordered list of recognized parts.
    ///
    /// A plain string that holds a JSON array of typed objects
    /// (`[{"type":"text","content":"hi"},{"type":"image","file_id":7}]`) is
    /// expanded into parts, since some front-ends serialize mixed content that way.
    pub fn parts(&self) -> Vec<KnownPart> {
        match &self.content {
            MessageContent::Text(text) => {
                if text.trim_start().starts_with('[') {
                    if let Ok(objects) = serde_json::from_str::<Vec<ObjectStringPart>>(text) {
                        if !objects.is_empty() {
                            return objects.into_iter().filter_map(ObjectStringPart::into_part).collect();
                        }
                    }
                }
                vec![KnownPart::Text { text: text.clone() }]
            }
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Known(k) => Some(k.clone()),
                    ContentPart::Unknown(_) => None,
                })
                .collect(),
        }
    }

    /// All text parts joined with newlines
    pub fn text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                KnownPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First text part, used as the query by bot-style vendors
    pub fn first_text(&self) -> String {
        self.parts()
            .into_iter()
            .find_map(|p| match p {
                KnownPart::Text { text } => Some(text),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Tenant file references in content order
    pub fn file_refs(&self) -> Vec<FileRef> {
        self.parts()
            .into_iter()
            .filter_map(|p| match p {
                KnownPart::Image { file_id: Some(id), .. } => Some(FileRef { file_id: id, kind: FileRefKind::Image }),
                KnownPart::File { file_id } => Some(FileRef { file_id, kind: FileRefKind::File }),
                _ => None,
            })
            .collect()
    }
}

/// Message content can be a string or an array of parts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Content part; unknown part types are preserved but ignored
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentPart {
    Known(KnownPart),
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownPart {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<ImageUrl>,
    },
    File {
        file_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Object-string content element: `content` or `text` carries text, `file_id` may be a number or a string
#[derive(Debug, Deserialize)]
struct ObjectStringPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file_id: Option<Value>,
}

impl ObjectStringPart {
    fn into_part(self) -> Option<KnownPart> {
        let file_id = self.file_id.as_ref().and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim_start_matches("file_id:").parse().ok(),
            _ => None,
        });
        match self.kind.as_str() {
            "text" => Some(KnownPart::Text {
                text: self.content.or(self.text).unwrap_or_default(),
            }),
            "image" => Some(KnownPart::Image { file_id, image_url: None }),
            "file" => file_id.map(|file_id| KnownPart::File { file_id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRefKind {
    Image,
    File,
}

impl FileRefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRefKind::Image => "image",
            FileRefKind::File => "file",
        }
    }
}

/// Reference from a message part to a tenant-owned upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub file_id: i64,
    pub kind: FileRefKind,
}

/// Token usage; `total_tokens` is always `prompt_tokens + completion_tokens`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UsageWire")]
pub struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u32 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u32 {
        self.total_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

/// Vendor usage as received; the total is recomputed on conversion
#[derive(Deserialize)]
struct UsageWire {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<UsageWire> for Usage {
    fn from(wire: UsageWire) -> Self {
        Usage::new(wire.prompt_tokens, wire.completion_tokens)
    }
}

/// Non-streaming chat response returned to callers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatResponse {
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowResult>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatResponse {
    /// Single-choice assistant response
    pub fn assistant(id: impl Into<String>, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: chat_completion_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: content.into(),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage::default(),
            workflow: None,
        }
    }

    /// Content of all choices concatenated
    pub fn text(&self) -> String {
        self.choices.iter().map(|c| c.message.content.as_str()).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseMessage {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub content: String,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of a workflow run
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WorkflowResult {
    pub execute_id: String,
    pub outputs: Map<String, Value>,
}

/// Streaming chunk emitted by chat adaptors that normalize vendor events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    pub fn delta(
        id: impl Into<String>,
        model: impl Into<String>,
        role: Option<&str>,
        content: Option<String>,
        finish_reason: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: role.map(str::to_string),
                    content,
                },
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}
