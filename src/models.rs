use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
pub const DEFAULT_MAX_TOKENS: u32 = 256;

/// One unit of upstream work: answer `prompt` about `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmJob {
    pub text: String,
    pub prompt: String,
}

/// A labeled sub-request of a message batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub custom_id: String,
    pub text: String,
    pub prompt: String,
}

// Anthropic Messages API request format
#[derive(Serialize, Debug, Clone)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

// Anthropic Messages API response format
#[derive(Deserialize, Debug, Clone)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl MessagesResponse {
    /// Concatenates every non-empty text block.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if block.kind == "text" && !block.text.is_empty() {
                out.push_str(&block.text);
            }
        }
        out
    }
}

#[derive(Deserialize, Debug)]
pub struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Deserialize, Debug)]
pub struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

// Message Batches API
#[derive(Serialize, Debug)]
pub struct BatchRequest {
    pub requests: Vec<InnerRequest>,
}

#[derive(Serialize, Debug, Clone)]
pub struct InnerRequest {
    pub custom_id: String,
    pub params: MessagesRequest,
}

#[derive(Deserialize, Debug)]
pub struct CreateBatchResponse {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct BatchStatusResponse {
    pub processing_status: String,
}

#[derive(Deserialize, Debug)]
pub struct BatchResultLine {
    pub custom_id: String,
    pub result: BatchResult,
}

#[derive(Deserialize, Debug)]
pub struct BatchResult {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<MessagesResponse>,
}

pub fn build_user_prompt(text: &str, prompt: &str) -> String {
    format!("TEXT:\n{text}\n\nINSTRUCTION:\n{prompt}\n\nReturn only the answer text.")
}

fn system_preamble() -> Vec<SystemBlock> {
    ["you are a precise assistant", "follow the instruction and respond with only the answer"]
        .into_iter()
        .map(|line| SystemBlock {
            kind: "text".to_string(),
            text: line.to_string(),
        })
        .collect()
}

pub fn build_messages_request(text: &str, prompt: &str, model: &str, max_tokens: u32) -> MessagesRequest {
    MessagesRequest {
        model: model.to_string(),
        max_tokens,
        system: system_preamble(),
        messages: vec![Message {
            role: "user".to_string(),
            content: build_user_prompt(text, prompt),
        }],
    }
}

pub fn build_inner_request(item: &BatchItem, model: &str, max_tokens: u32) -> InnerRequest {
    InnerRequest {
        custom_id: item.custom_id.clone(),
        params: build_messages_request(&item.text, &item.prompt, model, max_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_envelope() {
        let user = build_user_prompt("cat", "plural");
        assert_eq!(
            user,
            "TEXT:\ncat\n\nINSTRUCTION:\nplural\n\nReturn only the answer text."
        );
    }

    #[test]
    fn joined_text_skips_non_text_blocks() {
        let resp = MessagesResponse {
            content: vec![
                ContentBlock {
                    kind: "text".to_string(),
                    text: "cats".to_string(),
                },
                ContentBlock {
                    kind: "tool_use".to_string(),
                    text: String::new(),
                },
                ContentBlock {
                    kind: "text".to_string(),
                    text: "!".to_string(),
                },
            ],
        };
        assert_eq!(resp.joined_text(), "cats!");
    }

    #[test]
    fn messages_request_wire_shape() {
        let req = build_messages_request("cat", "plural", DEFAULT_MODEL, DEFAULT_MAX_TOKENS);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["system"][0]["type"], "text");
        assert_eq!(json["system"].as_array().unwrap().len(), 2);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn inner_request_carries_custom_id() {
        let item = BatchItem {
            custom_id: "abc123".to_string(),
            text: "cat".to_string(),
            prompt: "plural".to_string(),
        };
        let req = build_inner_request(&item, DEFAULT_MODEL, DEFAULT_MAX_TOKENS);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["custom_id"], "abc123");
        assert!(json["params"]["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("TEXT:\ncat"));
    }
}
