use serde::{Deserialize, Serialize};

/// Speaker of a pipe message.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One message sent to the pipe.
#[derive(Debug, Clone, Serialize)]
pub struct Message<'a> {
    pub role: Role,
    pub content: &'a str,
}

/// Body of a non-streaming pipe run carrying a single prompt.
///
/// Every engine request is self-contained, so no thread or variables are
/// ever sent.
#[derive(Debug, Clone, Serialize)]
pub struct RunRequest<'a> {
    pub name: &'a str,
    pub messages: [Message<'a>; 1],
    pub stream: bool,
}

impl<'a> RunRequest<'a> {
    pub fn prompt(pipe: &'a str, prompt: &'a str) -> Self {
        Self {
            name: pipe,
            messages: [Message {
                role: Role::User,
                content: prompt,
            }],
            stream: false,
        }
    }
}

/// The only fields of a pipe run the engine reads.
#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(default)]
    pub completion: String,
}

/// Narrator pipe definition upserted at daemon start.
#[derive(Debug, Clone, Serialize)]
pub struct NarratorPipe<'a> {
    pub name: &'a str,
    pub description: &'static str,
    pub model: &'static str,
    pub upsert: bool,
    pub temperature: f64,
    pub max_tokens: u32,
    pub messages: [Message<'a>; 1],
}

impl<'a> NarratorPipe<'a> {
    pub fn new(name: &'a str, system_prompt: &'a str) -> Self {
        Self {
            name,
            description: "Narrator for branching role-playing sessions",
            model: "openai:gpt-4o-mini",
            upsert: true,
            temperature: 0.8,
            max_tokens: 2000,
            messages: [Message {
                role: Role::System,
                content: system_prompt,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_request_body() {
        let body = serde_json::to_value(RunRequest::prompt("narrator", "Describe the gate")).unwrap();
        assert_eq!(
            body,
            json!({
                "name": "narrator",
                "messages": [{"role": "user", "content": "Describe the gate"}],
                "stream": false
            })
        );
    }

    #[test]
    fn test_run_response_ignores_extra_fields() {
        let json = r#"{"success": true, "completion": "[]", "threadId": "t-1", "raw": {}}"#;
        let response: RunResponse = serde_json::from_str(json).unwrap();
        assert!(response.success);
        assert_eq!(response.completion, "[]");
    }

    #[test]
    fn test_run_response_missing_completion_is_empty() {
        let response: RunResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!response.success);
        assert!(response.completion.is_empty());
    }

    #[test]
    fn test_narrator_pipe_upserts_with_system_prompt() {
        let body = serde_json::to_value(NarratorPipe::new("narrator", "Tell it true.")).unwrap();
        assert_eq!(body["upsert"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Tell it true.");
    }
}
