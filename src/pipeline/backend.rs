use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sentinels::format_numbered_block;

use super::config::RequestProfile;

const MAX_TOKENS: u32 = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection failure or timeout.
    Transport,
    Status(u16),
    /// The reply did not carry `choices[0].message.content`.
    Malformed,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport error"),
            Self::Status(code) => write!(f, "http status {code}"),
            Self::Malformed => f.write_str("malformed response"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    #[serde(skip)]
    pub endpoint: String,
    #[serde(skip)]
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
}

impl ChatRequest {
    /// System prompt from the profile, user message = the numbered block of `texts`.
    pub fn for_batch<'a>(profile: &RequestProfile, texts: impl IntoIterator<Item = &'a str>) -> Self {
        let texts: Vec<&str> = texts.into_iter().collect();
        Self {
            endpoint: profile.base_url.clone(),
            api_key: profile.api_key.clone(),
            model: profile.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: profile.prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format_numbered_block(&texts),
                },
            ],
            temperature: profile.temperature,
            max_tokens: MAX_TOKENS,
            thinking: profile.enable_thinking.then_some(true),
        }
    }

    #[must_use]
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// A chat-completion transport. Shared by every worker thread.
pub trait TranslationBackend: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String, BackendError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` over blocking HTTP.
pub struct HttpBackend {
    agent: ureq::Agent,
}

impl HttpBackend {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl TranslationBackend for HttpBackend {
    fn complete(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let resp = self
            .agent
            .post(&request.endpoint)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", request.api_key))
            .send_json(request)
            .map_err(|err| match err {
                ureq::Error::Status(code, resp) => {
                    let body = resp.into_string().unwrap_or_default();
                    BackendError::new(BackendErrorKind::Status(code), truncate(&body, 300))
                }
                ureq::Error::Transport(t) => {
                    BackendError::new(BackendErrorKind::Transport, t.to_string())
                }
            })?;

        let body: ChatResponse = resp
            .into_json()
            .map_err(|err| BackendError::new(BackendErrorKind::Malformed, err.to_string()))?;
        reply_content(body)
    }
}

/// Trimmed `choices[0].message.content`.
fn reply_content(body: ChatResponse) -> Result<String, BackendError> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            BackendError::new(BackendErrorKind::Malformed, "missing choices[0].message.content")
        })
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use crate::pipeline::batch::tests::profile;
    use crate::pipeline::config::RequestProfile;

    use super::{
        reply_content, truncate, BackendError, BackendErrorKind, ChatRequest, ChatResponse,
        HttpBackend, TranslationBackend,
    };

    /// Accepts one connection, answers with `status` and `body`, and returns the raw request.
    fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/v1/chat/completions", listener.local_addr().expect("addr"));
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("read header") == 0 {
                    break;
                }
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().expect("content length");
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut payload = vec![0u8; content_length];
            reader.read_exact(&mut payload).expect("read body");
            request.push_str(&String::from_utf8_lossy(&payload));

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write reply");
            request
        });
        (url, handle)
    }

    fn remote_profile(url: &str) -> Arc<RequestProfile> {
        let mut p = (*profile("deepseek-chat")).clone();
        p.api_key = "sk-1".to_string();
        p.base_url = url.to_string();
        p.enable_thinking = true;
        Arc::new(p)
    }

    fn parse(body: &str) -> ChatResponse {
        serde_json::from_str(body).expect("response json")
    }

    #[test]
    fn request_body_matches_wire_format() {
        let p = profile("deepseek-chat");
        let req = ChatRequest::for_batch(&p, ["Hello", "Max 生命值"]);
        let body = serde_json::to_value(&req).expect("serialize");
        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(
            body["messages"][1]["content"],
            "1. Hello\n---SPLITTER---\n2. Max 生命值\n---SPLITTER---\n"
        );
        assert!(body.get("thinking").is_none());
        assert!(body.get("api_key").is_none());
        assert!(body.get("endpoint").is_none());
    }

    #[test]
    fn thinking_flag_is_sent_when_enabled() {
        let mut p = (*profile("m")).clone();
        p.enable_thinking = true;
        let body = serde_json::to_value(ChatRequest::for_batch(&p, ["x"])).expect("serialize");
        assert_eq!(body["thinking"], true);
    }

    #[test]
    fn error_display_names_the_kind() {
        let err = BackendError::new(BackendErrorKind::Status(429), "slow down");
        assert_eq!(err.to_string(), "http status 429: slow down");
    }

    #[test]
    fn reply_content_is_trimmed() {
        let body = parse(r#"{"choices":[{"message":{"content":"  1. 你好\n---SPLITTER---\n "}}]}"#);
        assert_eq!(reply_content(body).expect("content"), "1. 你好\n---SPLITTER---");
    }

    #[test]
    fn reply_without_choices_is_malformed() {
        let err = reply_content(parse(r#"{"choices":[]}"#)).expect_err("no choices");
        assert_eq!(err.kind, BackendErrorKind::Malformed);
        let err = reply_content(parse("{}")).expect_err("no choices field");
        assert_eq!(err.kind, BackendErrorKind::Malformed);
    }

    #[test]
    fn reply_with_null_content_is_malformed() {
        let body = parse(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#);
        assert_eq!(reply_content(body).expect_err("null").kind, BackendErrorKind::Malformed);
    }

    #[test]
    fn http_backend_posts_bearer_auth_and_reads_reply() {
        let reply = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  1. 你好\n---SPLITTER---  "}}]
        })
        .to_string();
        let (url, server) = serve_once("200 OK", reply);
        let backend = HttpBackend::new(Duration::from_secs(5));
        let request = ChatRequest::for_batch(&remote_profile(&url), ["Hello"]);

        let text = backend.complete(&request).expect("complete");
        assert_eq!(text, "1. 你好\n---SPLITTER---");

        let raw = server.join().expect("server thread");
        assert!(raw.starts_with("POST /v1/chat/completions "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-1"));
        assert!(raw.contains(r#""thinking":true"#));
        assert!(raw.contains(r#""model":"deepseek-chat""#));
    }

    #[test]
    fn http_status_errors_carry_the_code() {
        let (url, server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#.to_string());
        let backend = HttpBackend::new(Duration::from_secs(5));
        let request = ChatRequest::for_batch(&remote_profile(&url), ["Hello"]);

        let err = backend.complete(&request).expect_err("503");
        assert_eq!(err.kind, BackendErrorKind::Status(503));
        assert!(err.message.contains("busy"));
        server.join().expect("server thread");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("가나다", 2), "가나...");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
