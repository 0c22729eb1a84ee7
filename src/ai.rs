//! LLM chat side-channel.
//!
//! Chat requests stream from an OpenAI-compatible endpoint on their own
//! threads; the tick loop drains the resulting events each update. The
//! agent keeps per-session chat history in memory so follow-up messages
//! carry context.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::queue::ThreadSafeQueue;

const SYSTEM_PROMPT: &str = "You are a helpful terminal assistant. Help the user with their \
    questions about command line, programming, and system administration. Be concise and practical.";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider settings resolved from storage per request.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    Chunk { session_id: u64, content: String },
    /// Stream finished; `content` is the full assistant reply, kept for
    /// history and persistence (not sent on the wire).
    Done { session_id: u64, content: String },
    Error { session_id: u64, content: String },
}

/// The mediator's view of the AI side-channel.
pub trait AiAgent {
    fn send_message(&mut self, session_id: u64, provider: ProviderConfig, message: String);
    fn update(&mut self) -> Vec<AiEvent>;
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    role: &'static str,
    content: String,
}

pub struct HttpAiAgent {
    events: Arc<ThreadSafeQueue<AiEvent>>,
    history: HashMap<u64, Vec<HistoryEntry>>,
}

impl HttpAiAgent {
    pub fn new() -> Self {
        Self {
            events: Arc::new(ThreadSafeQueue::new()),
            history: HashMap::new(),
        }
    }

    fn build_request_body(&self, session_id: u64, message: &str, model: &str) -> serde_json::Value {
        let mut messages = vec![json!({"role": "system", "content": SYSTEM_PROMPT})];
        if let Some(entries) = self.history.get(&session_id) {
            for entry in entries {
                messages.push(json!({"role": entry.role, "content": entry.content}));
            }
        }
        messages.push(json!({"role": "user", "content": message}));

        let mut body = json!({"messages": messages, "stream": true});
        if !model.is_empty() {
            body["model"] = json!(model);
        }
        body
    }
}

impl Default for HttpAiAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl AiAgent for HttpAiAgent {
    fn send_message(&mut self, session_id: u64, provider: ProviderConfig, message: String) {
        let body = self.build_request_body(session_id, &message, &provider.model);
        self.history
            .entry(session_id)
            .or_default()
            .push(HistoryEntry {
                role: "user",
                content: message,
            });

        let events = Arc::clone(&self.events);
        let url = format!("{}/v1/chat/completions", provider.url);
        tracing::info!(session_id, %url, model = %provider.model, "starting ai chat request");

        std::thread::Builder::new()
            .name(format!("ai-chat-{}", session_id))
            .spawn(move || {
                if let Err(error) = stream_chat(session_id, &url, &provider.api_key, body, &events)
                {
                    tracing::warn!(session_id, %error, "ai chat request failed");
                    events.push(AiEvent::Error {
                        session_id,
                        content: error,
                    });
                }
            })
            .expect("failed to spawn ai chat thread");
    }

    fn update(&mut self) -> Vec<AiEvent> {
        let events = self.events.take_all();
        for event in &events {
            if let AiEvent::Done {
                session_id,
                content,
            } = event
            {
                self.history
                    .entry(*session_id)
                    .or_default()
                    .push(HistoryEntry {
                        role: "assistant",
                        content: content.clone(),
                    });
            }
        }
        events
    }
}

/// POST the request and forward SSE chunks until `[DONE]` or EOF.
fn stream_chat(
    session_id: u64,
    url: &str,
    api_key: &str,
    body: serde_json::Value,
    events: &ThreadSafeQueue<AiEvent>,
) -> Result<(), String> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;

    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream")
        .json(&body);
    if !api_key.is_empty() {
        request = request.bearer_auth(api_key);
    }

    let response = request.send().map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("provider returned HTTP {}", response.status()));
    }

    let reader = BufReader::new(response);
    let mut accumulated = String::new();
    for line in reader.lines() {
        let line = line.map_err(|e| e.to_string())?;
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }
        let Ok(chunk) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
            accumulated.push_str(content);
            events.push(AiEvent::Chunk {
                session_id,
                content: content.to_string(),
            });
        }
    }

    events.push(AiEvent::Done {
        session_id,
        content: accumulated,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_system_prompt_and_history() {
        let mut agent = HttpAiAgent::new();
        agent.history.insert(
            5,
            vec![
                HistoryEntry {
                    role: "user",
                    content: "earlier".to_string(),
                },
                HistoryEntry {
                    role: "assistant",
                    content: "reply".to_string(),
                },
            ],
        );
        let body = agent.build_request_body(5, "now", "llama");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "earlier");
        assert_eq!(messages[3], json!({"role": "user", "content": "now"}));
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "llama");
    }

    #[test]
    fn empty_model_is_omitted() {
        let agent = HttpAiAgent::new();
        let body = agent.build_request_body(1, "hi", "");
        assert!(body.get("model").is_none());
    }

    #[test]
    fn done_event_records_assistant_history() {
        let mut agent = HttpAiAgent::new();
        agent.events.push(AiEvent::Chunk {
            session_id: 2,
            content: "he".to_string(),
        });
        agent.events.push(AiEvent::Done {
            session_id: 2,
            content: "hello".to_string(),
        });

        let events = agent.update();
        assert_eq!(events.len(), 2);
        let history = agent.history.get(&2).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "assistant");
        assert_eq!(history[0].content, "hello");
    }
}
