//! Client ↔ server JSON message protocol. Each frame is a JSON object
//! with a `type` tag; field names are camelCase on the wire.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::terminal::style::StyledSegment;

/// Messages decoded from client text frames.
///
/// `AddLlmProvider`'s wire form carries a `type` field for the provider
/// type alongside the envelope's own `type` tag (both literally named
/// `type` on the wire, per the LLMProvider data model), so this can't be
/// an ordinary `#[serde(tag = "type")]` derive — the derive macro rejects
/// a variant field that shares the tag's name. `Deserialize` is
/// implemented by hand below: the first `type` key seen selects the
/// variant, and any later `type` key is treated as a normal field.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Client-side UI messages; accepted and ignored by the server.
    ConnectButtonClicked {
        address: Option<String>,
    },
    DisconnectButtonClicked,
    RequestReconnect {
        address: Option<String>,
    },
    ListSessions,
    CreateSession,
    CloseSession {
        session_id: u64,
    },
    GetHistory {
        session_id: u64,
    },
    ExecuteCommand {
        session_id: u64,
        command: String,
    },
    SendInput {
        session_id: u64,
        text: String,
    },
    Resize {
        session_id: u64,
        cols: i64,
        rows: i64,
    },
    RequestCompletion {
        session_id: u64,
        text: String,
        cursor_position: usize,
    },
    AiChat {
        session_id: u64,
        provider_id: u64,
        message: String,
    },
    ListLlmProviders,
    AddLlmProvider {
        name: String,
        provider_type: String,
        url: String,
        model: String,
        api_key: String,
    },
    UpdateLlmProvider {
        id: u64,
        name: String,
        url: String,
        model: String,
        api_key: String,
    },
    DeleteLlmProvider {
        id: u64,
    },
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ClientMessageVisitor;

        impl<'de> Visitor<'de> for ClientMessageVisitor {
            type Value = ClientMessage;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a client message object with a \"type\" field")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tag: Option<String> = None;
                let mut rest = serde_json::Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if tag.is_none() && key == "type" {
                        tag = Some(map.next_value()?);
                    } else {
                        let value: serde_json::Value = map.next_value()?;
                        rest.insert(key, value);
                    }
                }
                let tag = tag.ok_or_else(|| de::Error::missing_field("type"))?;
                let rest = serde_json::Value::Object(rest);

                macro_rules! body {
                    () => {
                        serde_json::from_value(rest).map_err(de::Error::custom)?
                    };
                }

                match tag.as_str() {
                    "connectButtonClicked" => {
                        #[derive(Deserialize)]
                        struct Body {
                            #[serde(default)]
                            address: Option<String>,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::ConnectButtonClicked { address: b.address })
                    }
                    "disconnectButtonClicked" => Ok(ClientMessage::DisconnectButtonClicked),
                    "requestReconnect" => {
                        #[derive(Deserialize)]
                        struct Body {
                            #[serde(default)]
                            address: Option<String>,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::RequestReconnect { address: b.address })
                    }
                    "listSessions" => Ok(ClientMessage::ListSessions),
                    "createSession" => Ok(ClientMessage::CreateSession),
                    "closeSession" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::CloseSession {
                            session_id: b.session_id,
                        })
                    }
                    "getHistory" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::GetHistory {
                            session_id: b.session_id,
                        })
                    }
                    "executeCommand" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                            command: String,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::ExecuteCommand {
                            session_id: b.session_id,
                            command: b.command,
                        })
                    }
                    "sendInput" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                            text: String,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::SendInput {
                            session_id: b.session_id,
                            text: b.text,
                        })
                    }
                    "resize" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                            cols: i64,
                            rows: i64,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::Resize {
                            session_id: b.session_id,
                            cols: b.cols,
                            rows: b.rows,
                        })
                    }
                    "requestCompletion" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                            text: String,
                            cursor_position: usize,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::RequestCompletion {
                            session_id: b.session_id,
                            text: b.text,
                            cursor_position: b.cursor_position,
                        })
                    }
                    "aiChat" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            session_id: u64,
                            provider_id: u64,
                            message: String,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::AiChat {
                            session_id: b.session_id,
                            provider_id: b.provider_id,
                            message: b.message,
                        })
                    }
                    "listLLMProviders" => Ok(ClientMessage::ListLlmProviders),
                    "addLLMProvider" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            name: String,
                            #[serde(rename = "type")]
                            provider_type: String,
                            url: String,
                            model: String,
                            api_key: String,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::AddLlmProvider {
                            name: b.name,
                            provider_type: b.provider_type,
                            url: b.url,
                            model: b.model,
                            api_key: b.api_key,
                        })
                    }
                    "updateLLMProvider" => {
                        #[derive(Deserialize)]
                        #[serde(rename_all = "camelCase")]
                        struct Body {
                            id: u64,
                            name: String,
                            url: String,
                            model: String,
                            api_key: String,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::UpdateLlmProvider {
                            id: b.id,
                            name: b.name,
                            url: b.url,
                            model: b.model,
                            api_key: b.api_key,
                        })
                    }
                    "deleteLLMProvider" => {
                        #[derive(Deserialize)]
                        struct Body {
                            id: u64,
                        }
                        let b: Body = body!();
                        Ok(ClientMessage::DeleteLlmProvider { id: b.id })
                    }
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["connectButtonClicked", "resize", "addLLMProvider"],
                    )),
                }
            }
        }

        deserializer.deserialize_map(ClientMessageVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    CommandFailed,
    InputFailed,
    InvalidSize,
    ResizeFailed,
    SessionNotFound,
    ProviderNotFound,
    SessionCreateFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCommand {
    pub id: u64,
    pub command: String,
    pub segments: Vec<StyledSegment>,
    pub exit_code: Option<i32>,
    pub cwd_start: String,
    pub cwd_end: String,
    pub is_finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenRowUpdate {
    pub row: usize,
    pub segments: Vec<StyledSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmProviderInfo {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub url: String,
    pub model: String,
    pub created_at: i64,
}

/// Messages the server emits to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        server_version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        home: Option<String>,
    },
    SessionsList {
        sessions: Vec<SessionInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_session_id: Option<u64>,
    },
    SessionCreated {
        session_id: u64,
    },
    SessionClosed {
        session_id: u64,
    },
    History {
        session_id: u64,
        commands: Vec<HistoryCommand>,
    },
    Output {
        segments: Vec<StyledSegment>,
    },
    CommandStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    CommandEnd {
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    PromptStart,
    PromptEnd,
    CwdUpdate {
        cwd: String,
    },
    InteractiveModeStart {
        rows: usize,
        cols: usize,
    },
    InteractiveModeEnd,
    ScreenSnapshot {
        cursor_row: usize,
        cursor_column: usize,
        lines: Vec<Vec<StyledSegment>>,
    },
    ScreenDiff {
        cursor_row: usize,
        cursor_column: usize,
        updates: Vec<ScreenRowUpdate>,
    },
    CompletionResult {
        completions: Vec<String>,
        text: String,
        cursor_position: usize,
    },
    Status {
        session_id: u64,
        running: bool,
        exit_code: i32,
    },
    InputSent {
        bytes: usize,
    },
    ResizeAck {
        cols: i64,
        rows: i64,
    },
    #[serde(rename = "llmProvidersList")]
    LlmProvidersList {
        providers: Vec<LlmProviderInfo>,
    },
    #[serde(rename = "llmProviderAdded")]
    LlmProviderAdded {
        id: u64,
    },
    #[serde(rename = "llmProviderUpdated")]
    LlmProviderUpdated {
        id: u64,
    },
    #[serde(rename = "llmProviderDeleted")]
    LlmProviderDeleted {
        id: u64,
    },
    AiChunk {
        session_id: u64,
        content: String,
    },
    AiDone {
        session_id: u64,
    },
    AiError {
        session_id: u64,
        content: String,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }
}
