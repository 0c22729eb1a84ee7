//! Protocol mediator: decodes inbound client messages, routes PTY output
//! through the ANSI processor and the command tracker, and emits outbound
//! protocol messages.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::ai::{AiAgent, AiEvent, ProviderConfig};
use crate::completion::CompletionProvider;
use crate::config;
use crate::output::OutputParser;
use crate::protocol::{
    ClientMessage, ErrorCode, HistoryCommand, LlmProviderInfo, ScreenRowUpdate, ServerMessage,
    SessionInfo,
};
use crate::pty::PtySession;
use crate::storage::{ServerStorage, SessionStorage};
use crate::terminal::{AnsiEvent, AnsiProcessor, Screen};
use crate::transport::{ClientId, IncomingMessage, Transport};

use super::tracker::CommandTracker;

pub const DEFAULT_ROWS: usize = 24;
pub const DEFAULT_COLS: usize = 80;

pub(crate) fn send_to<T: Transport>(
    transport: &mut T,
    client_id: ClientId,
    message: &ServerMessage,
) {
    match serde_json::to_string(message) {
        Ok(text) => transport.send(client_id, text),
        Err(e) => tracing::error!(error = %e, "failed to serialize server message"),
    }
}

pub(crate) fn broadcast<T: Transport>(transport: &mut T, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => transport.broadcast(text),
        Err(e) => tracing::error!(error = %e, "failed to serialize server message"),
    }
}

/// The output-processing half of a session: the virtual screen plus the
/// block-mode command tracker, switched by the interactive flag.
pub(crate) struct SessionPipeline {
    pub ansi: AnsiProcessor,
    pub tracker: CommandTracker,
    pub interactive: bool,
}

impl SessionPipeline {
    pub fn new(ansi: AnsiProcessor, tracker: CommandTracker) -> Self {
        Self {
            ansi,
            tracker,
            interactive: false,
        }
    }

    /// Route one chunk of PTY output: the ANSI processor always runs (it
    /// tracks mode changes and keeps the screen current); in interactive
    /// mode the screen diff is transmitted, in block mode the marker
    /// tracker segments the bytes into command events and styled output.
    pub fn handle_output<T: Transport>(&mut self, transport: &mut T, bytes: &[u8]) {
        let events = self.ansi.process(bytes);
        for event in events {
            match event {
                AnsiEvent::InteractiveModeChanged { entered: true } => {
                    tracing::info!("entered interactive mode");
                    self.interactive = true;
                    self.tracker.set_just_exited_interactive(false);
                    broadcast(
                        transport,
                        &ServerMessage::InteractiveModeStart {
                            rows: self.ansi.screen().rows(),
                            cols: self.ansi.screen().cols(),
                        },
                    );
                    let snapshot = snapshot_message(self.ansi.screen());
                    self.ansi.screen_mut().clear_dirty_rows();
                    broadcast(transport, &snapshot);
                }
                AnsiEvent::InteractiveModeChanged { entered: false } => {
                    tracing::info!("exited interactive mode");
                    broadcast(transport, &ServerMessage::InteractiveModeEnd);
                    self.interactive = false;
                    // Suppress the shell's prompt redraw until the next
                    // command-end marker
                    self.tracker.set_just_exited_interactive(true);
                }
                AnsiEvent::TitleChanged(title) => {
                    tracing::debug!(%title, "terminal title changed");
                }
                AnsiEvent::Bell => {
                    tracing::debug!("bell");
                }
            }
        }

        if self.interactive {
            self.send_screen_diff(transport);
            return;
        }

        for message in self.tracker.process(bytes) {
            broadcast(transport, &message);
        }
    }

    fn send_screen_diff<T: Transport>(&mut self, transport: &mut T) {
        let screen = self.ansi.screen();
        let dirty = screen.dirty_rows();
        if dirty.is_empty() && !screen.is_cursor_dirty() {
            return;
        }

        // a mostly-dirty screen is cheaper to resend whole
        if dirty.len() > screen.rows() / 2 {
            let snapshot = snapshot_message(screen);
            self.ansi.screen_mut().clear_dirty_rows();
            broadcast(transport, &snapshot);
            return;
        }

        let updates: Vec<ScreenRowUpdate> = dirty
            .iter()
            .map(|&row| ScreenRowUpdate {
                row,
                segments: screen.row_segments(row, true),
            })
            .collect();
        let message = ServerMessage::ScreenDiff {
            cursor_row: screen.cursor_row(),
            cursor_column: screen.cursor_col(),
            updates,
        };
        self.ansi.screen_mut().clear_dirty_rows();
        broadcast(transport, &message);
    }
}

pub(crate) fn snapshot_message(screen: &Screen) -> ServerMessage {
    ServerMessage::ScreenSnapshot {
        cursor_row: screen.cursor_row(),
        cursor_column: screen.cursor_col(),
        lines: (0..screen.rows())
            .map(|row| screen.row_segments(row, true))
            .collect(),
    }
}

pub struct SessionRuntime {
    pub id: u64,
    pub pty: PtySession,
    pub(crate) pipeline: SessionPipeline,
}

/// The server's message hub, generic over the transport and the AI
/// side-channel so tests can drive it with in-memory implementations.
pub struct ServerController<T: Transport, A: AiAgent> {
    transport: T,
    ai: A,
    storage: ServerStorage,
    data_root: PathBuf,
    run_id: u64,
    completion: CompletionProvider,
    sessions: HashMap<u64, SessionRuntime>,
}

impl<T: Transport, A: AiAgent> ServerController<T, A> {
    pub fn new(
        transport: T,
        ai: A,
        storage: ServerStorage,
        data_root: PathBuf,
        run_id: u64,
        completion: CompletionProvider,
    ) -> Self {
        Self {
            transport,
            ai,
            storage,
            data_root,
            run_id,
            completion,
            sessions: HashMap::new(),
        }
    }

    /// One iteration of the server loop: drain the transport, dispatch
    /// messages, pump every session's output, surface child exits, drain
    /// AI events.
    pub fn tick(&mut self) {
        let update = self.transport.update();

        for event in update.connection_events {
            if event.connected {
                tracing::info!(client_id = event.client_id, "client connected");
                send_to(
                    &mut self.transport,
                    event.client_id,
                    &ServerMessage::Connected {
                        server_version: env!("CARGO_PKG_VERSION").to_string(),
                        home: std::env::var("HOME").ok(),
                    },
                );
            } else {
                tracing::info!(client_id = event.client_id, "client disconnected");
            }
        }

        for message in update.incoming_messages {
            self.handle_message(message);
        }

        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(session) = self.sessions.get_mut(&id) {
                if session.pty.has_data() {
                    let bytes = session.pty.read_output();
                    if !bytes.is_empty() {
                        session.pipeline.handle_output(&mut self.transport, &bytes);
                    }
                }
                if session.pty.did_just_finish_running() {
                    let exit_code = session.pty.take_exit_code().unwrap_or(-1);
                    tracing::info!(session_id = id, exit_code, "session shell exited");
                    broadcast(
                        &mut self.transport,
                        &ServerMessage::Status {
                            session_id: id,
                            running: false,
                            exit_code,
                        },
                    );
                }
            }
        }

        for event in self.ai.update() {
            match event {
                AiEvent::Chunk {
                    session_id,
                    content,
                } => broadcast(
                    &mut self.transport,
                    &ServerMessage::AiChunk {
                        session_id,
                        content,
                    },
                ),
                AiEvent::Done {
                    session_id,
                    content,
                } => {
                    if let Err(e) = self
                        .storage
                        .save_chat_message(session_id, "assistant", &content)
                    {
                        tracing::warn!(error = %e, "failed to persist assistant message");
                    }
                    broadcast(&mut self.transport, &ServerMessage::AiDone { session_id });
                }
                AiEvent::Error {
                    session_id,
                    content,
                } => broadcast(
                    &mut self.transport,
                    &ServerMessage::AiError {
                        session_id,
                        content,
                    },
                ),
            }
        }
    }

    /// Terminate every session and record the graceful stop.
    pub fn shutdown(&mut self) {
        for (id, session) in self.sessions.iter_mut() {
            tracing::info!(session_id = id, "terminating session");
            session.pty.terminate();
        }
        self.sessions.clear();
        if let Err(e) = self.storage.record_stop(self.run_id) {
            tracing::warn!(error = %e, "failed to record server stop");
        }
    }

    fn handle_message(&mut self, incoming: IncomingMessage) {
        let client_id = incoming.client_id;
        let message: ClientMessage = match serde_json::from_str(&incoming.text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(client_id, error = %e, "malformed client message");
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(
                        ErrorCode::ParseError,
                        format!("Invalid message: {}", e),
                    ),
                );
                return;
            }
        };

        match message {
            ClientMessage::ConnectButtonClicked { .. }
            | ClientMessage::DisconnectButtonClicked
            | ClientMessage::RequestReconnect { .. } => {
                tracing::debug!(client_id, "ignoring client-side UI message");
            }
            ClientMessage::ListSessions => self.handle_list_sessions(client_id),
            ClientMessage::CreateSession => self.handle_create_session(client_id),
            ClientMessage::CloseSession { session_id } => {
                self.handle_close_session(client_id, session_id)
            }
            ClientMessage::GetHistory { session_id } => {
                self.handle_get_history(client_id, session_id)
            }
            ClientMessage::ExecuteCommand {
                session_id,
                command,
            } => self.handle_execute_command(client_id, session_id, command),
            ClientMessage::SendInput { session_id, text } => {
                self.handle_send_input(client_id, session_id, text)
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => self.handle_resize(client_id, session_id, cols, rows),
            ClientMessage::RequestCompletion {
                session_id,
                text,
                cursor_position,
            } => self.handle_completion(client_id, session_id, text, cursor_position),
            ClientMessage::AiChat {
                session_id,
                provider_id,
                message,
            } => self.handle_ai_chat(client_id, session_id, provider_id, message),
            ClientMessage::ListLlmProviders => self.handle_list_providers(client_id),
            ClientMessage::AddLlmProvider {
                name,
                provider_type,
                url,
                model,
                api_key,
            } => {
                match self
                    .storage
                    .add_llm_provider(&name, &provider_type, &url, &model, &api_key)
                {
                    Ok(id) => {
                        tracing::info!(id, %name, "added llm provider");
                        send_to(
                            &mut self.transport,
                            client_id,
                            &ServerMessage::LlmProviderAdded { id },
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to add llm provider"),
                }
            }
            ClientMessage::UpdateLlmProvider {
                id,
                name,
                url,
                model,
                api_key,
            } => {
                if let Err(e) = self
                    .storage
                    .update_llm_provider(id, &name, &url, &model, &api_key)
                {
                    tracing::warn!(error = %e, "failed to update llm provider");
                }
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::LlmProviderUpdated { id },
                );
            }
            ClientMessage::DeleteLlmProvider { id } => {
                if let Err(e) = self.storage.delete_llm_provider(id) {
                    tracing::warn!(error = %e, "failed to delete llm provider");
                }
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::LlmProviderDeleted { id },
                );
            }
        }
    }

    fn session_not_found(&mut self, client_id: ClientId, session_id: u64) {
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::error(
                ErrorCode::SessionNotFound,
                format!("Session {} not found", session_id),
            ),
        );
    }

    /// Lazy materialization: a session known to the server store but not
    /// in memory gets a fresh shell; its history lives in session storage.
    fn ensure_session(&mut self, session_id: u64) -> bool {
        if self.sessions.contains_key(&session_id) {
            return true;
        }
        match self.storage.is_active_terminal_session(session_id) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "session lookup failed");
                return false;
            }
        }
        match self.spawn_runtime(session_id) {
            Ok(runtime) => {
                tracing::info!(session_id, "lazily materialized session");
                self.sessions.insert(session_id, runtime);
                true
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to materialize session");
                false
            }
        }
    }

    fn spawn_runtime(&self, session_id: u64) -> anyhow::Result<SessionRuntime> {
        let pty = PtySession::spawn(session_id, DEFAULT_ROWS as u16, DEFAULT_COLS as u16)?;
        let storage = SessionStorage::open(&config::session_db_path(&self.data_root, session_id))?;
        Ok(SessionRuntime {
            id: session_id,
            pty,
            pipeline: SessionPipeline::new(
                AnsiProcessor::new(DEFAULT_ROWS, DEFAULT_COLS),
                CommandTracker::new(storage, self.run_id),
            ),
        })
    }

    fn handle_list_sessions(&mut self, client_id: ClientId) {
        let sessions = match self.storage.get_active_terminal_sessions() {
            Ok(rows) => rows
                .into_iter()
                .map(|row| SessionInfo {
                    id: row.id,
                    created_at: row.created_at,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list sessions");
                Vec::new()
            }
        };
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::SessionsList {
                sessions,
                active_session_id: None,
            },
        );
    }

    fn handle_create_session(&mut self, client_id: ClientId) {
        let session_id = match self.storage.create_terminal_session(self.run_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "failed to record new session");
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(
                        ErrorCode::SessionCreateFailed,
                        "Failed to create terminal session",
                    ),
                );
                return;
            }
        };
        match self.spawn_runtime(session_id) {
            Ok(runtime) => {
                self.sessions.insert(session_id, runtime);
                tracing::info!(session_id, client_id, "created session");
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::SessionCreated { session_id },
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn session");
                let _ = self.storage.mark_terminal_session_as_deleted(session_id);
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(
                        ErrorCode::SessionCreateFailed,
                        "Failed to create terminal session",
                    ),
                );
            }
        }
    }

    fn handle_close_session(&mut self, client_id: ClientId, session_id: u64) {
        let known = self.sessions.contains_key(&session_id)
            || matches!(self.storage.is_active_terminal_session(session_id), Ok(true));
        if !known {
            self.session_not_found(client_id, session_id);
            return;
        }

        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.pty.terminate();
        }
        if let Err(e) = self.storage.mark_terminal_session_as_deleted(session_id) {
            tracing::warn!(error = %e, "failed to mark session deleted");
        }
        tracing::info!(session_id, client_id, "closed session");
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::SessionClosed { session_id },
        );
    }

    fn handle_execute_command(&mut self, client_id: ClientId, session_id: u64, command: String) {
        if !self.ensure_session(session_id) {
            self.session_not_found(client_id, session_id);
            return;
        }
        let session = self.sessions.get_mut(&session_id).expect("session present");
        session.pipeline.tracker.set_pending_command(&command);
        match session.pty.execute_command(&command) {
            Ok(_) => {
                tracing::info!(session_id, %command, "executed command");
            }
            Err(e) => {
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(
                        ErrorCode::CommandFailed,
                        format!("Failed to execute command *{}*: {}", command, e),
                    ),
                );
            }
        }
    }

    fn handle_send_input(&mut self, client_id: ClientId, session_id: u64, text: String) {
        if !self.ensure_session(session_id) {
            self.session_not_found(client_id, session_id);
            return;
        }
        let session = self.sessions.get_mut(&session_id).expect("session present");
        match session.pty.send_input(text.as_bytes()) {
            Ok(bytes) => send_to(
                &mut self.transport,
                client_id,
                &ServerMessage::InputSent { bytes },
            ),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "input write failed");
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(ErrorCode::InputFailed, "Failed to send input"),
                );
            }
        }
    }

    fn handle_resize(&mut self, client_id: ClientId, session_id: u64, cols: i64, rows: i64) {
        if cols <= 0 || rows <= 0 {
            send_to(
                &mut self.transport,
                client_id,
                &ServerMessage::error(ErrorCode::InvalidSize, "Invalid terminal size"),
            );
            return;
        }
        if !self.ensure_session(session_id) {
            self.session_not_found(client_id, session_id);
            return;
        }
        let session = self.sessions.get_mut(&session_id).expect("session present");
        session.pipeline.ansi.resize(rows as usize, cols as usize);
        match session.pty.set_window_size(cols as u16, rows as u16) {
            Ok(()) => send_to(
                &mut self.transport,
                client_id,
                &ServerMessage::ResizeAck { cols, rows },
            ),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "resize ioctl failed");
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(ErrorCode::ResizeFailed, "Failed to set terminal size"),
                );
            }
        }
    }

    fn handle_completion(
        &mut self,
        client_id: ClientId,
        session_id: u64,
        text: String,
        cursor_position: usize,
    ) {
        let mut cwd = String::new();
        if self.ensure_session(session_id) {
            let session = self.sessions.get_mut(&session_id).expect("session present");
            cwd = session.pipeline.tracker.last_known_cwd().to_string();
            if cwd.is_empty() {
                cwd = session.pty.current_working_directory().unwrap_or_default();
            }
        }
        if cwd.is_empty() {
            cwd = ".".to_string();
        }

        let completions = self.completion.get_completions(&text, cursor_position, &cwd);
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::CompletionResult {
                completions,
                text,
                cursor_position,
            },
        );
    }

    fn handle_get_history(&mut self, client_id: ClientId, session_id: u64) {
        if !self.ensure_session(session_id) {
            self.session_not_found(client_id, session_id);
            return;
        }
        let session = self.sessions.get_mut(&session_id).expect("session present");

        let records = match session.pipeline.tracker.storage().get_all_commands() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read command history");
                Vec::new()
            }
        };
        let commands = records
            .into_iter()
            .map(|record| {
                let mut parser = OutputParser::new();
                HistoryCommand {
                    id: record.id,
                    command: record.command,
                    segments: parser.parse(&record.output),
                    exit_code: record.exit_code,
                    cwd_start: record.cwd_start,
                    cwd_end: record.cwd_end,
                    is_finished: record.is_finished,
                }
            })
            .collect();
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::History {
                session_id,
                commands,
            },
        );
        tracing::info!(session_id, client_id, "sent history");

        // Late joiners need the live screen if a TUI currently owns the
        // terminal.
        if session.pipeline.interactive {
            send_to(
                &mut self.transport,
                client_id,
                &ServerMessage::InteractiveModeStart {
                    rows: session.pipeline.ansi.screen().rows(),
                    cols: session.pipeline.ansi.screen().cols(),
                },
            );
            let snapshot = snapshot_message(session.pipeline.ansi.screen());
            send_to(&mut self.transport, client_id, &snapshot);
        }
    }

    fn handle_ai_chat(
        &mut self,
        client_id: ClientId,
        session_id: u64,
        provider_id: u64,
        message: String,
    ) {
        let provider = match self.storage.get_llm_provider(provider_id) {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                send_to(
                    &mut self.transport,
                    client_id,
                    &ServerMessage::error(
                        ErrorCode::ProviderNotFound,
                        format!("LLM provider {} not found", provider_id),
                    ),
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "provider lookup failed");
                return;
            }
        };

        if let Err(e) = self.storage.save_chat_message(session_id, "user", &message) {
            tracing::warn!(error = %e, "failed to persist user message");
        }
        self.ai.send_message(
            session_id,
            ProviderConfig {
                url: provider.url,
                model: provider.model,
                api_key: provider.api_key,
            },
            message,
        );
    }

    #[cfg(test)]
    pub(crate) fn handle_message_for_test(&mut self, client_id: ClientId, text: &str) {
        self.handle_message(IncomingMessage {
            client_id,
            text: text.to_string(),
        });
    }

    fn handle_list_providers(&mut self, client_id: ClientId) {
        let providers = match self.storage.get_all_llm_providers() {
            Ok(providers) => providers
                .into_iter()
                .map(|p| LlmProviderInfo {
                    id: p.id,
                    name: p.name,
                    provider_type: p.provider_type,
                    url: p.url,
                    model: p.model,
                    created_at: p.created_at,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list providers");
                Vec::new()
            }
        };
        send_to(
            &mut self.transport,
            client_id,
            &ServerMessage::LlmProvidersList { providers },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::ai::{AiAgent, AiEvent, ProviderConfig};
    use crate::transport::TransportUpdate;

    type Sent = Arc<Mutex<Vec<(ClientId, serde_json::Value)>>>;

    struct MockTransport {
        sent: Sent,
    }

    impl MockTransport {
        fn new() -> (Self, Sent) {
            let sent: Sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    sent: Arc::clone(&sent),
                },
                sent,
            )
        }
    }

    impl Transport for MockTransport {
        fn update(&mut self) -> TransportUpdate {
            TransportUpdate::default()
        }

        fn send(&mut self, client_id: ClientId, message: String) {
            self.sent
                .lock()
                .push((client_id, serde_json::from_str(&message).unwrap()));
        }

        fn broadcast(&mut self, message: String) {
            self.sent
                .lock()
                .push((0, serde_json::from_str(&message).unwrap()));
        }
    }

    struct MockAiAgent {
        requests: Vec<(u64, ProviderConfig, String)>,
        queued: Vec<AiEvent>,
    }

    impl MockAiAgent {
        fn new() -> Self {
            Self {
                requests: Vec::new(),
                queued: Vec::new(),
            }
        }
    }

    impl AiAgent for MockAiAgent {
        fn send_message(&mut self, session_id: u64, provider: ProviderConfig, message: String) {
            self.requests.push((session_id, provider, message));
        }

        fn update(&mut self) -> Vec<AiEvent> {
            std::mem::take(&mut self.queued)
        }
    }

    fn pipeline() -> SessionPipeline {
        SessionPipeline::new(
            AnsiProcessor::new(DEFAULT_ROWS, DEFAULT_COLS),
            CommandTracker::new(
                crate::storage::SessionStorage::open_in_memory().unwrap(),
                1,
            ),
        )
    }

    fn types(sent: &Sent) -> Vec<String> {
        sent.lock()
            .iter()
            .map(|(_, value)| value["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn block_mode_command_flows_to_the_wire() {
        let (mut transport, sent) = MockTransport::new();
        let mut pipeline = pipeline();
        pipeline.tracker.set_pending_command("echo hello");

        pipeline.handle_output(
            &mut transport,
            b"\x1B]133;A;cwd=/home/u\x07hello\n\x1B]133;B;exit=0;cwd=/home/u\x07",
        );

        assert_eq!(types(&sent), vec!["commandStart", "output", "commandEnd"]);
        let sent = sent.lock();
        assert_eq!(sent[0].1["cwd"], "/home/u");
        assert_eq!(sent[1].1["segments"][0]["text"], "hello\n");
        assert_eq!(sent[2].1["exitCode"], 0);
    }

    #[test]
    fn tui_enter_and_leave_scenario() {
        let (mut transport, sent) = MockTransport::new();
        let mut pipeline = pipeline();
        pipeline.tracker.set_pending_command("vim");

        pipeline.handle_output(&mut transport, b"\x1B]133;A;cwd=/tmp\x07");
        pipeline.handle_output(&mut transport, b"\x1B[?1049h");
        pipeline.handle_output(&mut transport, b"hello");
        pipeline.handle_output(&mut transport, b"\x1B[?1049l");
        // prompt redraw is suppressed until the command-end marker
        pipeline.handle_output(&mut transport, b"\r$ \x1B]133;B;exit=0;cwd=/tmp\x07");

        assert_eq!(
            types(&sent),
            vec![
                "commandStart",
                "interactiveModeStart",
                "screenSnapshot",
                "screenDiff",
                "interactiveModeEnd",
                "commandEnd",
            ]
        );

        let sent = sent.lock();
        let snapshot = &sent[2].1;
        assert_eq!(snapshot["cursorRow"], 0);
        assert_eq!(snapshot["cursorColumn"], 0);
        assert_eq!(snapshot["lines"].as_array().unwrap().len(), DEFAULT_ROWS);

        let diff = &sent[3].1;
        assert_eq!(diff["cursorRow"], 0);
        assert_eq!(diff["cursorColumn"], 5);
        let updates = diff["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["row"], 0);
        assert_eq!(updates[0]["segments"][0]["text"], "hello");

        let end = &sent[5].1;
        assert_eq!(end["exitCode"], 0);
        assert_eq!(end["cwd"], "/tmp");
    }

    #[test]
    fn quiet_interactive_ticks_transmit_nothing() {
        let (mut transport, sent) = MockTransport::new();
        let mut pipeline = pipeline();
        pipeline.handle_output(&mut transport, b"\x1B[?1049hx");
        let before = sent.lock().len();

        // bytes that change nothing visible: cursor to where it already is
        pipeline.handle_output(&mut transport, b"");
        assert_eq!(sent.lock().len(), before);
    }

    #[test]
    fn mostly_dirty_screen_resends_a_snapshot() {
        let (mut transport, sent) = MockTransport::new();
        let mut pipeline = SessionPipeline::new(
            AnsiProcessor::new(4, 10),
            CommandTracker::new(
                crate::storage::SessionStorage::open_in_memory().unwrap(),
                1,
            ),
        );
        pipeline.handle_output(&mut transport, b"\x1B[?1049h");
        sent.lock().clear();

        pipeline.handle_output(&mut transport, b"one\r\ntwo\r\nthree");
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["type"], "screenSnapshot");
        let lines = sent[0].1["lines"].as_array().unwrap();
        assert_eq!(lines[0][0]["text"], "one");
        assert_eq!(lines[1][0]["text"], "two");
        assert_eq!(lines[2][0]["text"], "three");
    }

    fn controller() -> (
        ServerController<MockTransport, MockAiAgent>,
        Sent,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (transport, sent) = MockTransport::new();
        let storage = ServerStorage::open_in_memory().unwrap();
        let run_id = storage.record_start().unwrap();
        let controller = ServerController::new(
            transport,
            MockAiAgent::new(),
            storage,
            dir.path().to_path_buf(),
            run_id,
            CompletionProvider::with_commands(["ls".to_string()]),
        );
        (controller, sent, dir)
    }

    #[test]
    fn malformed_messages_get_parse_errors() {
        let (mut controller, sent, _dir) = controller();
        controller.handle_message_for_test(7, "not json");
        controller.handle_message_for_test(7, r#"{"type":"unknownThing"}"#);
        controller.handle_message_for_test(7, r#"{"type":"resize","sessionId":1}"#);

        let sent = sent.lock();
        assert_eq!(sent.len(), 3);
        for (client_id, value) in sent.iter() {
            assert_eq!(*client_id, 7);
            assert_eq!(value["type"], "error");
            assert_eq!(value["code"], "PARSE_ERROR");
        }
    }

    #[test]
    fn unknown_session_ids_are_rejected() {
        let (mut controller, sent, _dir) = controller();
        controller
            .handle_message_for_test(1, r#"{"type":"executeCommand","sessionId":99,"command":"ls"}"#);
        controller.handle_message_for_test(1, r#"{"type":"getHistory","sessionId":99}"#);
        controller.handle_message_for_test(1, r#"{"type":"closeSession","sessionId":99}"#);

        let sent = sent.lock();
        assert_eq!(sent.len(), 3);
        for (_, value) in sent.iter() {
            assert_eq!(value["code"], "SESSION_NOT_FOUND");
            assert_eq!(value["message"], "Session 99 not found");
        }
    }

    #[test]
    fn deleted_sessions_stay_unreachable() {
        let (mut controller, sent, _dir) = controller();
        let session_id = controller
            .storage
            .create_terminal_session(controller.run_id)
            .unwrap();
        controller
            .storage
            .mark_terminal_session_as_deleted(session_id)
            .unwrap();

        controller.handle_message_for_test(
            1,
            &format!(r#"{{"type":"sendInput","sessionId":{},"text":"x"}}"#, session_id),
        );
        assert_eq!(sent.lock()[0].1["code"], "SESSION_NOT_FOUND");
    }

    #[test]
    fn invalid_resize_is_rejected_before_session_lookup() {
        let (mut controller, sent, _dir) = controller();
        controller
            .handle_message_for_test(1, r#"{"type":"resize","sessionId":1,"cols":0,"rows":10}"#);
        assert_eq!(sent.lock()[0].1["code"], "INVALID_SIZE");
    }

    #[test]
    fn llm_provider_crud_round_trip() {
        let (mut controller, sent, _dir) = controller();
        controller.handle_message_for_test(
            2,
            r#"{"type":"addLLMProvider","name":"local","type":"openai","url":"http://h","model":"m","apiKey":"k"}"#,
        );
        {
            let sent = sent.lock();
            assert_eq!(sent[0].1["type"], "llmProviderAdded");
        }
        let id = sent.lock()[0].1["id"].as_u64().unwrap();

        controller.handle_message_for_test(2, r#"{"type":"listLLMProviders"}"#);
        {
            let sent = sent.lock();
            let list = &sent[1].1;
            assert_eq!(list["type"], "llmProvidersList");
            assert_eq!(list["providers"][0]["name"], "local");
            assert_eq!(list["providers"][0]["type"], "openai");
        }

        controller.handle_message_for_test(
            2,
            &format!(
                r#"{{"type":"updateLLMProvider","id":{},"name":"n2","url":"u2","model":"m2","apiKey":"k2"}}"#,
                id
            ),
        );
        controller
            .handle_message_for_test(2, &format!(r#"{{"type":"deleteLLMProvider","id":{}}}"#, id));
        let sent = sent.lock();
        assert_eq!(sent[2].1["type"], "llmProviderUpdated");
        assert_eq!(sent[3].1["type"], "llmProviderDeleted");
    }

    #[test]
    fn ai_chat_requires_a_known_provider() {
        let (mut controller, sent, _dir) = controller();
        controller.handle_message_for_test(
            3,
            r#"{"type":"aiChat","sessionId":1,"providerId":42,"message":"hi"}"#,
        );
        let value = &sent.lock()[0].1;
        assert_eq!(value["code"], "PROVIDER_NOT_FOUND");
        assert_eq!(value["message"], "LLM provider 42 not found");
    }

    #[test]
    fn ai_chat_dispatches_to_the_agent_and_persists() {
        let (mut controller, sent, _dir) = controller();
        let id = controller
            .storage
            .add_llm_provider("p", "openai", "http://h", "m", "k")
            .unwrap();
        controller.handle_message_for_test(
            3,
            &format!(
                r#"{{"type":"aiChat","sessionId":9,"providerId":{},"message":"help"}}"#,
                id
            ),
        );

        assert!(sent.lock().is_empty());
        assert_eq!(controller.ai.requests.len(), 1);
        let (session_id, provider, message) = &controller.ai.requests[0];
        assert_eq!(*session_id, 9);
        assert_eq!(provider.url, "http://h");
        assert_eq!(message, "help");

        let history = controller.storage.get_chat_history(9).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");

        // streamed completion lands back on the wire and in storage
        controller.ai.queued = vec![
            AiEvent::Chunk {
                session_id: 9,
                content: "an".to_string(),
            },
            AiEvent::Done {
                session_id: 9,
                content: "answer".to_string(),
            },
        ];
        controller.tick();
        let sent = sent.lock();
        assert_eq!(sent[0].1["type"], "aiChunk");
        assert_eq!(sent[1].1["type"], "aiDone");
        assert!(sent[1].1.get("content").is_none());
        let history = controller.storage.get_chat_history(9).unwrap();
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].content, "answer");
    }

    #[test]
    fn list_sessions_reports_active_rows() {
        let (mut controller, sent, _dir) = controller();
        let a = controller
            .storage
            .create_terminal_session(controller.run_id)
            .unwrap();
        let b = controller
            .storage
            .create_terminal_session(controller.run_id)
            .unwrap();
        controller.storage.mark_terminal_session_as_deleted(b).unwrap();

        controller.handle_message_for_test(4, r#"{"type":"listSessions"}"#);
        let sent = sent.lock();
        let value = &sent[0].1;
        assert_eq!(value["type"], "sessionsList");
        let sessions = value["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"].as_u64().unwrap(), a);
        assert!(sessions[0]["createdAt"].is_number());
    }

    #[test]
    fn ui_only_messages_are_ignored() {
        let (mut controller, sent, _dir) = controller();
        controller.handle_message_for_test(1, r#"{"type":"connectButtonClicked"}"#);
        controller.handle_message_for_test(1, r#"{"type":"disconnectButtonClicked"}"#);
        controller.handle_message_for_test(1, r#"{"type":"requestReconnect","address":"x"}"#);
        assert!(sent.lock().is_empty());
    }
}
