//! Per-session command tracking for block mode.
//!
//! Consumes scanned marker/text items and drives the session's command
//! state machine: `executeCommand` arms a pending command, the shell's
//! `133;A` marker turns it into a durable record, interstitial output is
//! appended to that record, `133;B` finishes it. After a TUI exits, the
//! redrawn prompt would be recorded as command output; the
//! just-exited-interactive flag drops everything until the next `133;B`.

use crate::markers::{self, Marker, ScanItem};
use crate::output::OutputParser;
use crate::protocol::ServerMessage;
use crate::storage::SessionStorage;

pub struct CommandTracker {
    storage: SessionStorage,
    server_run_id: u64,
    pending_command: String,
    current_command_id: u64,
    last_known_cwd: String,
    just_exited_interactive: bool,
    /// Styles carry across chunk boundaries within a stream of output.
    stream_parser: OutputParser,
    /// Separate style state for the per-line replay store.
    line_parser: OutputParser,
    line_buffer: Vec<u8>,
}

impl CommandTracker {
    pub fn new(storage: SessionStorage, server_run_id: u64) -> Self {
        // A rematerialized session resumes in the directory its last
        // finished command ended in.
        let last_known_cwd = storage.get_last_cwd().ok().flatten().unwrap_or_default();
        Self {
            storage,
            server_run_id,
            pending_command: String::new(),
            current_command_id: 0,
            last_known_cwd,
            just_exited_interactive: false,
            stream_parser: OutputParser::new(),
            line_parser: OutputParser::new(),
            line_buffer: Vec::new(),
        }
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// The command text sent to the shell but not yet acknowledged by a
    /// start marker.
    pub fn set_pending_command(&mut self, command: &str) {
        self.pending_command = command.to_string();
    }

    pub fn has_active_command(&self) -> bool {
        self.current_command_id > 0
    }

    pub fn last_known_cwd(&self) -> &str {
        &self.last_known_cwd
    }

    pub fn just_exited_interactive(&self) -> bool {
        self.just_exited_interactive
    }

    pub fn set_just_exited_interactive(&mut self, value: bool) {
        self.just_exited_interactive = value;
    }

    /// Process one chunk of block-mode output. Returns the protocol
    /// messages to emit, in stream order.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<ServerMessage> {
        let mut messages = Vec::new();

        for item in markers::scan(bytes) {
            match item {
                ScanItem::Text(text) => {
                    if self.just_exited_interactive {
                        tracing::debug!(
                            bytes = text.len(),
                            "dropping output after interactive exit"
                        );
                        continue;
                    }
                    self.record_output(text);
                    messages.push(ServerMessage::Output {
                        segments: self.stream_parser.parse(text),
                    });
                }
                ScanItem::Marker(Marker::CommandStart { cwd }) => {
                    if let Some(path) = &cwd {
                        self.last_known_cwd = path.clone();
                    }
                    if !self.pending_command.is_empty() {
                        self.start_command(cwd.as_deref().unwrap_or(""));
                        messages.push(ServerMessage::CommandStart { cwd });
                    }
                    // no pending command: this is the shell's first prompt
                }
                ScanItem::Marker(Marker::CommandEnd { exit_code, cwd }) => {
                    if let Some(path) = &cwd {
                        self.last_known_cwd = path.clone();
                    }
                    if self.has_active_command() {
                        self.finish_command(exit_code, cwd.as_deref().unwrap_or(""));
                        messages.push(ServerMessage::CommandEnd { exit_code, cwd });
                    }
                    if self.just_exited_interactive {
                        tracing::debug!("command end clears interactive-exit suppression");
                        self.just_exited_interactive = false;
                    }
                }
                ScanItem::Marker(Marker::PromptStart) => {
                    messages.push(ServerMessage::PromptStart);
                }
                ScanItem::Marker(Marker::PromptEnd) => {
                    messages.push(ServerMessage::PromptEnd);
                }
                ScanItem::Marker(Marker::CwdUpdate { cwd }) => {
                    self.last_known_cwd = cwd.clone();
                    messages.push(ServerMessage::CwdUpdate { cwd });
                }
            }
        }

        messages
    }

    fn start_command(&mut self, cwd: &str) {
        match self
            .storage
            .add_command(self.server_run_id, &self.pending_command, cwd)
        {
            Ok(id) => {
                tracing::info!(command_id = id, command = %self.pending_command, "command started");
                self.current_command_id = id;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to store command start");
            }
        }
        self.pending_command.clear();
        self.line_buffer.clear();
        self.line_parser.reset();
    }

    fn finish_command(&mut self, exit_code: i32, cwd: &str) {
        self.flush_partial_line();
        if let Err(e) = self
            .storage
            .finish_command(self.current_command_id, exit_code, cwd)
        {
            tracing::warn!(error = %e, "failed to store command end");
        }
        tracing::info!(
            command_id = self.current_command_id,
            exit_code,
            "command finished"
        );
        self.current_command_id = 0;
    }

    /// Append raw output to the active record and spill completed lines
    /// into the pre-parsed replay store.
    fn record_output(&mut self, text: &[u8]) {
        if !self.has_active_command() {
            return;
        }
        if let Err(e) = self.storage.append_output(self.current_command_id, text) {
            tracing::warn!(error = %e, "failed to append command output");
        }

        self.line_buffer.extend_from_slice(text);
        while let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.store_line(&line);
        }
    }

    fn flush_partial_line(&mut self) {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.store_line(&line);
        }
    }

    fn store_line(&mut self, line: &[u8]) {
        let segments = self.line_parser.parse(line);
        match serde_json::to_string(&segments) {
            Ok(json) => {
                if let Err(e) = self.storage.add_output_line(self.current_command_id, &json) {
                    tracing::warn!(error = %e, "failed to store output line");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize output line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionStorage;

    fn tracker() -> CommandTracker {
        CommandTracker::new(SessionStorage::open_in_memory().unwrap(), 1)
    }

    fn message_types(messages: &[ServerMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| {
                serde_json::to_value(m).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn simple_command_lifecycle() {
        let mut tracker = tracker();
        tracker.set_pending_command("echo hello");

        let messages = tracker
            .process(b"\x1B]133;A;cwd=/home/u\x07hello\n\x1B]133;B;exit=0;cwd=/home/u\x07");

        assert_eq!(
            message_types(&messages),
            vec!["commandStart", "output", "commandEnd"]
        );
        match &messages[1] {
            ServerMessage::Output { segments } => {
                assert_eq!(segments.len(), 1);
                assert_eq!(segments[0].text, "hello\n");
                assert!(segments[0].style.is_default());
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match &messages[2] {
            ServerMessage::CommandEnd { exit_code, cwd } => {
                assert_eq!(*exit_code, 0);
                assert_eq!(cwd.as_deref(), Some("/home/u"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let records = tracker.storage().get_all_commands().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, "echo hello");
        assert_eq!(records[0].output, b"hello\n");
        assert_eq!(records[0].exit_code, Some(0));
        assert!(records[0].is_finished);
        assert_eq!(records[0].cwd_start, "/home/u");
        assert_eq!(records[0].cwd_end, "/home/u");
        assert_eq!(tracker.last_known_cwd(), "/home/u");
        assert!(!tracker.has_active_command());
    }

    #[test]
    fn sequential_commands_segment_into_separate_records() {
        let mut tracker = tracker();

        tracker.set_pending_command("true");
        tracker.process(b"\x1B]133;A;cwd=/a\x07\x1B]133;B;exit=0;cwd=/a\x07");
        tracker.set_pending_command("false");
        tracker.process(b"\x1B]133;A;cwd=/a\x07\x1B]133;B;exit=1;cwd=/a\x07");
        tracker.set_pending_command("ls");
        tracker.process(b"\x1B]133;A;cwd=/a\x07files\n\x1B]133;B;exit=0;cwd=/b\x07");

        let records = tracker.storage().get_all_commands().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_finished));
        assert_eq!(records[0].command, "true");
        assert_eq!(records[0].exit_code, Some(0));
        assert_eq!(records[1].command, "false");
        assert_eq!(records[1].exit_code, Some(1));
        assert_eq!(records[2].command, "ls");
        assert_eq!(records[2].output, b"files\n");
        assert_eq!(records[2].cwd_end, "/b");
        assert!(records[0].id < records[1].id && records[1].id < records[2].id);
    }

    #[test]
    fn first_prompt_without_pending_command_is_ignored() {
        let mut tracker = tracker();
        let messages = tracker.process(b"\x1B]133;A;cwd=/home/u\x07");
        assert!(messages.is_empty());
        assert!(tracker.storage().get_all_commands().unwrap().is_empty());
        assert_eq!(tracker.last_known_cwd(), "/home/u");
    }

    #[test]
    fn output_order_survives_chunking() {
        let mut tracker = tracker();
        tracker.set_pending_command("seq 2");
        let full: Vec<u8> =
            b"\x1B]133;A\x07one\n".iter().chain(b"two\n\x1B]133;B;exit=0\x07".iter()).copied().collect();

        // feed byte runs split between the marker and the text
        let mut messages = Vec::new();
        messages.extend(tracker.process(&full[..10]));
        messages.extend(tracker.process(&full[10..]));

        let types = message_types(&messages);
        assert_eq!(types.first().map(String::as_str), Some("commandStart"));
        assert_eq!(types.last().map(String::as_str), Some("commandEnd"));
        let record = &tracker.storage().get_all_commands().unwrap()[0];
        assert_eq!(record.output, b"one\ntwo\n");
    }

    #[test]
    fn output_without_active_command_is_broadcast_but_not_recorded() {
        let mut tracker = tracker();
        let messages = tracker.process(b"stray banner\n");
        assert_eq!(message_types(&messages), vec!["output"]);
        assert!(tracker.storage().get_all_commands().unwrap().is_empty());
    }

    #[test]
    fn interactive_exit_suppresses_output_until_command_end() {
        let mut tracker = tracker();
        tracker.set_pending_command("vim");
        tracker.process(b"\x1B]133;A;cwd=/tmp\x07");
        tracker.set_just_exited_interactive(true);

        // prompt redraw after the TUI exits: dropped entirely
        let messages = tracker.process(b"\r$ ");
        assert!(messages.is_empty());

        let messages = tracker.process(b"\x1B]133;B;exit=0;cwd=/tmp\x07");
        assert_eq!(message_types(&messages), vec!["commandEnd"]);
        assert!(!tracker.just_exited_interactive());

        // suppression over: output flows again
        let messages = tracker.process(b"back\n");
        assert_eq!(message_types(&messages), vec!["output"]);

        let record = &tracker.storage().get_all_commands().unwrap()[0];
        assert!(record.output.is_empty(), "suppressed redraw is not recorded");
    }

    #[test]
    fn command_end_without_active_command_only_clears_state() {
        let mut tracker = tracker();
        tracker.set_just_exited_interactive(true);
        let messages = tracker.process(b"\x1B]133;B;exit=0;cwd=/x\x07");
        assert!(messages.is_empty());
        assert!(!tracker.just_exited_interactive());
        assert_eq!(tracker.last_known_cwd(), "/x");
    }

    #[test]
    fn prompt_markers_and_cwd_updates_pass_through() {
        let mut tracker = tracker();
        let messages = tracker.process(
            b"\x1B]133;C\x07\x1B]133;D\x07\x1B]2;u@h:/var\x07\x1B]7;file://host/opt\x07",
        );
        assert_eq!(
            message_types(&messages),
            vec!["promptStart", "promptEnd", "cwdUpdate", "cwdUpdate"]
        );
        assert_eq!(tracker.last_known_cwd(), "/opt");
    }

    #[test]
    fn styled_output_is_stored_as_parsed_lines() {
        let mut tracker = tracker();
        tracker.set_pending_command("ls --color");
        tracker.process(b"\x1B]133;A\x07");
        tracker.process(b"\x1B[34mdir\x1B[0m\r\nplain\r\n");
        tracker.process(b"tail");
        tracker.process(b"\x1B]133;B;exit=0\x07");

        let id = tracker.storage().get_all_commands().unwrap()[0].id;
        let lines = tracker.storage().get_output_lines(id).unwrap();
        assert_eq!(lines.len(), 3);

        let first: Vec<crate::terminal::StyledSegment> =
            serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first[0].text, "dir");
        assert!(first[0].style.fg.is_some());
        let last: Vec<crate::terminal::StyledSegment> =
            serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(last[0].text, "tail");
    }

    #[test]
    fn rematerialized_tracker_resumes_last_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_1.sqlite");
        {
            let storage = SessionStorage::open(&path).unwrap();
            let mut tracker = CommandTracker::new(storage, 1);
            tracker.set_pending_command("cd /srv");
            tracker.process(b"\x1B]133;A;cwd=/home\x07\x1B]133;B;exit=0;cwd=/srv\x07");
        }

        let storage = SessionStorage::open(&path).unwrap();
        let tracker = CommandTracker::new(storage, 2);
        assert_eq!(tracker.last_known_cwd(), "/srv");
    }

    #[test]
    fn unterminated_marker_tail_is_treated_as_text() {
        let mut tracker = tracker();
        tracker.set_pending_command("x");
        tracker.process(b"\x1B]133;A\x07");
        let messages = tracker.process(b"out\x1B]133;B;exit=0");
        // both the text and the truncated marker become output
        assert_eq!(message_types(&messages), vec!["output", "output"]);
        let record = &tracker.storage().get_all_commands().unwrap()[0];
        assert_eq!(record.output, b"out\x1B]133;B;exit=0");
        assert!(tracker.has_active_command());
    }
}
