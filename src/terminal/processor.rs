use super::grid::{ClearLineMode, ClearScreenMode, Screen};
use super::style::apply_sgr;

/// Side-band events surfaced while processing terminal output.
#[derive(Debug, Clone, PartialEq)]
pub enum AnsiEvent {
    /// DECSET/DECRST 47, 1047 or 1049 flipped the interactive flag.
    InteractiveModeChanged { entered: bool },
    /// OSC 0/1/2 set the window title.
    TitleChanged(String),
    /// BEL received outside an OSC string.
    Bell,
}

/// ANSI/VT byte-stream processor attached to one screen.
///
/// The vte parser supplies the escape-sequence state machine and
/// incremental UTF-8 decoding, so chunk boundaries anywhere in the input
/// (including mid-codepoint) produce identical grid contents.
pub struct AnsiProcessor {
    parser: vte::Parser,
    state: ProcessorState,
}

struct ProcessorState {
    screen: Screen,
    interactive: bool,
    events: Vec<AnsiEvent>,
}

impl AnsiProcessor {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            parser: vte::Parser::new(),
            state: ProcessorState {
                screen: Screen::new(rows, cols),
                interactive: false,
                events: Vec::new(),
            },
        }
    }

    /// Feed a chunk of PTY output; returns the events it produced.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<AnsiEvent> {
        for &byte in bytes {
            self.parser.advance(&mut self.state, byte);
        }
        std::mem::take(&mut self.state.events)
    }

    pub fn screen(&self) -> &Screen {
        &self.state.screen
    }

    pub fn screen_mut(&mut self) -> &mut Screen {
        &mut self.state.screen
    }

    pub fn is_interactive(&self) -> bool {
        self.state.interactive
    }

    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.state.screen.resize(rows, cols);
    }
}

fn extract_params(params: &vte::Params) -> Vec<u16> {
    params
        .iter()
        .flat_map(|subparams| subparams.iter().copied())
        .collect()
}

/// Parameter with a default: missing or zero both mean the default.
fn param(params: &[u16], index: usize, default: u16) -> u16 {
    params
        .get(index)
        .copied()
        .filter(|&value| value != 0)
        .unwrap_or(default)
}

impl ProcessorState {
    fn tab(&mut self) {
        let next = (self.screen.cursor_col() / 8 + 1) * 8;
        let row = self.screen.cursor_row();
        self.screen.move_cursor(row, next);
    }

    fn set_private_mode(&mut self, params: &[u16], enable: bool) {
        for &mode in params {
            match mode {
                47 | 1047 | 1049 => {
                    if enable != self.interactive {
                        self.interactive = enable;
                        if enable {
                            self.screen.clear_screen(ClearScreenMode::Entire);
                            self.screen.move_cursor(0, 0);
                        }
                        self.events
                            .push(AnsiEvent::InteractiveModeChanged { entered: enable });
                    }
                }
                // DECTCEM, DECAWM, cursor blink
                25 | 7 | 12 => {}
                _ => {}
            }
        }
    }
}

impl vte::Perform for ProcessorState {
    fn print(&mut self, c: char) {
        self.screen.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x07 => self.events.push(AnsiEvent::Bell),
            0x08 => {
                if self.screen.cursor_col() > 0 {
                    self.screen.move_cursor_relative(0, -1);
                }
            }
            0x09 => self.tab(),
            0x0A => self.screen.line_feed(),
            0x0D => self.screen.carriage_return(),
            _ => {}
        }
    }

    fn csi_dispatch(
        &mut self,
        params: &vte::Params,
        intermediates: &[u8],
        _ignore: bool,
        action: char,
    ) {
        let raw = extract_params(params);
        let is_private = intermediates.contains(&b'?');

        if is_private {
            match action {
                'h' => self.set_private_mode(&raw, true),
                'l' => self.set_private_mode(&raw, false),
                _ => {}
            }
            return;
        }

        match action {
            'A' => self
                .screen
                .move_cursor_relative(-(param(&raw, 0, 1) as isize), 0),
            'B' => self
                .screen
                .move_cursor_relative(param(&raw, 0, 1) as isize, 0),
            'C' => self
                .screen
                .move_cursor_relative(0, param(&raw, 0, 1) as isize),
            'D' => self
                .screen
                .move_cursor_relative(0, -(param(&raw, 0, 1) as isize)),
            'E' => {
                self.screen
                    .move_cursor_relative(param(&raw, 0, 1) as isize, 0);
                self.screen.carriage_return();
            }
            'F' => {
                self.screen
                    .move_cursor_relative(-(param(&raw, 0, 1) as isize), 0);
                self.screen.carriage_return();
            }
            'G' => {
                let row = self.screen.cursor_row();
                self.screen.move_cursor(row, param(&raw, 0, 1) as usize - 1);
            }
            'd' => {
                let col = self.screen.cursor_col();
                self.screen.move_cursor(param(&raw, 0, 1) as usize - 1, col);
            }
            'H' | 'f' => {
                let row = param(&raw, 0, 1) as usize - 1;
                let col = param(&raw, 1, 1) as usize - 1;
                self.screen.move_cursor(row, col);
            }
            'J' => {
                let mode = match raw.first().copied().unwrap_or(0) {
                    0 => ClearScreenMode::ToEnd,
                    1 => ClearScreenMode::ToStart,
                    // 3 clears scrollback in xterm; we have none, treat as 2
                    2 | 3 => ClearScreenMode::Entire,
                    _ => return,
                };
                self.screen.clear_screen(mode);
            }
            'K' => {
                let mode = match raw.first().copied().unwrap_or(0) {
                    0 => ClearLineMode::ToEnd,
                    1 => ClearLineMode::ToStart,
                    2 => ClearLineMode::Entire,
                    _ => return,
                };
                self.screen.clear_line(mode);
            }
            'S' => self.screen.scroll(param(&raw, 0, 1) as isize),
            'T' => self.screen.scroll(-(param(&raw, 0, 1) as isize)),
            'm' => {
                let mut style = *self.screen.current_style();
                apply_sgr(&mut style, &raw);
                self.screen.set_current_style(style);
            }
            // DECSTBM, save/restore cursor: accepted and ignored
            'r' | 's' | 'u' => {}
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        if !intermediates.is_empty() {
            return;
        }
        match byte {
            // RIS
            b'c' => {
                self.screen.clear_screen(ClearScreenMode::Entire);
                self.screen.move_cursor(0, 0);
                self.screen.reset_style();
            }
            // IND
            b'D' => self.screen.line_feed(),
            // NEL
            b'E' => {
                self.screen.carriage_return();
                self.screen.line_feed();
            }
            // RI
            b'M' => {
                if self.screen.cursor_row() > 0 {
                    self.screen.move_cursor_relative(-1, 0);
                } else {
                    self.screen.scroll(-1);
                }
            }
            // DECSC/DECRC: accepted and ignored
            b'7' | b'8' => {}
            _ => {}
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        // Only titles are handled here. OSC 133 markers and OSC 7 cwd
        // reports are picked out of the raw byte stream by the marker
        // scanner in block mode.
        if params.is_empty() {
            return;
        }
        let selector = std::str::from_utf8(params[0]).unwrap_or("");
        if params.len() >= 2 && matches!(selector, "0" | "1" | "2") {
            let title = String::from_utf8_lossy(params[1]).to_string();
            self.events.push(AnsiEvent::TitleChanged(title));
        }
    }

    fn hook(&mut self, _params: &vte::Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::color::Color;

    fn processor() -> AnsiProcessor {
        AnsiProcessor::new(5, 10)
    }

    #[test]
    fn prints_text_and_moves_cursor() {
        let mut p = processor();
        p.process(b"hi");
        assert_eq!(p.screen().row_text(0), "hi");
        assert_eq!(p.screen().cursor_col(), 2);
    }

    #[test]
    fn utf8_split_across_reads_yields_one_cell() {
        let mut p = processor();
        p.process(&[0xD0]);
        p.process(&[0x9F]);
        assert_eq!(p.screen().cell_at(0, 0).unwrap().ch, '\u{041F}');
        assert_eq!(p.screen().cursor_col(), 1);
    }

    #[test]
    fn chunking_does_not_change_grid_contents() {
        let input = b"\x1B[31m\xD0\x9F\xD1\x80\xD0\xB8\x1B[0m ok";
        let mut whole = processor();
        whole.process(input);

        for split in 1..input.len() {
            let mut parts = processor();
            parts.process(&input[..split]);
            parts.process(&input[split..]);
            assert_eq!(parts.screen().row_text(0), whole.screen().row_text(0));
            assert_eq!(
                parts.screen().row_segments(0, true),
                whole.screen().row_segments(0, true)
            );
        }
    }

    #[test]
    fn sgr_reset_restores_default_style() {
        let mut p = processor();
        p.process(b"\x1B[1;31mx\x1B[0m");
        assert!(p.screen().current_style().is_default());
        let cell = p.screen().cell_at(0, 0).unwrap();
        assert!(cell.style.bold);
        assert_eq!(cell.style.fg, Some(Color::Standard(1)));
    }

    #[test]
    fn control_codes_move_the_cursor() {
        let mut p = processor();
        p.process(b"ab\rc");
        assert_eq!(p.screen().row_text(0), "cb");
        p.process(b"\x09");
        assert_eq!(p.screen().cursor_col(), 8);
        p.process(b"\x08");
        assert_eq!(p.screen().cursor_col(), 7);
        p.process(b"\n");
        assert_eq!(p.screen().cursor_row(), 1);
    }

    #[test]
    fn cursor_movement_sequences() {
        let mut p = processor();
        p.process(b"\x1B[3;4H");
        assert_eq!((p.screen().cursor_row(), p.screen().cursor_col()), (2, 3));
        p.process(b"\x1B[2A");
        assert_eq!(p.screen().cursor_row(), 0);
        p.process(b"\x1B[10D");
        assert_eq!(p.screen().cursor_col(), 0);
        p.process(b"\x1B[7G");
        assert_eq!(p.screen().cursor_col(), 6);
        p.process(b"\x1B[2d");
        assert_eq!(p.screen().cursor_row(), 1);
    }

    #[test]
    fn erase_line_and_display() {
        let mut p = processor();
        p.process(b"hello\x1B[1;3H\x1B[0K");
        assert_eq!(p.screen().row_text(0), "he");

        let mut p = processor();
        p.process(b"hello\x1B[2J");
        assert_eq!(p.screen().row_text(0), "");
    }

    #[test]
    fn ris_resets_screen_and_style() {
        let mut p = processor();
        p.process(b"\x1B[31mred\x1Bc");
        assert_eq!(p.screen().row_text(0), "");
        assert!(p.screen().current_style().is_default());
        assert_eq!(p.screen().cursor_col(), 0);
    }

    #[test]
    fn entering_interactive_clears_and_emits() {
        let mut p = processor();
        p.process(b"old");
        let events = p.process(b"\x1B[?1049h");
        assert_eq!(
            events,
            vec![AnsiEvent::InteractiveModeChanged { entered: true }]
        );
        assert!(p.is_interactive());
        assert_eq!(p.screen().row_text(0), "");
        assert_eq!(p.screen().cursor_col(), 0);

        // repeated set does not re-emit
        assert!(p.process(b"\x1B[?1049h").is_empty());

        let events = p.process(b"\x1B[?1049l");
        assert_eq!(
            events,
            vec![AnsiEvent::InteractiveModeChanged { entered: false }]
        );
        assert!(!p.is_interactive());
    }

    #[test]
    fn tui_scenario_snapshot_state() {
        let mut p = processor();
        p.process(b"\x1B[?1049h");
        p.process(b"hello");
        assert_eq!((p.screen().cursor_row(), p.screen().cursor_col()), (0, 5));
        assert_eq!(p.screen().row_segments(0, true)[0].text, "hello");
    }

    #[test]
    fn title_and_bell_events() {
        let mut p = processor();
        let events = p.process(b"\x1B]2;my title\x07\x07");
        assert_eq!(
            events,
            vec![
                AnsiEvent::TitleChanged("my title".to_string()),
                AnsiEvent::Bell
            ]
        );
    }

    #[test]
    fn osc_133_markers_are_transparent() {
        let mut p = processor();
        let events = p.process(b"\x1B]133;A;cwd=/tmp\x07hi");
        assert!(events.is_empty());
        assert_eq!(p.screen().row_text(0), "hi");
    }

    #[test]
    fn scroll_sequences() {
        let mut p = AnsiProcessor::new(3, 5);
        p.process(b"a\r\nb\r\nc");
        p.process(b"\x1B[2S");
        assert_eq!(p.screen().row_text(0), "c");
        assert_eq!(p.screen().row_text(1), "");
        assert_eq!(p.screen_mut().take_scrolled_off_rows().len(), 2);
    }

    #[test]
    fn reverse_index_scrolls_down_at_top() {
        let mut p = AnsiProcessor::new(3, 5);
        p.process(b"x\x1B[1;1H\x1BM");
        assert_eq!(p.screen().row_text(1), "x");
        assert_eq!(p.screen().cursor_row(), 0);
    }

    #[test]
    fn ignored_sequences_leave_state_intact() {
        let mut p = processor();
        p.process(b"\x1B[?25l\x1B[?7h\x1B[s\x1B[u\x1B[1;5r\x1B7\x1B8ok");
        assert_eq!(p.screen().row_text(0), "ok");
        assert!(!p.is_interactive());
    }
}
