use crate::terminal::style::{apply_sgr, StyledSegment, TextStyle};

/// Stateless-per-chunk parser turning a marker-free byte run into styled
/// segments. Only SGR is interpreted; other CSI sequences (cursor, erase)
/// and OSC strings are stripped, everything else stays as text. The
/// carried style makes segments self-contained across chunk boundaries.
pub struct OutputParser {
    current_style: TextStyle,
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            current_style: TextStyle::default(),
        }
    }

    pub fn reset(&mut self) {
        self.current_style.reset();
    }

    pub fn parse(&mut self, input: &[u8]) -> Vec<StyledSegment> {
        let mut segments: Vec<StyledSegment> = Vec::new();
        let mut text: Vec<u8> = Vec::new();

        let mut flush = |text: &mut Vec<u8>, style: TextStyle, segments: &mut Vec<StyledSegment>| {
            if !text.is_empty() {
                let owned = String::from_utf8_lossy(text).into_owned();
                segments.push(StyledSegment::new(owned, style));
                text.clear();
            }
        };

        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            if byte == 0x1B && i + 1 < input.len() && input[i + 1] == b'[' {
                // CSI: scan to the final byte
                let start = i + 2;
                let mut end = start;
                while end < input.len() && !(0x40..=0x7E).contains(&input[end]) {
                    end += 1;
                }
                if end < input.len() {
                    flush(&mut text, self.current_style, &mut segments);
                    if input[end] == b'm' {
                        let params = parse_csi_params(&input[start..end]);
                        apply_sgr(&mut self.current_style, &params);
                    }
                    i = end + 1;
                    continue;
                }
                // truncated CSI at end of input: keep the bytes as text
            } else if byte == 0x1B && i + 1 < input.len() && input[i + 1] == b']' {
                // OSC: skip through BEL or ST; an unterminated OSC is
                // dropped from the styled output (the raw bytes are still
                // recorded upstream)
                flush(&mut text, self.current_style, &mut segments);
                let mut end = i + 2;
                let mut next = input.len();
                while end < input.len() {
                    if input[end] == 0x07 {
                        next = end + 1;
                        break;
                    }
                    if input[end] == 0x1B && end + 1 < input.len() && input[end + 1] == b'\\' {
                        next = end + 2;
                        break;
                    }
                    end += 1;
                }
                i = next;
                continue;
            } else if byte == 0x1B && i + 1 < input.len() {
                // other two-byte escape
                i += 2;
                continue;
            }

            text.push(byte);
            i += 1;
        }

        flush(&mut text, self.current_style, &mut segments);
        segments
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Semicolon-separated decimal parameters; empty or invalid tokens parse
/// as 0, an empty buffer as `[0]`.
fn parse_csi_params(buffer: &[u8]) -> Vec<u16> {
    if buffer.is_empty() {
        return vec![0];
    }
    buffer
        .split(|&b| b == b';')
        .map(|token| {
            std::str::from_utf8(token)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::color::Color;

    #[test]
    fn plain_text_is_one_default_segment() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"hello\n");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello\n");
        assert!(segments[0].style.is_default());
    }

    #[test]
    fn sgr_toggles_produce_segments() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"\x1B[31mred\x1B[0m\x1B[1mbold");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "red");
        assert_eq!(segments[0].style.fg, Some(Color::Standard(1)));
        assert!(!segments[0].style.bold);
        assert_eq!(segments[1].text, "bold");
        assert!(segments[1].style.bold);
        assert_eq!(segments[1].style.fg, None);
    }

    #[test]
    fn style_carries_across_parse_calls() {
        let mut parser = OutputParser::new();
        parser.parse(b"\x1B[32m");
        let segments = parser.parse(b"still green");
        assert_eq!(segments[0].style.fg, Some(Color::Standard(2)));
        parser.reset();
        let segments = parser.parse(b"plain");
        assert!(segments[0].style.is_default());
    }

    #[test]
    fn non_sgr_csi_is_stripped() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"a\x1B[2Kb\x1B[10;20Hc");
        assert_eq!(segments.len(), 3);
        let text: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(text, "abc");
    }

    #[test]
    fn osc_strings_are_stripped() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"a\x1B]0;title\x07b\x1B]8;;x\x1B\\c");
        let text: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(text, "abc");
    }

    #[test]
    fn unterminated_osc_tail_is_dropped() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"out\x1B]133;A;cwd=/x");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "out");
    }

    #[test]
    fn utf8_with_continuation_bytes_stays_whole() {
        let mut parser = OutputParser::new();
        // "Л" is 0xD0 0x9B; 0x9B must not be taken for an 8-bit CSI
        let input = "2026-02-02 - Локальные".as_bytes();
        let segments = parser.parse(input);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text.as_bytes(), input);
    }

    #[test]
    fn mixed_utf8_and_sgr() {
        let mut parser = OutputParser::new();
        let segments = parser.parse("\x1B[31mПривет\x1B[0m".as_bytes());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Привет");
        assert_eq!(segments[0].style.fg, Some(Color::Standard(1)));
    }

    #[test]
    fn extended_colors_apply() {
        let mut parser = OutputParser::new();
        let segments = parser.parse(b"\x1B[38;5;196mX\x1B[48;2;1;2;3mY");
        assert_eq!(segments[0].style.fg, Some(Color::Indexed(196)));
        assert_eq!(segments[1].style.bg, Some(Color::Rgb(1, 2, 3)));
    }
}
