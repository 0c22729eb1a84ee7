use serde::{Deserialize, Serialize};

use super::color::Color;

/// Text attributes for a run of characters. Doubles as the wire form:
/// `fg`/`bg` are a [`Color`] or null, the flags plain booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub blink: bool,
    pub reverse: bool,
    pub hidden: bool,
    pub strikethrough: bool,
}

impl TextStyle {
    /// Back to defaults: no colors, all attributes off.
    pub fn reset(&mut self) {
        *self = TextStyle::default();
    }

    pub fn is_default(&self) -> bool {
        *self == TextStyle::default()
    }
}

/// A run of text sharing one style. Used on the wire and as the compact
/// row representation for snapshots, diffs and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyledSegment {
    pub text: String,
    pub style: TextStyle,
}

impl StyledSegment {
    pub fn new(text: impl Into<String>, style: TextStyle) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

/// Apply an SGR parameter list to a style. An empty list means reset.
/// Shared by the grid-driving ANSI processor and the stateless output
/// parser so both interpret colors identically.
pub fn apply_sgr(style: &mut TextStyle, params: &[u16]) {
    if params.is_empty() {
        style.reset();
        return;
    }

    let mut i = 0;
    while i < params.len() {
        match params[i] {
            0 => style.reset(),
            1 => style.bold = true,
            2 => style.dim = true,
            3 => style.italic = true,
            4 => style.underline = true,
            5 | 6 => style.blink = true,
            7 => style.reverse = true,
            8 => style.hidden = true,
            9 => style.strikethrough = true,
            22 => {
                style.bold = false;
                style.dim = false;
            }
            23 => style.italic = false,
            24 => style.underline = false,
            25 => style.blink = false,
            27 => style.reverse = false,
            28 => style.hidden = false,
            29 => style.strikethrough = false,
            30..=37 => style.fg = Some(Color::Standard(params[i] as u8 - 30)),
            38 => {
                if let Some(color) = parse_extended_color(params, &mut i) {
                    style.fg = Some(color);
                }
            }
            39 => style.fg = None,
            40..=47 => style.bg = Some(Color::Standard(params[i] as u8 - 40)),
            48 => {
                if let Some(color) = parse_extended_color(params, &mut i) {
                    style.bg = Some(color);
                }
            }
            49 => style.bg = None,
            90..=97 => style.fg = Some(Color::Bright(params[i] as u8 - 90)),
            100..=107 => style.bg = Some(Color::Bright(params[i] as u8 - 100)),
            _ => {}
        }
        i += 1;
    }
}

/// Parse the tail of a 38/48 extended-color sequence starting at `index`
/// (the position of the 38/48 itself). Advances `index` past consumed
/// parameters. Incomplete sequences consume nothing and leave the color
/// unchanged.
fn parse_extended_color(params: &[u16], index: &mut usize) -> Option<Color> {
    match params.get(*index + 1).copied()? {
        5 => {
            let palette = *params.get(*index + 2)?;
            *index += 2;
            Some(Color::from_palette_index(palette.min(255) as u8))
        }
        2 => {
            if *index + 4 >= params.len() {
                return None;
            }
            let r = params[*index + 2].min(255) as u8;
            let g = params[*index + 3].min(255) as u8;
            let b = params[*index + 4].min(255) as u8;
            *index += 4;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}
