use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Terminal color: the 8 standard ANSI colors, their bright variants,
/// the 256-color palette, and 24-bit RGB. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Standard(u8),
    Bright(u8),
    Indexed(u8),
    Rgb(u8, u8, u8),
}

const COLOR_NAMES: [&str; 8] = [
    "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white",
];

impl Color {
    /// Map a 256-color palette index onto the wire taxonomy: the first 8
    /// are standard, the next 8 bright, the rest indexed.
    pub fn from_palette_index(index: u8) -> Self {
        match index {
            0..=7 => Color::Standard(index),
            8..=15 => Color::Bright(index - 8),
            _ => Color::Indexed(index),
        }
    }
}

/// Wire form used by the client protocol and stored segment JSON.
/// Standard/bright colors serialize as names (`"red"`, `"bright_red"`),
/// indexed as `{"index": n}`, RGB as `{"rgb": "#RRGGBB"}`.
impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Color::Standard(n) => {
                let name = COLOR_NAMES.get(n as usize).copied().unwrap_or("white");
                serializer.serialize_str(name)
            }
            Color::Bright(n) => {
                let name = COLOR_NAMES.get(n as usize).copied().unwrap_or("white");
                serializer.serialize_str(&format!("bright_{}", name))
            }
            Color::Indexed(index) => IndexedRepr { index }.serialize(serializer),
            Color::Rgb(r, g, b) => RgbRepr {
                rgb: format!("#{:02X}{:02X}{:02X}", r, g, b),
            }
            .serialize(serializer),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IndexedRepr {
    index: u8,
}

#[derive(Serialize, Deserialize)]
struct RgbRepr {
    rgb: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Name(String),
    Indexed(IndexedRepr),
    Rgb(RgbRepr),
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ColorRepr::deserialize(deserializer)? {
            ColorRepr::Name(name) => {
                let (bright, base) = match name.strip_prefix("bright_") {
                    Some(rest) => (true, rest),
                    None => (false, name.as_str()),
                };
                let n = COLOR_NAMES
                    .iter()
                    .position(|&candidate| candidate == base)
                    .ok_or_else(|| D::Error::custom(format!("unknown color name: {}", name)))?
                    as u8;
                Ok(if bright {
                    Color::Bright(n)
                } else {
                    Color::Standard(n)
                })
            }
            ColorRepr::Indexed(repr) => Ok(Color::Indexed(repr.index)),
            ColorRepr::Rgb(repr) => {
                let hex = repr
                    .rgb
                    .strip_prefix('#')
                    .ok_or_else(|| D::Error::custom("rgb color must start with '#'"))?;
                if hex.len() != 6 {
                    return Err(D::Error::custom("rgb color must be #RRGGBB"));
                }
                let parse = |s: &str| {
                    u8::from_str_radix(s, 16).map_err(|_| D::Error::custom("invalid rgb hex"))
                };
                Ok(Color::Rgb(
                    parse(&hex[0..2])?,
                    parse(&hex[2..4])?,
                    parse(&hex[4..6])?,
                ))
            }
        }
    }
}
