//! Shell-integration marker scanner for block-mode output.
//!
//! Scans raw PTY bytes linearly for OSC sequences (`ESC ]` ... `BEL`/`ST`)
//! and classifies the ones the command tracker cares about, preserving the
//! strict ordering of text and markers. Everything between markers is
//! interstitial text. An OSC opener with no terminator in the same read is
//! handed back as text: the shell integration emits markers in single
//! writes, so straddled reads only occur under unusual conditions and a
//! deterministic fallback beats unbounded buffering.

/// A marker recognized in the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// `OSC 133;A[;cwd=<path>]`: the shell is about to run a command.
    CommandStart { cwd: Option<String> },
    /// `OSC 133;B[;exit=<code>][;cwd=<path>]`: the command finished.
    CommandEnd { exit_code: i32, cwd: Option<String> },
    /// `OSC 133;C`
    PromptStart,
    /// `OSC 133;D`
    PromptEnd,
    /// `OSC 2;user@host:path` or `OSC 7;file://host/path`
    CwdUpdate { cwd: String },
}

/// One ordered item of a scanned chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanItem<'a> {
    Text(&'a [u8]),
    Marker(Marker),
}

/// Split a chunk of block-mode output into ordered text runs and markers.
/// Unrecognized OSC sequences are consumed and dropped.
pub fn scan(output: &[u8]) -> Vec<ScanItem<'_>> {
    let mut items = Vec::new();
    let mut i = 0;

    while i < output.len() {
        let Some(osc_start) = find_osc_start(output, i) else {
            if i < output.len() {
                items.push(ScanItem::Text(&output[i..]));
            }
            break;
        };

        if osc_start > i {
            items.push(ScanItem::Text(&output[i..osc_start]));
        }

        let Some(osc_end) = find_osc_end(output, osc_start) else {
            // unterminated: the tail is interstitial text
            items.push(ScanItem::Text(&output[osc_start..]));
            break;
        };

        let osc = &output[osc_start..=osc_end];
        if let Some(marker) = classify(osc) {
            items.push(ScanItem::Marker(marker));
        }
        i = osc_end + 1;
    }

    items
}

fn find_osc_start(output: &[u8], from: usize) -> Option<usize> {
    output[from..]
        .windows(2)
        .position(|window| window == b"\x1B]")
        .map(|offset| from + offset)
}

/// Index of the last byte of the terminator: BEL, or the `\` of `ESC \`.
fn find_osc_end(output: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 2;
    while i < output.len() {
        match output[i] {
            0x07 => return Some(i),
            0x1B if output.get(i + 1) == Some(&b'\\') => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn classify(osc: &[u8]) -> Option<Marker> {
    if osc.starts_with(b"\x1B]133;A") {
        return Some(Marker::CommandStart {
            cwd: extract_param(osc, b"cwd"),
        });
    }
    if osc.starts_with(b"\x1B]133;B") {
        let exit_code = extract_param(osc, b"exit")
            .and_then(|value| value.parse::<i32>().ok())
            .unwrap_or(0);
        return Some(Marker::CommandEnd {
            exit_code,
            cwd: extract_param(osc, b"cwd"),
        });
    }
    if osc.starts_with(b"\x1B]133;C") {
        return Some(Marker::PromptStart);
    }
    if osc.starts_with(b"\x1B]133;D") {
        return Some(Marker::PromptEnd);
    }
    if osc.starts_with(b"\x1B]2;") {
        let title = payload(&osc[4..]);
        return path_from_title(&title).map(|cwd| Marker::CwdUpdate { cwd });
    }
    if osc.starts_with(b"\x1B]7;") {
        return path_from_file_uri(osc).map(|cwd| Marker::CwdUpdate { cwd });
    }
    None
}

/// Payload up to the terminator.
fn payload(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == 0x07 || b == 0x1B)
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Value of a `key=value` parameter, ending at `;` or the terminator.
fn extract_param(osc: &[u8], key: &[u8]) -> Option<String> {
    let mut pattern = key.to_vec();
    pattern.push(b'=');
    let pos = osc
        .windows(pattern.len())
        .position(|window| window == pattern.as_slice())?;
    let start = pos + pattern.len();
    let end = osc[start..]
        .iter()
        .position(|&b| b == b';' || b == 0x07 || b == 0x1B)
        .map_or(osc.len(), |offset| start + offset);
    let value = String::from_utf8_lossy(&osc[start..end]).into_owned();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// A title of the form `user@host:path` carries the shell's cwd.
fn path_from_title(title: &str) -> Option<String> {
    let colon = title.rfind(':')?;
    if colon + 1 >= title.len() {
        return None;
    }
    let at = title.find('@')?;
    if at < colon {
        Some(title[colon + 1..].to_string())
    } else {
        None
    }
}

/// `OSC 7;file://<host>/<path>`: the path starts at the first `/` after
/// the host.
fn path_from_file_uri(osc: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(osc);
    let uri_start = text.find("file://")? + "file://".len();
    let slash = text[uri_start..].find('/')? + uri_start;
    let end = text[slash..]
        .find(|c| c == '\x07' || c == '\x1B')
        .map_or(text.len(), |offset| slash + offset);
    Some(text[slash..end].to_string())
}
