use aivory_core::capture::{StackFrame, ANONYMOUS_FRAME};
use aivory_core::MAX_STACK_FRAMES;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// `at name (location)`. The name may carry an `async ` prefix; the location
/// is either `file:line:col`, `native`, or `<anonymous>`.
static FRAME_WITH_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(?:async\s+)?(.+?)\s+\((.*)\)\s*$").expect("frame regex"));

/// `at file:line:col` with no function name.
static FRAME_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(?:async\s+)?(.+?):(\d+):(\d+)\s*$").expect("frame regex"));

static LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*):(\d+):(\d+)$").expect("location regex"));

const NATIVE_SENTINEL: &str = "native";
const NATIVE_URL_PREFIX: &str = "native ";

/// Parse a V8-style stack trace into frames. Non-frame lines (the leading
/// `Name: message` line, multi-line messages) are skipped; output is capped
/// at 50 frames.
pub fn parse_stack_trace(stack: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    for line in stack.lines() {
        if frames.len() >= MAX_STACK_FRAMES {
            break;
        }
        if let Some(frame) = parse_frame_line(line) {
            frames.push(frame);
        }
    }
    frames
}

fn parse_frame_line(line: &str) -> Option<StackFrame> {
    if let Some(caps) = FRAME_WITH_NAME.captures(line) {
        let (class_name, method_name) = split_method(&caps[1]);
        let mut frame = StackFrame {
            method_name,
            class_name,
            ..StackFrame::default()
        };
        apply_location(&mut frame, &caps[2]);
        return Some(frame);
    }
    if let Some(caps) = FRAME_BARE.captures(line) {
        let mut frame = StackFrame::default();
        apply_file(&mut frame, &caps[1]);
        frame.line_number = caps[2].parse().ok()?;
        frame.column_number = caps[3].parse().ok()?;
        return Some(frame);
    }
    None
}

fn apply_location(frame: &mut StackFrame, location: &str) {
    if location == NATIVE_SENTINEL {
        frame.is_native = true;
        frame.source_available = false;
        return;
    }
    if location == ANONYMOUS_FRAME {
        frame.source_available = false;
        return;
    }
    if let Some(caps) = LOCATION.captures(location) {
        apply_file(frame, &caps[1]);
        frame.line_number = caps[2].parse().unwrap_or(0);
        frame.column_number = caps[3].parse().unwrap_or(0);
    } else {
        apply_file(frame, location);
    }
}

fn apply_file(frame: &mut StackFrame, path: &str) {
    if let Some(stripped) = path.strip_prefix(NATIVE_URL_PREFIX) {
        frame.is_native = true;
        frame.source_available = false;
        frame.file_path = Some(stripped.to_string());
        frame.file_name = base_name(stripped);
        return;
    }
    frame.source_available = source_available(path);
    frame.file_name = base_name(path);
    frame.file_path = Some(path.to_string());
}

/// Frames pointing at runtime internals or vendored dependencies carry no
/// user-resolvable source.
pub fn source_available(path: &str) -> bool {
    !(path.starts_with("node:")
        || path.starts_with("internal/")
        || path.contains("node_modules"))
}

fn base_name(path: &str) -> Option<String> {
    let name = path
        .rsplit(|ch| ch == '/' || ch == '\\')
        .next()
        .unwrap_or(path);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// `Class.method` splits; a bare name (or one with spaces, e.g. `new Foo`)
/// stays whole.
pub(crate) fn split_method(name: &str) -> (Option<String>, String) {
    let name = name.trim();
    if name.is_empty() {
        return (None, ANONYMOUS_FRAME.to_string());
    }
    if !name.contains(' ') {
        if let Some((class, method)) = name.rsplit_once('.') {
            if !class.is_empty() && !method.is_empty() {
                return (Some(class.to_string()), method.to_string());
            }
        }
    }
    (None, name.to_string())
}

/// Split an exception's textual description into `(type, message)`. The
/// first line has the shape `Name: message`; a class name reported by the
/// debugger wins over the parsed prefix.
pub fn exception_header(description: Option<&str>, class_hint: Option<&str>) -> (String, String) {
    let line = description
        .and_then(|text| text.lines().next())
        .unwrap_or("")
        .trim();
    let (parsed_name, message) = match line.split_once(": ") {
        Some((name, rest)) if !name.is_empty() && !name.contains(' ') => {
            (Some(name.to_string()), rest.to_string())
        }
        _ => (None, line.to_string()),
    };
    let name = class_hint
        .map(str::to_string)
        .or(parsed_name)
        .unwrap_or_else(|| "Error".to_string());
    (name, message)
}

/// Cache index bridging the paused-inspection moment and the later
/// exception-hook report: the first four lines of the stack's textual
/// description joined by `|`.
pub fn stack_key(description: Option<&str>, now_ms: i64) -> String {
    match description {
        Some(text) if !text.trim().is_empty() => {
            text.lines().take(4).collect::<Vec<_>>().join("|")
        }
        _ => format!("unknown-{now_ms}"),
    }
}

/// Lightweight `type|line|line|line` key used to avoid double-reporting
/// between the debugger and hook paths. Not the capture fingerprint.
pub fn dedup_fingerprint(exception_type: &str, line_numbers: impl IntoIterator<Item = u32>) -> String {
    let lines: Vec<String> = line_numbers
        .into_iter()
        .take(3)
        .map(|line| line.to_string())
        .collect();
    format!("{exception_type}|{}", lines.join("|"))
}

/// Deterministic content hash identifying logically-equivalent exceptions:
/// first 16 hex chars of SHA-256 over the type plus up to five `method:line`
/// entries from the first non-native frames.
pub fn capture_fingerprint(exception_type: &str, frames: &[StackFrame]) -> String {
    let mut input = exception_type.to_string();
    for frame in frames.iter().filter(|frame| !frame.is_native).take(5) {
        input.push('|');
        input.push_str(&frame.method_name);
        input.push(':');
        input.push_str(&frame.line_number.to_string());
    }
    let digest = sha256_hex(input.as_bytes());
    digest[..16].to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
