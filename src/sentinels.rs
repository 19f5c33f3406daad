use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Terminates every numbered entry on both the request and the reply side.
pub const SPLITTER: &str = "---SPLITTER---";

static NUMBERED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)[.)）、]\s*(.*)$").expect("numbered line regex"));

static THINKING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<think(?:ing)?>.*?</think(?:ing)?>").expect("thinking regex")
});

pub fn format_numbered_block<S: AsRef<str>>(texts: &[S]) -> String {
    let mut out = String::new();
    for (idx, text) in texts.iter().enumerate() {
        out.push_str(&format!("{}. {}\n{SPLITTER}\n", idx + 1, text.as_ref()));
    }
    out
}

pub fn strip_thinking(reply: &str) -> String {
    THINKING_RE.replace_all(reply, "").into_owned()
}

/// Parses a numbered-list reply into 0-based positions.
///
/// Numbers that never appear are simply absent. Entries that opened but collected no text are
/// absent as well, so the caller falls back to the source for them.
pub fn parse_numbered_reply(reply: &str) -> HashMap<usize, String> {
    let reply = strip_thinking(reply.trim());
    let mut out: HashMap<usize, String> = HashMap::new();
    let mut current: Option<usize> = None;
    let mut lines: Vec<&str> = Vec::new();

    for raw in reply.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        // A splitter right after an empty numbered line keeps that entry open.
        if line == SPLITTER {
            if !lines.is_empty() {
                flush(&mut out, current.take(), &mut lines);
            }
            continue;
        }
        if let Some(caps) = NUMBERED_LINE_RE.captures(line) {
            let number = caps[1].parse::<usize>().ok().and_then(|n| n.checked_sub(1));
            if let Some(pos) = number {
                flush(&mut out, current.take(), &mut lines);
                current = Some(pos);
                let first = caps.get(2).map_or("", |m| m.as_str().trim());
                if !first.is_empty() {
                    lines.push(first);
                }
                continue;
            }
        }
        if current.is_some() {
            lines.push(line);
        }
    }
    flush(&mut out, current, &mut lines);
    out
}

fn flush<'a>(out: &mut HashMap<usize, String>, pos: Option<usize>, lines: &mut Vec<&'a str>) {
    if let Some(pos) = pos {
        if !lines.is_empty() {
            out.insert(pos, lines.join("\n").trim().to_string());
        }
    }
    lines.clear();
}
