//! # Engine Output Normalization
//!
//! Whisper prints transcripts decorated with segment timestamps and
//! language-detection banners:
//!
//! ```text
//! Detecting language using up to the first 30 seconds. Use `--language` to specify the language
//! Detected language: English
//! [00:00.000 --> 00:03.240]  Hello there.
//! ```
//!
//! [`normalize`] turns that into plain text. It has no knowledge of files
//! or processes.

use regex::Regex;
use std::sync::OnceLock;

/// `[dd:dd`: the start of a segment timestamp. Without one, the output
/// is not transcript-shaped.
fn timestamp_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d{2,}:\d{2}").expect("valid marker regex"))
}

/// A bracketed span on a single line plus the padding after it.
fn bracketed_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]\n]*\][ \t]*").expect("valid span regex"))
}

/// "Detecting language ..." / "Detected language: ...", any case.
fn detection_banner() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bdetect(?:ing|ed)\s+language\b").expect("valid banner regex")
    })
}

/// Strip engine decoration from raw output.
///
/// Returns `None` when the output carries no timestamp marker, meaning the
/// engine did not produce a transcript at all.
pub fn normalize(raw: &str) -> Option<String> {
    if !timestamp_marker().is_match(raw) {
        return None;
    }

    let stripped = bracketed_span().replace_all(raw, "");

    let mut lines: Vec<&str> = stripped
        .split('\n')
        .filter(|line| !detection_banner().is_match(line))
        .collect();

    // "a\n" splits into ["a", ""]
    if lines.len() > 1 && lines.last() == Some(&"") {
        lines.pop();
    }

    Some(lines.join("\n"))
}
