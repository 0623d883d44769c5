//! Raw device output normalization.
//!
//! Serial consoles interleave the text we care about with VT100 control
//! sequences, backspace-driven line editing, and CRLF line endings. The
//! normalizer reduces all of that to plain LF-separated text so prompt
//! classification and capture results are deterministic. It is applied only
//! for classification and final capture output; raw bytes forwarded to
//! interactive consumers are never normalized.

use regex::Regex;
use std::sync::OnceLock;

// ANSI CSI sequences: ESC [ params intermediates final.
const ANSI_CSI: &str = "\x1b\\[[0-9;?]*[ -/]*[@-~]";

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ANSI_CSI).expect("ANSI CSI pattern compiles"))
}

/// Normalizes raw device output: strips ANSI CSI sequences, applies
/// backspace semantics, and folds `\r\n` / lone `\r` to `\n`.
///
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(input: &str) -> String {
    let stripped = ansi_re().replace_all(input, "");
    let rubbed = apply_backspaces(&stripped);
    fold_newlines(&rubbed)
}

/// Applies backspace (0x08) semantics: each backspace deletes the character
/// before it; leading backspaces with nothing to delete are dropped.
fn apply_backspaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '\u{8}' {
            out.pop();
        } else {
            out.push(ch);
        }
    }
    out
}

fn fold_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Returns the last `n` characters of `s` (not bytes; safe on multi-byte
/// content such as U+FFFD replacement characters from lossy decoding).
pub fn tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Rounds `idx` down to the nearest char boundary in `s`.
pub fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Rounds `idx` up to the nearest char boundary in `s`.
pub fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(normalize("\x1b[2Jhello\x1b[0m"), "hello");
        assert_eq!(normalize("\x1b[?25lSwitch#\x1b[K "), "Switch# ");
    }

    #[test]
    fn applies_backspaces() {
        assert_eq!(normalize("abc\x08d"), "abd");
        assert_eq!(normalize("ab\x08\x08cd"), "cd");
        // Leading backspaces with nothing before them are dropped.
        assert_eq!(normalize("\x08\x08ok"), "ok");
    }

    #[test]
    fn folds_line_endings() {
        assert_eq!(normalize("a\r\nb\rc\n"), "a\nb\nc\n");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "plain",
            "a\r\nb\x08c",
            "\x1b[31mred\x1b[0m\r\n --More-- \x08\x08",
            "\x08\x08\x08",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn tail_is_char_based() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        assert_eq!(tail("", 4), "");
        assert_eq!(tail("a\u{fffd}b", 2), "\u{fffd}b");
        assert_eq!(tail("abc", 0), "");
    }

    #[test]
    fn boundary_helpers_clamp() {
        let s = "a\u{fffd}b";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(ceil_char_boundary(s, 2), 4);
        assert_eq!(ceil_char_boundary(s, 100), s.len());
    }
}
