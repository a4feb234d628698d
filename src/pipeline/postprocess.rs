//! Post-processing: deterministic cleanup of model prose.
//!
//! Section and summary texts are shown verbatim to users and concatenated into
//! the summary prompt, so the same few model quirks keep reappearing:
//!
//! - the whole answer wrapped in a ` ``` ` fence despite the prompt
//! - Windows-style `\r\n` line endings
//! - trailing spaces and long runs of blank lines
//! - zero-width spaces and BOMs pasted in from training data
//!
//! Rules run in a fixed order: fences first (the fence regex expects clean
//! boundaries), then line endings before any per-line rule.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule to one model answer.
///
/// Unlike file output, the result carries no trailing newline: it is embedded
/// in JSON and in other prompts.
pub fn tidy_text(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse blank-line runs to a single blank line ──────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 5: Remove invisible Unicode ─────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plain_and_tagged_fences() {
        assert_eq!(tidy_text("```\nfooting F1\n```"), "footing F1");
        assert_eq!(tidy_text("```text\nfooting F1\n```\n"), "footing F1");
    }

    #[test]
    fn inner_fences_survive() {
        let input = "Schedule:\n```\nA | B\n```\nend";
        assert_eq!(tidy_text(input), input);
    }

    #[test]
    fn crlf_and_trailing_spaces() {
        assert_eq!(tidy_text("line one  \r\nline two\t\r\n"), "line one\nline two");
    }

    #[test]
    fn blank_runs_collapse() {
        assert_eq!(tidy_text("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(tidy_text("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn invisible_chars_removed() {
        assert_eq!(tidy_text("\u{FEFF}beam\u{200B} B2"), "beam B2");
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(tidy_text("   \n\n "), "");
    }
}
