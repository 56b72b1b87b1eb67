use codeprompt_protocol::{uses_clipboard, TemplateProvider, CLIPBOARD_TOKEN};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

static DELIMITER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*---\s*$").expect("valid regex"));
static CODE_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`]*`").expect("valid regex"));

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuickActionError {
    #[error("Unknown quick action '{0}'")]
    Unknown(String),

    #[error("Template '{0}' does not read the clipboard")]
    NotClipboardTemplate(String),

    #[error("Invalid escape at byte {position}: {reason}")]
    InvalidEscape { position: usize, reason: &'static str },
}

/// Clipboard text transformations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickAction {
    /// Keep what lies between the first and last `---` line.
    TruncateBetweenDelimiters,
    /// Drop `**` outside code, unquote `> ` lines.
    StripBold,
    /// Non-breaking spaces become plain spaces.
    FixNonBreakingSpaces,
    RemoveDuplicateLines,
    SortLines,
    SortLinesByLength,
    Escape,
    Unescape,
    /// Substitute the text into a clipboard template.
    ApplyTemplate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    pub text: String,
    pub message: String,
}

impl QuickAction {
    pub const BUILTIN: [Self; 8] = [
        Self::TruncateBetweenDelimiters,
        Self::StripBold,
        Self::FixNonBreakingSpaces,
        Self::RemoveDuplicateLines,
        Self::SortLines,
        Self::SortLinesByLength,
        Self::Escape,
        Self::Unescape,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::TruncateBetweenDelimiters => "truncate",
            Self::StripBold => "strip-bold",
            Self::FixNonBreakingSpaces => "fix-nbsp",
            Self::RemoveDuplicateLines => "dedup",
            Self::SortLines => "sort",
            Self::SortLinesByLength => "sort-by-length",
            Self::Escape => "escape",
            Self::Unescape => "unescape",
            Self::ApplyTemplate(name) => name,
        }
    }

    /// Run the action. The result is always trimmed.
    pub fn apply(
        &self,
        text: &str,
        templates: &dyn TemplateProvider,
    ) -> Result<ActionOutput, QuickActionError> {
        let (text, message) = match self {
            Self::TruncateBetweenDelimiters => truncate_between_delimiters(text),
            Self::StripBold => (strip_bold(text), "Cleaned text".to_string()),
            Self::FixNonBreakingSpaces => {
                (text.replace('\u{a0}', " "), "Fixed whitespace".to_string())
            }
            Self::RemoveDuplicateLines => {
                let mut seen = std::collections::HashSet::new();
                let lines: Vec<&str> = text
                    .trim_end_matches('\n')
                    .split('\n')
                    .filter(|line| seen.insert(*line))
                    .collect();
                (lines.join("\n"), "Removed duplicates".to_string())
            }
            Self::SortLines => {
                let mut lines: Vec<&str> = text.trim_end_matches('\n').split('\n').collect();
                lines.sort_unstable();
                (lines.join("\n"), "Sorted alphabetically".to_string())
            }
            Self::SortLinesByLength => {
                let mut lines: Vec<&str> = text.trim_end_matches('\n').split('\n').collect();
                lines.sort_by_key(|line| line.chars().count());
                (lines.join("\n"), "Sorted by length".to_string())
            }
            Self::Escape => (
                escape_text(text.trim_end_matches('\n')),
                "Escaped text".to_string(),
            ),
            Self::Unescape => (
                unescape_text(text.trim_end_matches('\n'))?,
                "Unescaped text".to_string(),
            ),
            Self::ApplyTemplate(name) => {
                let content = templates
                    .template_content(name)
                    .filter(|content| uses_clipboard(content))
                    .ok_or_else(|| QuickActionError::NotClipboardTemplate(name.clone()))?;
                (
                    content.replace(CLIPBOARD_TOKEN, text),
                    format!("Applied template '{name}'"),
                )
            }
        };
        Ok(ActionOutput {
            text: text.trim().to_string(),
            message,
        })
    }
}

impl FromStr for QuickAction {
    type Err = QuickActionError;

    /// Built-in names, or `template:<name>`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Some(name) = raw.strip_prefix("template:") {
            return Ok(Self::ApplyTemplate(name.to_string()));
        }
        Self::BUILTIN
            .into_iter()
            .find(|action| action.name().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| QuickActionError::Unknown(raw.to_string()))
    }
}

fn truncate_between_delimiters(text: &str) -> (String, String) {
    let cleaned = strip_bold(&text.replace("\r\n", "\n").replace('\r', "\n"));
    let lines: Vec<&str> = cleaned.split('\n').collect();
    let delimiters: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| DELIMITER_LINE.is_match(line))
        .map(|(idx, _)| idx)
        .collect();

    let mut kept: &[&str] = &lines;
    if let (Some(&first), Some(&last)) = (delimiters.first(), delimiters.last()) {
        if first != last {
            kept = &lines[first + 1..last];
        }
    }
    while kept.first().is_some_and(|line| line.trim().is_empty()) {
        kept = &kept[1..];
    }
    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept = &kept[..kept.len() - 1];
    }

    let result = kept.join("\n");
    let chars = result.chars().count();
    let message = match delimiters.len() {
        0 => format!("No '---' found, copied whole document ({chars} chars)"),
        1 => format!("Only one '---' found, copied whole document ({chars} chars)"),
        _ => format!("Copied {chars} chars (between delimiters)"),
    };
    (result, message)
}

fn strip_bold(text: &str) -> String {
    let mut in_fence = false;
    let mut out = Vec::new();
    for raw in text.split('\n') {
        let mut line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = line.strip_prefix("> ") {
            line = rest;
        } else if line.trim() == ">" {
            line = "";
        }

        if line.starts_with("```") {
            in_fence = !in_fence;
            out.push(line.to_string());
            continue;
        }
        if in_fence || line.starts_with("    ") {
            out.push(line.to_string());
            continue;
        }

        let mut cleaned = String::with_capacity(line.len());
        let mut cursor = 0;
        for span in CODE_SPAN.find_iter(line) {
            cleaned.push_str(&line[cursor..span.start()].replace("**", ""));
            cleaned.push_str(span.as_str());
            cursor = span.end();
        }
        cleaned.push_str(&line[cursor..].replace("**", ""));
        out.push(cleaned);
    }
    out.join("\n")
}

/// ASCII-only escaping: `\\ \t \n \r`, `\xNN`, `\uNNNN`, `\UNNNNNNNN`.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' '..='~' => out.push(ch),
            _ => {
                let code = u32::from(ch);
                // Writing to a String cannot fail.
                let _ = if code < 0x100 {
                    write!(out, "\\x{code:02x}")
                } else if code < 0x1_0000 {
                    write!(out, "\\u{code:04x}")
                } else {
                    write!(out, "\\U{code:08x}")
                };
            }
        }
    }
    out
}

/// Inverse of [`escape_text`], also accepting octal and the C escapes.
/// Unknown escapes are kept verbatim.
pub fn unescape_text(text: &str) -> Result<String, QuickActionError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((position, ch)) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some((_, escape)) = chars.next() else {
            return Err(QuickActionError::InvalidEscape {
                position,
                reason: "trailing backslash",
            });
        };
        match escape {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{7}'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{b}'),
            'x' | 'u' | 'U' => {
                let width = match escape {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut code = 0u32;
                for _ in 0..width {
                    let digit = chars
                        .next_if(|(_, c)| c.is_ascii_hexdigit())
                        .and_then(|(_, c)| c.to_digit(16))
                        .ok_or(QuickActionError::InvalidEscape {
                            position,
                            reason: "truncated hex escape",
                        })?;
                    code = code * 16 + digit;
                }
                let decoded = char::from_u32(code).ok_or(QuickActionError::InvalidEscape {
                    position,
                    reason: "code point out of range",
                })?;
                out.push(decoded);
            }
            '0'..='7' => {
                let mut code = escape.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.next_if(|(_, c)| matches!(c, '0'..='7')) {
                        Some((_, c)) => code = code * 8 + c.to_digit(8).unwrap_or(0),
                        None => break,
                    }
                }
                let decoded = char::from_u32(code).ok_or(QuickActionError::InvalidEscape {
                    position,
                    reason: "code point out of range",
                })?;
                out.push(decoded);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}
