use codeprompt_protocol::{CLIPBOARD_TOKEN, DIRS_TOKEN, FILES_PROVIDED_TOKEN, FILE_CONTENTS_TOKEN};

/// Rendered values for each template token.
#[derive(Debug, Clone, Copy, Default)]
pub struct Substitutions<'a> {
    pub dirs: &'a str,
    pub files_provided: &'a str,
    pub file_contents: &'a str,
    pub clipboard: &'a str,
}

impl<'a> Substitutions<'a> {
    const TOKENS: [&'static str; 4] = [
        DIRS_TOKEN,
        FILES_PROVIDED_TOKEN,
        FILE_CONTENTS_TOKEN,
        CLIPBOARD_TOKEN,
    ];

    fn value(&self, token: &str) -> &'a str {
        match token {
            DIRS_TOKEN => self.dirs,
            FILES_PROVIDED_TOKEN => self.files_provided,
            FILE_CONTENTS_TOKEN => self.file_contents,
            _ => self.clipboard,
        }
    }
}

fn is_section(token: &str) -> bool {
    token != CLIPBOARD_TOKEN
}

/// Substitute every token in one pass over the template.
///
/// A token alone on its line replaces the line, or removes it when the value
/// is empty. A token sharing its line with other text is replaced in place;
/// section tokens preceded by text on that line start on a fresh paragraph.
/// Substituted values are never scanned for tokens again.
pub fn substitute(template: &str, subs: &Substitutions<'_>) -> String {
    let mut out = String::with_capacity(template.len() + subs.file_contents.len());
    let mut first = true;

    for line in template.split('\n') {
        let rendered = match standalone_token(line) {
            Some(token) => {
                let value = subs.value(token);
                if value.is_empty() {
                    None
                } else {
                    Some(line.replacen(token, value, 1))
                }
            }
            None => substitute_inline(line, subs),
        };

        let Some(rendered) = rendered else {
            continue;
        };
        if !first {
            out.push('\n');
        }
        out.push_str(&rendered);
        first = false;
    }

    out
}

fn standalone_token(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    Substitutions::TOKENS
        .into_iter()
        .find(|token| *token == trimmed)
}

/// `None` when the line held only tokens that all rendered empty.
fn substitute_inline(line: &str, subs: &Substitutions<'_>) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    let mut saw_token = false;

    while let Some((at, token)) = next_token(rest) {
        saw_token = true;
        out.push_str(&rest[..at]);
        let value = subs.value(token);
        if !value.is_empty() {
            if is_section(token) && !out.trim().is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(value);
        }
        rest = &rest[at + token.len()..];
    }
    out.push_str(rest);

    if saw_token && out.trim().is_empty() {
        return None;
    }
    Some(out)
}

fn next_token(text: &str) -> Option<(usize, &'static str)> {
    Substitutions::TOKENS
        .into_iter()
        .filter_map(|token| text.find(token).map(|at| (at, token)))
        .min_by_key(|(at, _)| *at)
}

/// Collapse trailing line breaks to exactly one `\n`.
pub fn finish(mut prompt: String) -> String {
    let kept = prompt.trim_end_matches(['\n', '\r']).len();
    prompt.truncate(kept);
    prompt.push('\n');
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subs<'a>(dirs: &'a str, files: &'a str, contents: &'a str) -> Substitutions<'a> {
        Substitutions {
            dirs,
            files_provided: files,
            file_contents: contents,
            clipboard: "",
        }
    }

    #[test]
    fn empty_standalone_token_drops_its_line() {
        let template = "Intro\n   {{files_provided}}  \n{{file_contents}}\nOutro";
        let out = substitute(template, &subs("", "", "BODY"));
        assert_eq!(out, "Intro\nBODY\nOutro");
    }

    #[test]
    fn standalone_token_keeps_surrounding_whitespace_when_filled() {
        let out = substitute("  {{dirs}}", &subs("TREE", "", ""));
        assert_eq!(out, "  TREE");
    }

    #[test]
    fn inline_sections_start_new_paragraphs_after_text() {
        let template = "Your task is to\n\n{{dirs}}{{files_provided}}{{file_contents}}";
        let out = substitute(template, &subs("D", "F", "C"));
        assert_eq!(out, "Your task is to\n\nD\n\nF\n\nC");
    }

    #[test]
    fn inline_empty_sections_vanish() {
        let out = substitute("See {{files_provided}} here", &subs("", "", ""));
        assert_eq!(out, "See  here");
        let out = substitute("x\n{{files_provided}}{{file_contents}}\ny", &subs("", "", ""));
        assert_eq!(out, "x\ny");
    }

    #[test]
    fn clipboard_is_plain_replacement_and_not_rescanned() {
        let s = Substitutions {
            clipboard: "literal {{dirs}}",
            dirs: "TREE",
            ..Substitutions::default()
        };
        let out = substitute("Fix: {{CLIPBOARD}}", &s);
        assert_eq!(out, "Fix: literal {{dirs}}");
    }

    #[test]
    fn finish_collapses_trailing_newlines() {
        assert_eq!(finish("a\n\n\r\n".to_string()), "a\n");
        assert_eq!(finish("a".to_string()), "a\n");
        assert_eq!(finish(String::new()), "\n");
    }
}
