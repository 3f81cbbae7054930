//! Splitting of rendered SQL text into the individual statements the engine accepts.
//!
//! The engine only accepts a single statement per request, while rendered templates
//! regularly contain several of them, separated by `;`. Conditional templating also leaves
//! behind fragments that only consist of whitespace or comments, which are dropped here so
//! that a blank statement is never sent.

use tracing::{instrument, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LexState {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// A statement candidate together with the same text with all comments removed.
#[derive(Debug, Default)]
struct Fragment {
    text: String,
    code: String,
}

impl Fragment {
    fn into_statement(self) -> Option<String> {
        if self.code.trim().is_empty() {
            trace!(fragment = %self.text, "Skipping statement without any code");
            return None;
        }

        Some(self.text.trim().to_owned())
    }
}

/// Splits `sql` on statement boundaries and returns the executable statements in order.
///
/// Semicolons inside string literals, quoted identifiers and comments are not treated as
/// boundaries. A statement consisting only of whitespace and comments (`-- ...` up to the
/// end of the line, or `/* ... */`) is dropped. The returned statements keep their own
/// comments, only the surrounding whitespace and the separator are removed.
#[instrument(skip(sql))]
pub fn split_statements(sql: &str) -> Vec<String> {
    lex_fragments(sql)
        .into_iter()
        .filter_map(Fragment::into_statement)
        .collect()
}

fn lex_fragments(sql: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut current = Fragment::default();
    let mut state = LexState::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            LexState::Code => match c {
                ';' => {
                    fragments.push(std::mem::take(&mut current));
                    continue;
                }
                '\'' => state = LexState::SingleQuoted,
                '"' => state = LexState::DoubleQuoted,
                '-' if chars.peek() == Some(&'-') => {
                    current.text.push(c);
                    state = LexState::LineComment;
                    continue;
                }
                '/' if chars.peek() == Some(&'*') => {
                    current.text.push(c);
                    if let Some(star) = chars.next() {
                        current.text.push(star);
                    }
                    state = LexState::BlockComment;
                    continue;
                }
                _ => {}
            },
            // Doubled quotes are escapes. They leave and re-enter the quoted state right
            // away, so they need no special handling.
            LexState::SingleQuoted => {
                if c == '\'' {
                    state = LexState::Code;
                }
            }
            LexState::DoubleQuoted => {
                if c == '"' {
                    state = LexState::Code;
                }
            }
            LexState::LineComment => {
                current.text.push(c);
                if c == '\n' {
                    current.code.push(c);
                    state = LexState::Code;
                }
                continue;
            }
            LexState::BlockComment => {
                current.text.push(c);
                if c == '*' && chars.peek() == Some(&'/') {
                    if let Some(slash) = chars.next() {
                        current.text.push(slash);
                    }
                    current.code.push(' ');
                    state = LexState::Code;
                }
                continue;
            }
        }

        current.text.push(c);
        current.code.push(c);
    }
    fragments.push(current);

    fragments
}
