//! Lossless word/whitespace tokenizer
//!
//! Source text is split into maximal runs of non-whitespace ("word" tokens)
//! and maximal runs of whitespace ("space" tokens). Concatenating the tokens
//! in order reproduces the line-ending-normalized input exactly, which is what
//! lets a session resume mid-text after a pause or crash.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single token: either a run of non-whitespace or a run of whitespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// True when this token is a word (non-whitespace run)
    pub fn is_word(&self) -> bool {
        self.0.chars().next().is_some_and(|c| !c.is_whitespace())
    }

    /// True when this token is whitespace
    pub fn is_space(&self) -> bool {
        !self.is_word()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalize `\r\n` and lone `\r` to `\n`
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Split text into an ordered, losslessly reconstructible token stream
pub fn tokenize(text: &str) -> Vec<Token> {
    debug!(len = text.len(), "tokenize: called");
    let normalized = normalize_line_endings(text);

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_space = false;

    for c in normalized.chars() {
        let is_space = c.is_whitespace();
        if !current.is_empty() && is_space != current_is_space {
            tokens.push(Token(std::mem::take(&mut current)));
        }
        current_is_space = is_space;
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(Token(current));
    }

    tokens
}

/// Number of word tokens in a stream
pub fn count_words(tokens: &[Token]) -> usize {
    tokens.iter().filter(|t| t.is_word()).count()
}

/// Number of word tokens strictly before `cursor`
///
/// The cursor is the authoritative resumption pointer; the applied word count
/// is always derivable from it.
pub fn words_before(tokens: &[Token], cursor: usize) -> usize {
    count_words(&tokens[..cursor.min(tokens.len())])
}

/// Concatenate a token slice back into text
pub fn join(tokens: &[Token]) -> String {
    tokens.iter().map(Token::as_str).collect()
}
