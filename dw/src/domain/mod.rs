//! Domain types for DripWriter
//!
//! Core domain types: Session and its token stream.

mod id;
mod session;
mod token;

pub use id::{generate_id, short_id};
pub use session::{ProgressCommit, Session, SessionStatus, StatusTransition, StatusView};
pub use token::{Token, count_words, join, normalize_line_endings, tokenize, words_before};
