//! Token counting for metered calls.
//!
//! The proxy only needs one capability from a tokenizer: turn a text
//! fragment into a count of tokens for the model the caller asked for.
//! [`Tokenizer`] is that capability and [`TokenizerSource`] selects one per
//! model name. [`BpeTokenizers`] backs both with tiktoken encodings.
//!
//! # Supported Encodings
//!
//! - **r50k_base**: GPT-3 (`davinci`, `curie`, ...)
//! - **p50k_base**: Codex and `text-davinci-002/003`
//! - **cl100k_base**: GPT-3.5, GPT-4
//! - **o200k_base**: GPT-4o, o1, o3 models
//!
//! Models that map to none of these have no tokenizer and are rejected
//! before any upstream call is made.
//!
//! # Example
//!
//! ```
//! use gpt_meter::tokenizer::{BpeTokenizers, TokenizerSource};
//!
//! let tokenizer = BpeTokenizers.for_model("gpt-4").unwrap();
//! assert!(tokenizer.count("Hello, world!") > 0);
//! assert!(BpeTokenizers.for_model("not-a-model").is_none());
//! ```

mod counter;
mod encoding;

use std::sync::Arc;

pub use counter::{count_tokens_with_encoding, TokenCounter};
pub use encoding::Encoding;

/// Counts the tokens of a text fragment for one bound model.
pub trait Tokenizer: Send + Sync {
    /// Number of tokens `text` encodes to.
    fn count(&self, text: &str) -> usize;
}

/// Selects the tokenizer for a requested model.
pub trait TokenizerSource: Send + Sync {
    /// Tokenizer for `model`, or `None` when the model is unsupported.
    fn for_model(&self, model: &str) -> Option<Arc<dyn Tokenizer>>;
}

/// Tiktoken-backed tokenizer selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpeTokenizers;

impl TokenizerSource for BpeTokenizers {
    fn for_model(&self, model: &str) -> Option<Arc<dyn Tokenizer>> {
        let encoding = Encoding::for_model(model)?;
        Some(Arc::new(TokenCounter::new(encoding)))
    }
}
