//! Token counting implementation.
//!
//! Uses tiktoken-rs for BPE token counting with lazy-loaded encoders.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, o200k_base, p50k_base, r50k_base, CoreBPE};

use super::{Encoding, Tokenizer};

// Lazy-loaded tokenizer instances (thread-safe singletons)
static R50K: OnceLock<CoreBPE> = OnceLock::new();
static P50K: OnceLock<CoreBPE> = OnceLock::new();
static CL100K: OnceLock<CoreBPE> = OnceLock::new();
static O200K: OnceLock<CoreBPE> = OnceLock::new();

fn bpe(encoding: Encoding) -> &'static CoreBPE {
    match encoding {
        Encoding::R50kBase => {
            R50K.get_or_init(|| r50k_base().expect("Failed to load r50k_base tokenizer"))
        },
        Encoding::P50kBase => {
            P50K.get_or_init(|| p50k_base().expect("Failed to load p50k_base tokenizer"))
        },
        Encoding::Cl100kBase => {
            CL100K.get_or_init(|| cl100k_base().expect("Failed to load cl100k_base tokenizer"))
        },
        Encoding::O200kBase => {
            O200K.get_or_init(|| o200k_base().expect("Failed to load o200k_base tokenizer"))
        },
    }
}

/// Count tokens with a specific encoding
///
/// # Example
/// ```
/// use gpt_meter::tokenizer::{count_tokens_with_encoding, Encoding};
///
/// let tokens = count_tokens_with_encoding("Hello!", Encoding::O200kBase);
/// assert!(tokens > 0);
/// ```
pub fn count_tokens_with_encoding(text: &str, encoding: Encoding) -> usize {
    bpe(encoding).encode_with_special_tokens(text).len()
}

/// Tokenizer bound to one encoding
///
/// # Example
/// ```
/// use gpt_meter::tokenizer::{Encoding, TokenCounter, Tokenizer};
///
/// let counter = TokenCounter::new(Encoding::Cl100kBase);
/// let total = counter.count_many(&["Hello", "World"]);
/// assert_eq!(total, counter.count("Hello") + counter.count("World"));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    encoding: Encoding,
}

impl TokenCounter {
    /// Create a new token counter with the specified encoding
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    /// Count tokens in multiple texts
    pub fn count_many(&self, texts: &[&str]) -> usize {
        texts.iter().map(|t| self.count(t)).sum()
    }

    /// Get the encoding used by this counter
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl Tokenizer for TokenCounter {
    fn count(&self, text: &str) -> usize {
        count_tokens_with_encoding(text, self.encoding)
    }
}
