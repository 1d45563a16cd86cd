//! Model to encoding mapping.

use serde::{Deserialize, Serialize};
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer as TiktokenModel};

/// Tokenizer encoding type
///
/// Different models use different tokenizers. The encoding type determines
/// which BPE table counts a model's tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// GPT-3 era encoding
    R50kBase,
    /// Codex / text-davinci-00x encoding
    P50kBase,
    /// GPT-3.5 and GPT-4 encoding
    Cl100kBase,
    /// GPT-4o, o1, o3 encoding
    O200kBase,
}

impl Encoding {
    /// Encoding used by a model name, if the model is known.
    ///
    /// Accepts provider-prefixed ids such as `openai/gpt-4o`.
    ///
    /// # Examples
    /// ```
    /// use gpt_meter::tokenizer::Encoding;
    ///
    /// assert_eq!(Encoding::for_model("gpt-4o"), Some(Encoding::O200kBase));
    /// assert_eq!(Encoding::for_model("gpt-4-0613"), Some(Encoding::Cl100kBase));
    /// assert_eq!(Encoding::for_model("llama-3"), None);
    /// ```
    pub fn for_model(model: &str) -> Option<Self> {
        let model = model.rsplit('/').next().unwrap_or(model);
        let encoding = match get_tokenizer(model)? {
            TiktokenModel::Cl100kBase => Encoding::Cl100kBase,
            TiktokenModel::P50kBase | TiktokenModel::P50kEdit => Encoding::P50kBase,
            TiktokenModel::R50kBase | TiktokenModel::Gpt2 => Encoding::R50kBase,
            TiktokenModel::O200kBase => Encoding::O200kBase,
            // Newer tiktoken tables (o200k_harmony) share the o200k vocabulary
            #[allow(unreachable_patterns)]
            _ => Encoding::O200kBase,
        };
        Some(encoding)
    }

    /// Get encoding name as string
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::R50kBase => "r50k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::O200kBase => "o200k_base",
        }
    }
}
