use std::str::FromStr;

use tiktoken_rs::CoreBPE;

use crate::error::{ChatlabelError, Result};

/// Maps text to a token count for some model's tokenization scheme.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    Cl100k,
    O200k,
    P50k,
    /// Four characters per token, no vocabulary needed.
    Heuristic,
}

impl TokenizerKind {
    /// Best-effort tokenizer for a model name.
    pub fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.starts_with("gpt-4o") || lower.starts_with("gpt-4.1") || lower.starts_with("o1")
        {
            TokenizerKind::O200k
        } else if lower.starts_with("gpt-") || lower.starts_with("claude") {
            TokenizerKind::Cl100k
        } else {
            TokenizerKind::Heuristic
        }
    }

    pub fn build(&self) -> Result<Box<dyn TokenEstimator>> {
        let estimator: Box<dyn TokenEstimator> = match self {
            TokenizerKind::Cl100k => Box::new(BpeEstimator::new(
                tiktoken_rs::cl100k_base().map_err(|e| ChatlabelError::Tokenizer(e.to_string()))?,
            )),
            TokenizerKind::O200k => Box::new(BpeEstimator::new(
                tiktoken_rs::o200k_base().map_err(|e| ChatlabelError::Tokenizer(e.to_string()))?,
            )),
            TokenizerKind::P50k => Box::new(BpeEstimator::new(
                tiktoken_rs::p50k_base().map_err(|e| ChatlabelError::Tokenizer(e.to_string()))?,
            )),
            TokenizerKind::Heuristic => Box::new(HeuristicEstimator::default()),
        };
        Ok(estimator)
    }
}

impl FromStr for TokenizerKind {
    type Err = ChatlabelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "cl100k" | "cl100k_base" => Ok(TokenizerKind::Cl100k),
            "o200k" | "o200k_base" => Ok(TokenizerKind::O200k),
            "p50k" | "p50k_base" | "gpt2" => Ok(TokenizerKind::P50k),
            "heuristic" | "chars" => Ok(TokenizerKind::Heuristic),
            other => Err(ChatlabelError::Tokenizer(format!(
                "unknown tokenizer {other}"
            ))),
        }
    }
}

pub struct BpeEstimator {
    bpe: CoreBPE,
}

impl BpeEstimator {
    pub fn new(bpe: CoreBPE) -> Self {
        Self { bpe }
    }
}

impl TokenEstimator for BpeEstimator {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Character-ratio fallback for local models without a known vocabulary.
/// Rounds up so the estimate errs on the large side.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicEstimator {
    chars_per_token: usize,
}

impl HeuristicEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let estimator = HeuristicEstimator::default();
        assert_eq!(estimator.count(""), 0);
        assert_eq!(estimator.count("abc"), 1);
        assert_eq!(estimator.count("abcde"), 2);
    }

    #[test]
    fn cl100k_counts_tokens() {
        let estimator = TokenizerKind::Cl100k.build().unwrap();
        assert_eq!(estimator.count("hello world"), 2);
    }

    #[test]
    fn model_names_pick_tokenizers() {
        assert_eq!(TokenizerKind::for_model("gpt-4o-mini"), TokenizerKind::O200k);
        assert_eq!(TokenizerKind::for_model("gpt-3.5-turbo"), TokenizerKind::Cl100k);
        assert_eq!(TokenizerKind::for_model("llama3.1"), TokenizerKind::Heuristic);
        assert_eq!("o200k".parse::<TokenizerKind>().unwrap(), TokenizerKind::O200k);
        assert!("bogus".parse::<TokenizerKind>().is_err());
    }
}
