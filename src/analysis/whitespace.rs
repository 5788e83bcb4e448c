//! Whitespace tokenizer.

use super::{ProcessError, TextProcessor};

/// Splits on Unicode whitespace; each token's length is its char count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Whitespace;

impl TextProcessor for Whitespace {
    fn process(&self, text: &str) -> Result<Vec<usize>, ProcessError> {
        Ok(text.split_whitespace().map(|w| w.chars().count()).collect())
    }
}
