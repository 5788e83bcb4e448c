//! Text analysis collaborators.
//!
//! The reactor only needs one thing from analysis: given a trimmed request,
//! the length of every unit the analyzer detects. Anything implementing
//! [`TextProcessor`] can be plugged in.
//!
//! Built-in analyzers:
//! - `whitespace`: one unit per whitespace-separated token
//! - `dictionary`: forward maximum matching against a word list

mod dictionary;
mod whitespace;

pub use dictionary::{Dictionary, DictionaryError};
pub use whitespace::Whitespace;

use crate::config::{AnalyzerKind, Config};
use thiserror::Error;

/// Failure reported by a [`TextProcessor`].
#[derive(Debug, Error)]
#[error("analysis failed: {0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Turns a request into the lengths of its analysis units.
///
/// Called synchronously on the reactor thread, so a slow implementation
/// delays every other connection for the duration of the call.
pub trait TextProcessor {
    fn process(&self, text: &str) -> Result<Vec<usize>, ProcessError>;
}

impl<F> TextProcessor for F
where
    F: Fn(&str) -> Result<Vec<usize>, ProcessError>,
{
    fn process(&self, text: &str) -> Result<Vec<usize>, ProcessError> {
        self(text)
    }
}

/// Analyzer selected by configuration.
#[derive(Debug)]
pub enum Analyzer {
    Whitespace(Whitespace),
    Dictionary(Dictionary),
}

impl Analyzer {
    /// Build the analyzer named in `config`, loading its dictionary if needed.
    pub fn from_config(config: &Config) -> Result<Self, DictionaryError> {
        match config.analyzer {
            AnalyzerKind::Whitespace => Ok(Analyzer::Whitespace(Whitespace)),
            AnalyzerKind::Dictionary => {
                // Config validation guarantees a path for this analyzer.
                let path = config
                    .dictionary
                    .as_deref()
                    .ok_or(DictionaryError::NoPath)?;
                Ok(Analyzer::Dictionary(Dictionary::load(path)?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Analyzer::Whitespace(_) => "whitespace",
            Analyzer::Dictionary(_) => "dictionary",
        }
    }
}

impl TextProcessor for Analyzer {
    fn process(&self, text: &str) -> Result<Vec<usize>, ProcessError> {
        match self {
            Analyzer::Whitespace(a) => a.process(text),
            Analyzer::Dictionary(a) => a.process(text),
        }
    }
}
