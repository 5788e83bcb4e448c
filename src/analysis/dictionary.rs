//! Dictionary segmenter using forward maximum matching.
//!
//! The dictionary file holds one entry per line; only the first
//! whitespace-separated column is used, so `word freq tag` files load as-is.
//! Blank lines and lines starting with `#` are skipped.

use super::{ProcessError, TextProcessor};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Dictionary loading errors.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("failed to read dictionary '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dictionary '{}' contains no words", .0.display())]
    Empty(PathBuf),
    #[error("dictionary analyzer requires a dictionary path")]
    NoPath,
}

/// Word list plus the longest entry, in chars.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    words: HashSet<String>,
    max_word_chars: usize,
}

impl Dictionary {
    /// Load a dictionary file.
    pub fn load(path: &Path) -> Result<Self, DictionaryError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DictionaryError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let dict = Self::from_words(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter_map(|line| line.split_whitespace().next()),
        );

        if dict.is_empty() {
            return Err(DictionaryError::Empty(path.to_path_buf()));
        }

        info!(
            path = %path.display(),
            words = dict.len(),
            max_word_chars = dict.max_word_chars,
            "Dictionary loaded"
        );
        Ok(dict)
    }

    /// Build a dictionary from an in-memory word list.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dict = Self::default();
        for word in words {
            let word = word.into();
            let chars = word.chars().count();
            if chars == 0 {
                continue;
            }
            dict.max_word_chars = dict.max_word_chars.max(chars);
            dict.words.insert(word);
        }
        dict
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Segment `text` and return the char length of every unit.
    pub fn segment(&self, text: &str) -> Vec<usize> {
        // Byte offset of every char boundary, including the end of input.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let chars: Vec<char> = text.chars().collect();

        let mut units = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }

            if c.is_ascii_alphanumeric() {
                let run = chars[i..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .count();
                units.push(run);
                i += run;
                continue;
            }

            let longest = self.max_word_chars.min(chars.len() - i);
            let matched = (2..=longest)
                .rev()
                .find(|&n| self.words.contains(&text[bounds[i]..bounds[i + n]]))
                .unwrap_or(1);
            units.push(matched);
            i += matched;
        }
        units
    }
}

impl TextProcessor for Dictionary {
    fn process(&self, text: &str) -> Result<Vec<usize>, ProcessError> {
        Ok(self.segment(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Dictionary {
        Dictionary::from_words(["南京", "南京市", "市长", "长江", "长江大桥", "大桥"])
    }

    #[test]
    fn test_longest_match_wins() {
        assert_eq!(sample().segment("南京市长江大桥"), vec![3, 4]);
    }

    #[test]
    fn test_unknown_chars_are_single_units() {
        assert_eq!(sample().segment("我到南京"), vec![1, 1, 2]);
    }

    #[test]
    fn test_ascii_runs_and_whitespace() {
        assert_eq!(sample().segment("CEO 在南京 2024"), vec![3, 1, 2, 4]);
        assert!(sample().segment("  ").is_empty());
    }

    #[test]
    fn test_deterministic() {
        let dict = sample();
        let text = "南京市长江大桥很长";
        assert_eq!(dict.segment(text), dict.segment(text));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "南京市 100 ns").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "长江大桥 50 n").unwrap();

        let dict = Dictionary::load(file.path()).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.process("南京市长江大桥").unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_load_errors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            Dictionary::load(file.path()),
            Err(DictionaryError::Empty(_))
        ));

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            Dictionary::load(&missing),
            Err(DictionaryError::Read { .. })
        ));
    }
}
