//! A parsed configuration source.

use flow_syntax::{parse_file, File, ParseError};

/// A configuration source: the original text plus its parsed block tree.
///
/// The text is retained because `declare` bodies are republished verbatim,
/// sliced out by the blocks' brace offsets.
#[derive(Debug, Clone)]
pub struct Source {
    text: String,
    file: File,
}

impl Source {
    /// Parse a configuration text.
    ///
    /// # Errors
    ///
    /// Returns the parser's error; nothing is partially loaded.
    pub fn parse(text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into();
        let file = parse_file(&text)?;
        Ok(Self { text, file })
    }

    /// The original source text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let source = Source::parse("counter \"c\" { max = 10 }").unwrap();
        assert_eq!(source.file().body.len(), 1);
        assert!(source.text().contains("max = 10"));
    }

    #[test]
    fn test_parse_error_propagates() {
        assert!(Source::parse("counter \"c\" {").is_err());
    }
}
