//! Protocol sentence model
//!
//! A sentence is one complete API message: an ordered word sequence where
//! the first word is either a command path (`/login`, `/interface/print`)
//! or a reply marker (`!re`, `!done`, `!trap`, `!fatal`), followed by
//! `key=value` attribute words and `?key=value` query words. The `.tag`
//! attribute correlates a reply with the request that produced it.

use crate::error::{RosSrvError, Result};
use crate::types::Tag;

/// Reply classification taken from a sentence's first word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `!re` - one data record, more may follow
    Data,
    /// `!done` - final reply, closes the command
    Done,
    /// `!trap` - device-reported command failure
    Trap,
    /// `!fatal` - device is closing the connection
    Fatal,
}

/// One complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    words: Vec<String>,
}

impl Sentence {
    /// Create an empty sentence
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create a sentence from pre-built words
    pub fn from_words(words: Vec<String>) -> Self {
        Self { words }
    }

    /// Parse a command string into a sentence.
    ///
    /// The first whitespace-separated token is the command path and must
    /// start with `/`. Remaining tokens pass through as attribute
    /// (`key=value`) or query (`?key=value`) words.
    pub fn from_command(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let path = parts
            .next()
            .ok_or_else(|| RosSrvError::validation("Empty command string"))?;
        if !path.starts_with('/') {
            return Err(RosSrvError::ValidationError(format!(
                "Command path must start with '/': {path}"
            )));
        }

        let mut words = vec![path.to_string()];
        for part in parts {
            if part.starts_with('?') || part.starts_with('=') {
                words.push(part.to_string());
            } else if part.contains('=') {
                words.push(format!("={part}"));
            } else {
                return Err(RosSrvError::ValidationError(format!(
                    "Malformed command word (expected key=value or ?key=value): {part}"
                )));
            }
        }
        Ok(Self { words })
    }

    /// Append a word
    pub fn push(&mut self, word: impl Into<String>) {
        self.words.push(word.into());
    }

    /// Append a `=key=value` attribute word
    pub fn push_attribute(&mut self, key: &str, value: &str) {
        self.words.push(format!("={key}={value}"));
    }

    /// Attach the correlation tag. Every outbound sentence carries one.
    pub fn set_tag(&mut self, tag: Tag) {
        self.words.push(format!(".tag={}", tag.0));
    }

    /// Words of this sentence, terminator excluded
    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// First word, if any
    pub fn first(&self) -> Option<&str> {
        self.words.first().map(String::as_str)
    }

    /// Reply classification, if the first word is a reply marker
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self.first() {
            Some("!re") => Some(ReplyKind::Data),
            Some("!done") => Some(ReplyKind::Done),
            Some("!trap") => Some(ReplyKind::Trap),
            Some("!fatal") => Some(ReplyKind::Fatal),
            _ => None,
        }
    }

    /// Look up an attribute value by key.
    ///
    /// Accepts both `=key=value` (attribute) and `key=value` forms; the
    /// device uses the former, `.tag` uses the bare form.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        let eq_prefix = format!("={key}=");
        let bare_prefix = format!("{key}=");
        self.words.iter().find_map(|w| {
            w.strip_prefix(&eq_prefix)
                .or_else(|| w.strip_prefix(&bare_prefix))
        })
    }

    /// Correlation tag of this sentence, if present
    pub fn tag(&self) -> Option<Tag> {
        self.attribute(".tag")
            .and_then(|v| v.parse::<u32>().ok())
            .map(Tag)
    }

    /// Device message from a `!trap` or `!fatal` reply
    pub fn message(&self) -> Option<&str> {
        self.attribute("message")
    }
}

impl Default for Sentence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_attributes_and_queries() {
        let s = Sentence::from_command("/interface/print ?type=ether stats=yes").unwrap();
        assert_eq!(s.first(), Some("/interface/print"));
        assert_eq!(s.words()[1], "?type=ether");
        assert_eq!(s.words()[2], "=stats=yes");
    }

    #[test]
    fn test_parse_rejects_bad_path() {
        assert!(Sentence::from_command("interface/print").is_err());
        assert!(Sentence::from_command("").is_err());
        assert!(Sentence::from_command("/ping bareword").is_err());
    }

    #[test]
    fn test_tag_roundtrip() {
        let mut s = Sentence::from_command("/system/resource/print").unwrap();
        s.set_tag(Tag(42));
        assert_eq!(s.tag(), Some(Tag(42)));
    }

    #[test]
    fn test_reply_kind_and_message() {
        let re = Sentence::from_words(vec!["!re".into(), "=name=ether1".into()]);
        assert_eq!(re.reply_kind(), Some(ReplyKind::Data));
        assert_eq!(re.attribute("name"), Some("ether1"));

        let trap = Sentence::from_words(vec!["!trap".into(), "=message=no such item".into()]);
        assert_eq!(trap.reply_kind(), Some(ReplyKind::Trap));
        assert_eq!(trap.message(), Some("no such item"));

        let cmd = Sentence::from_command("/login").unwrap();
        assert_eq!(cmd.reply_kind(), None);
    }
}
