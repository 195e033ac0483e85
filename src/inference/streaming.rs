//! Streaming inference support
//!
//! Token pieces arrive as raw bytes and a multi-byte character may straddle two
//! tokens. [`Utf8Assembler`] holds bytes back until they decode, so every
//! fragment handed to the caller is complete UTF-8.

/// Result of one generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Newly completed text
    Text(String),
    /// A token was consumed but no complete character is available yet
    Pending,
    /// The turn is over; further calls keep returning this
    EndOfTurn,
}

/// Represents a message emitted by the worker while streaming a turn.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed successfully
    Done,
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Buffers token bytes until they form complete characters and keeps the text
/// of the current assistant turn.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
    assembled: String,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token's bytes and returns whatever text is now complete.
    ///
    /// A truncated sequence at the end of the buffer is held back for the next
    /// token. Bytes that can never start a valid sequence are replaced with
    /// U+FFFD so one bad piece cannot stall the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            tracing::warn!("Replacing {} invalid UTF-8 byte(s) in token stream", bad);
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();

        if text.is_empty() {
            None
        } else {
            self.assembled.push_str(&text);
            Some(text)
        }
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Text emitted since the last clear.
    pub fn assembled(&self) -> &str {
        &self.assembled
    }

    /// Drops any partial character, keeping the assembled text.
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} incomplete UTF-8 byte(s)", self.pending.len());
            self.pending.clear();
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.assembled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"Hello"), Some("Hello".to_string()));
        assert_eq!(assembler.push(b", world"), Some(", world".to_string()));
        assert_eq!(assembler.assembled(), "Hello, world");
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_split_codepoint_is_held_back() {
        let mut assembler = Utf8Assembler::new();
        let euro = "€".as_bytes();

        assert_eq!(assembler.push(&euro[..1]), None);
        assert_eq!(assembler.pending_len(), 1);
        assert_eq!(assembler.push(&euro[1..]), Some("€".to_string()));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_emoji_split_three_ways() {
        let mut assembler = Utf8Assembler::new();
        let emoji = "🦀".as_bytes();

        assert_eq!(assembler.push(&emoji[..1]), None);
        assert_eq!(assembler.push(&emoji[1..3]), None);
        assert_eq!(assembler.push(&emoji[3..]), Some("🦀".to_string()));
    }

    #[test]
    fn test_complete_prefix_emitted_before_partial_tail() {
        let mut assembler = Utf8Assembler::new();
        let mut bytes = b"ok ".to_vec();
        bytes.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(assembler.push(&bytes), Some("ok ".to_string()));
        assert_eq!(assembler.push(&"é".as_bytes()[1..]), Some("é".to_string()));
        assert_eq!(assembler.assembled(), "ok é");
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[b'a', 0xFF, b'b']), Some("a\u{FFFD}b".to_string()));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_clear_and_discard() {
        let mut assembler = Utf8Assembler::new();
        assembler.push(b"text");
        assembler.push(&[0xE2]);
        assembler.discard_pending();
        assert_eq!(assembler.pending_len(), 0);
        assert_eq!(assembler.assembled(), "text");

        assembler.clear();
        assert_eq!(assembler.assembled(), "");
    }

    #[test]
    fn test_stream_token_variants() {
        let token = StreamToken::Token("hello".to_string());
        assert!(token.is_token());
        assert!(!token.is_done());
        assert_eq!(token.as_token(), Some("hello"));

        assert!(StreamToken::Done.is_done());
        assert!(StreamToken::Error("boom".to_string()).is_error());
    }
}
