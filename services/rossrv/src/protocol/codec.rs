//! Sentence framing codec
//!
//! Wire format: each non-empty word is a 4-byte big-endian length prefix
//! followed by that many UTF-8 bytes; a zero-length block terminates the
//! sentence. Decoding runs as a streaming state machine over an
//! accumulating buffer so it tolerates arbitrary TCP fragmentation: an
//! incomplete length or word is never an error, only a signal to wait for
//! more bytes.

use bytes::{Buf, BufMut, BytesMut};

use super::sentence::Sentence;
use crate::error::{RosSrvError, Result};

/// Upper bound on a single word to catch desynchronized streams before an
/// allocation of garbage length bytes.
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a sentence into length-prefixed words plus terminator
pub fn encode_sentence(sentence: &Sentence, dst: &mut BytesMut) {
    for word in sentence.words() {
        let bytes = word.as_bytes();
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(bytes);
    }
    // Zero-length word closes the sentence
    dst.put_u32(0);
}

/// Convenience wrapper returning an owned buffer
pub fn encode_to_vec(sentence: &Sentence) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_sentence(sentence, &mut buf);
    buf.to_vec()
}

/// Streaming sentence decoder.
///
/// Callers feed inbound chunks with [`SentenceDecoder::extend`] and drain
/// complete sentences with [`SentenceDecoder::next_sentence`] in a loop;
/// one chunk may complete zero, one, or many sentences.
#[derive(Debug, Default)]
pub struct SentenceDecoder {
    buffer: BytesMut,
    /// Words of the sentence currently being assembled
    partial: Vec<String>,
}

impl SentenceDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            partial: Vec::new(),
        }
    }

    /// Append inbound bytes to the accumulation buffer
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to decode the next complete sentence.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full
    /// sentence; the already-consumed words stay staged in `partial` and
    /// decoding resumes where it stopped on the next call.
    pub fn next_sentence(&mut self) -> Result<Option<Sentence>> {
        loop {
            if self.buffer.len() < 4 {
                return Ok(None);
            }

            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len == 0 {
                // Terminator: sentence complete
                self.buffer.advance(4);
                let words = std::mem::take(&mut self.partial);
                return Ok(Some(Sentence::from_words(words)));
            }

            if len > MAX_WORD_LEN {
                return Err(RosSrvError::ProtocolError(format!(
                    "Word length {len} exceeds limit, stream is desynchronized"
                )));
            }

            if self.buffer.len() < 4 + len {
                // Word not fully buffered yet; wait for more bytes
                return Ok(None);
            }

            self.buffer.advance(4);
            let raw = self.buffer.split_to(len);
            let word = String::from_utf8(raw.to_vec())
                .map_err(|e| RosSrvError::ProtocolError(format!("Invalid UTF-8 word: {e}")))?;
            self.partial.push(word);
        }
    }

    /// Drain every complete sentence currently buffered
    pub fn drain_sentences(&mut self) -> Result<Vec<Sentence>> {
        let mut out = Vec::new();
        while let Some(sentence) = self.next_sentence()? {
            out.push(sentence);
        }
        Ok(out)
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
