//! Incremental bytes-to-text decoding (the `string_decoder` behavior).
//!
//! Multi-byte sequences split across chunk boundaries are held back until the
//! rest arrives, so a readable with an encoding never emits half a character.

use crate::chunk::Encoding;
use base64::{Engine as _, engine::general_purpose};

/// Incremental decoder for one stream.
#[derive(Debug, Clone)]
pub struct StringDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl StringDecoder {
    /// Create a decoder for the given encoding. `Buffer` decodes as UTF-8.
    pub fn new(encoding: Encoding) -> Self {
        let encoding = match encoding {
            Encoding::Buffer => Encoding::Utf8,
            other => other,
        };
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    /// Encoding this decoder produces.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Number of bytes held back waiting for the rest of a sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode as much of `bytes` as forms complete characters.
    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 | Encoding::Buffer => {
                self.pending.extend_from_slice(bytes);
                let keep = incomplete_utf8_tail(&self.pending);
                let split = self.pending.len() - keep;
                let tail = self.pending.split_off(split);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = tail;
                text
            }
            Encoding::Base64 => {
                self.pending.extend_from_slice(bytes);
                let split = self.pending.len() - self.pending.len() % 3;
                let tail = self.pending.split_off(split);
                let text = general_purpose::STANDARD.encode(&self.pending);
                self.pending = tail;
                text
            }
            Encoding::Hex | Encoding::Latin1 => self.encoding.decode(bytes),
        }
    }

    /// Flush whatever is held back.
    pub fn end(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return String::new();
        }
        match self.encoding {
            Encoding::Base64 => general_purpose::STANDARD.encode(&rest),
            _ => String::from_utf8_lossy(&rest).into_owned(),
        }
    }
}

/// Length of a trailing UTF-8 sequence that is not yet complete.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = StringDecoder::new(Encoding::Utf8);
        let euro = "€".as_bytes();

        assert_eq!(decoder.write(&[b'a', euro[0]]), "a");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.write(&euro[1..2]), "");
        assert_eq!(decoder.write(&euro[2..]), "€");
        assert_eq!(decoder.end(), "");
    }

    #[test]
    fn test_utf8_incomplete_at_end_is_lossy() {
        let mut decoder = StringDecoder::new(Encoding::Utf8);
        assert_eq!(decoder.write(&[0xE2, 0x82]), "");
        assert_eq!(decoder.end(), "\u{FFFD}");
    }

    #[test]
    fn test_base64_groups() {
        let mut decoder = StringDecoder::new(Encoding::Base64);
        assert_eq!(decoder.write(b"he"), "");
        assert_eq!(decoder.write(b"llo"), "aGVs");
        assert_eq!(decoder.end(), "bG8=");
    }

    #[test]
    fn test_hex_is_stateless() {
        let mut decoder = StringDecoder::new(Encoding::Hex);
        assert_eq!(decoder.write(b"\x01\xff"), "01ff");
        assert_eq!(decoder.end(), "");
    }
}
