//! Ordered queue of chunks waiting to be read.

use crate::chunk::{Chunk, Encoding};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Read buffer of a readable stream.
///
/// `len()` is always the sum of the per-chunk contributions: bytes (or
/// characters for text) in byte mode, one per chunk in object mode.
#[derive(Debug, Clone, Default)]
pub struct BufferList {
    chunks: VecDeque<Chunk>,
    length: usize,
    object_mode: bool,
}

impl BufferList {
    /// Create an empty list for the given mode.
    pub fn new(object_mode: bool) -> Self {
        Self {
            chunks: VecDeque::new(),
            length: 0,
            object_mode,
        }
    }

    /// Append a chunk at the tail.
    pub fn push(&mut self, chunk: Chunk) {
        self.length += chunk.len_in(self.object_mode);
        self.chunks.push_back(chunk);
    }

    /// Prepend a chunk at the head.
    pub fn unshift(&mut self, chunk: Chunk) {
        self.length += chunk.len_in(self.object_mode);
        self.chunks.push_front(chunk);
    }

    /// Remove and return the head chunk.
    pub fn shift(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.pop_front()?;
        self.length -= chunk.len_in(self.object_mode);
        Some(chunk)
    }

    /// Borrow the head chunk.
    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    /// Drop every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.length = 0;
    }

    /// Total contribution of all chunks.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Number of chunks.
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the list holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Iterate over the chunks head first.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Remove exactly `n` units from the front.
    ///
    /// The head is split in place when `n` falls inside it. With `as_string`
    /// the result is text, otherwise bytes. In object mode one whole chunk is
    /// removed regardless of `n`.
    pub fn consume(&mut self, n: usize, as_string: bool) -> Option<Chunk> {
        if self.object_mode {
            return self.shift();
        }
        let head_len = self.first()?.byte_mode_len();
        if n < head_len {
            let head = self.chunks.front_mut()?;
            let taken = split_chunk_front(head, n);
            self.length -= n;
            return Some(taken);
        }
        if n == head_len {
            return self.shift();
        }
        if as_string {
            Some(Chunk::Text(self.take_string(n)))
        } else {
            Some(Chunk::Bytes(self.take_bytes(n)))
        }
    }

    /// Materialize the whole list into one contiguous byte buffer.
    pub fn concat(&self, total_len: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(total_len);
        for chunk in &self.chunks {
            match chunk {
                Chunk::Bytes(b) => out.extend_from_slice(b),
                Chunk::Text(s) => out.extend_from_slice(s.as_bytes()),
                Chunk::Value(v) => out.extend_from_slice(v.to_string().as_bytes()),
            }
        }
        out.freeze()
    }

    /// Materialize the whole list into one string.
    pub fn join(&self, separator: &str) -> String {
        let parts: Vec<String> = self
            .chunks
            .iter()
            .map(|chunk| chunk.to_text(Encoding::Utf8))
            .collect();
        parts.join(separator)
    }

    fn take_string(&mut self, mut n: usize) -> String {
        let mut out = String::new();
        while n > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let len = head.byte_mode_len();
            if n < len {
                let part = split_chunk_front(head, n);
                out.push_str(&part.to_text(Encoding::Utf8));
                self.length -= n;
                break;
            }
            if let Some(chunk) = self.shift() {
                out.push_str(&chunk.to_text(Encoding::Utf8));
            }
            n -= len;
        }
        out
    }

    fn take_bytes(&mut self, mut n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n);
        while n > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let len = head.byte_mode_len();
            if n < len {
                let part = split_chunk_front(head, n);
                out.extend_from_slice(&part.to_bytes(Encoding::Utf8).unwrap_or_default());
                self.length -= n;
                break;
            }
            if let Some(chunk) = self.shift() {
                out.extend_from_slice(&chunk.to_bytes(Encoding::Utf8).unwrap_or_default());
            }
            n -= len;
        }
        out.freeze()
    }
}

/// Split off the first `n` units of a byte-mode chunk, leaving the rest.
fn split_chunk_front(chunk: &mut Chunk, n: usize) -> Chunk {
    match chunk {
        Chunk::Bytes(b) => Chunk::Bytes(b.split_to(n)),
        Chunk::Text(s) => {
            let at = s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len());
            let rest = s.split_off(at);
            Chunk::Text(std::mem::replace(s, rest))
        }
        Chunk::Value(_) => chunk.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Chunk {
        Chunk::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_partial_consume_splits_head() {
        let mut list = BufferList::new(false);
        list.push(bytes("ab"));
        list.push(bytes("cde"));
        assert_eq!(list.len(), 5);

        let taken = list.consume(4, false).unwrap();
        assert_eq!(taken, bytes("abcd"));
        assert_eq!(list.count(), 1);
        assert_eq!(list.first(), Some(&bytes("e")));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_consume_inside_head() {
        let mut list = BufferList::new(false);
        list.push(bytes("hello"));
        assert_eq!(list.consume(2, false), Some(bytes("he")));
        assert_eq!(list.first(), Some(&bytes("llo")));
        assert_eq!(list.len(), 3);
        assert_eq!(list.consume(3, false), Some(bytes("llo")));
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_consume_text_on_char_boundaries() {
        let mut list = BufferList::new(false);
        list.push(Chunk::from("héllo"));
        list.push(Chunk::from("wörld"));
        assert_eq!(list.len(), 10);

        assert_eq!(list.consume(2, true), Some(Chunk::from("hé")));
        assert_eq!(list.consume(5, true), Some(Chunk::from("llowö")));
        assert_eq!(list.len(), 3);
        assert_eq!(list.join(""), "rld");
    }

    #[test]
    fn test_object_mode_counts_chunks() {
        let mut list = BufferList::new(true);
        list.push(Chunk::from(serde_json::json!({"a": 1})));
        list.push(bytes("long payload"));
        assert_eq!(list.len(), 2);

        assert_eq!(list.consume(5, false), Some(Chunk::from(serde_json::json!({"a": 1}))));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_unshift_shift_concat() {
        let mut list = BufferList::new(false);
        list.push(bytes("world"));
        list.unshift(bytes("hello "));
        assert_eq!(list.concat(list.len()), Bytes::from_static(b"hello world"));
        assert_eq!(list.join("|"), "hello |world");

        assert_eq!(list.shift(), Some(bytes("hello ")));
        assert_eq!(list.len(), 5);
        list.clear();
        assert_eq!(list.len(), 0);
        assert!(list.shift().is_none());
    }
}
