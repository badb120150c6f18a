//! Append-only record of everything the VM printed to its console.

use crate::error::Result;
use regex::Regex;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    bytes: RwLock<Vec<u8>>,
    len: watch::Sender<usize>,
}

/// Console output shared between the capture task (single writer) and any
/// number of readers.
///
/// Each chunk is appended under the write lock, so a reader either sees the
/// whole chunk or none of it.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    inner: Arc<Inner>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                bytes: RwLock::new(Vec::new()),
                len,
            }),
        }
    }

    fn bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner
            .bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a chunk verbatim and notifies subscribers.
    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let len = {
            let mut bytes = self
                .inner
                .bytes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            bytes.extend_from_slice(chunk);
            bytes.len()
        };
        self.inner.len.send_replace(len);
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact, case-sensitive substring test over the whole capture.
    pub fn contains(&self, needle: &str) -> bool {
        find_bytes(&self.bytes(), needle.as_bytes()).is_some()
    }

    /// Returns the byte offset of the first occurrence of `needle` at or
    /// after `start`.
    pub fn find_from(&self, needle: &str, start: usize) -> Option<usize> {
        let bytes = self.bytes();
        let start = start.min(bytes.len());
        find_bytes(&bytes[start..], needle.as_bytes()).map(|pos| pos + start)
    }

    /// Snapshot of the capture as text. Invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// Copy of the raw captured bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().clone()
    }

    /// Returns every non-overlapping match of `pattern` in the capture.
    pub fn matches(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = Regex::new(pattern)?;
        let text = self.text();
        Ok(regex
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .collect())
    }

    /// Receiver that observes the buffer length after every append.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.len.subscribe()
    }

    pub fn clear(&self) {
        self.inner
            .bytes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.len.send_replace(0);
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Incremental marker search that only rescans the suffix appended since
/// the previous call.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: String,
    scanned: usize,
}

impl MarkerScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            scanned: 0,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Returns the offset of the marker if it is present in `buffer`.
    pub fn scan(&mut self, buffer: &CaptureBuffer) -> Option<usize> {
        let bytes = buffer.bytes();
        // A marker may straddle the previous end of the buffer.
        let overlap = self.marker.len().saturating_sub(1);
        let start = self.scanned.saturating_sub(overlap).min(bytes.len());
        let found = find_bytes(&bytes[start..], self.marker.as_bytes()).map(|pos| pos + start);
        self.scanned = bytes.len();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn contains_is_exact_and_case_sensitive() {
        let buffer = CaptureBuffer::new();
        buffer.append(b"Starting network: OK\r\n");
        assert!(buffer.contains("network: OK"));
        assert!(!buffer.contains("Network: OK"));
        assert!(!buffer.contains("network:  OK"));
        assert!(buffer.contains(""));
    }

    #[test]
    fn contains_spans_chunk_boundaries() {
        let buffer = CaptureBuffer::new();
        buffer.append(b"Starting net");
        buffer.append(b"work: OK");
        assert!(buffer.contains("Starting network: OK"));
    }

    #[test]
    fn find_from_skips_earlier_matches() {
        let buffer = CaptureBuffer::new();
        buffer.append(b"# echo hi\nhi\n# ");
        assert_eq!(buffer.find_from("hi", 0), Some(7));
        assert_eq!(buffer.find_from("hi", 8), Some(10));
        assert_eq!(buffer.find_from("hi", 100), None);
    }

    #[test]
    fn matches_returns_all_occurrences() {
        let buffer = CaptureBuffer::new();
        buffer.append(b"BEGIN_SIZE 1 4096 END_SIZE\nnoise\nBEGIN_SIZE 2 8192 END_SIZE\n");
        let sizes = buffer.matches(r"BEGIN_SIZE \d+ \d+ END_SIZE").unwrap();
        assert_eq!(
            sizes,
            vec!["BEGIN_SIZE 1 4096 END_SIZE", "BEGIN_SIZE 2 8192 END_SIZE"]
        );
    }

    #[test]
    fn matches_rejects_invalid_pattern() {
        let buffer = CaptureBuffer::new();
        assert!(matches!(
            buffer.matches("(unclosed"),
            Err(crate::Error::InvalidPattern(_))
        ));
    }

    #[test]
    fn clear_drops_previous_output() {
        let buffer = CaptureBuffer::new();
        buffer.append(b"first run");
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.contains("first"));
    }

    #[test]
    fn scanner_finds_marker_split_across_appends() {
        let buffer = CaptureBuffer::new();
        let mut scanner = MarkerScanner::new("login:");

        buffer.append(b"Welcome\nbuildroot lo");
        assert_eq!(scanner.scan(&buffer), None);

        buffer.append(b"gin: ");
        assert_eq!(scanner.scan(&buffer), Some(18));
    }

    #[test]
    fn scanner_on_empty_buffer() {
        let buffer = CaptureBuffer::new();
        let mut scanner = MarkerScanner::new("x");
        assert_eq!(scanner.scan(&buffer), None);
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let buffer = CaptureBuffer::new();
        let mut rx = buffer.subscribe();
        buffer.append(b"abc");
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("no notification")
            .unwrap();
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn concurrent_readers_never_see_torn_chunks() {
        let buffer = CaptureBuffer::new();
        let chunk = "<0123456789abcdef>";

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    buffer.append(chunk.as_bytes());
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let text = buffer.text();
                        assert_eq!(text.len() % chunk.len(), 0);
                        assert!(text.is_empty() || text.ends_with('>'));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.len(), chunk.len() * 2000);
    }
}
