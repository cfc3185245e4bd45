//! Bounded ring buffer of recent shell output.
//!
//! The ring exists for one purpose: after a resume, the client's screen must
//! match what it showed before the disconnect. It is bounded by a line cap
//! and a byte cap, and evicts whole lines from the head until both
//! hold. It is lossy at the head, never in the middle.
//!
//! Replay ordering: the ring owns the live broadcast sender, and appends
//! publish under the same lock that [`OutputRing::snapshot_and_subscribe`]
//! takes. A resuming socket therefore sees the full buffered history first
//! and the live stream from exactly the snapshot point: no interleave, no
//! duplication, no gap.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Marker byte appended where a single over-long line was truncated.
/// 0x1A is SUB, the ASCII "substitute" control character.
pub const TRUNCATION_MARKER: u8 = 0x1A;

/// Capacity of the live output channel (messages, not bytes). A lagging
/// subscriber loses live frames, never ring history.
const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Inner {
    /// Complete lines, each terminated by `\n`. Oldest at the front.
    lines: VecDeque<Vec<u8>>,
    /// The current unterminated line.
    partial: Vec<u8>,
    /// Set once `partial` hit the byte cap; the rest of that line is
    /// discarded until its newline arrives.
    partial_truncated: bool,
    /// Total bytes held (complete lines + partial).
    bytes: usize,
}

#[derive(Debug)]
pub struct OutputRing {
    max_lines: usize,
    max_bytes: usize,
    tx: broadcast::Sender<Bytes>,
    inner: Mutex<Inner>,
}

impl OutputRing {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        let (tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            max_lines,
            max_bytes,
            tx,
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                partial: Vec::new(),
                partial_truncated: false,
                bytes: 0,
            }),
        }
    }

    /// Append shell output and publish it to live subscribers.
    ///
    /// The publish happens under the ring lock so it is ordered consistently
    /// with snapshots.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for segment in data.split_inclusive(|&b| b == b'\n') {
            self.push_segment(&mut inner, segment);
        }
        self.evict(&mut inner);
        // No receivers is fine; the session may be detached.
        let _ = self.tx.send(Bytes::copy_from_slice(data));
    }

    fn push_segment(&self, inner: &mut Inner, segment: &[u8]) {
        let ends_line = segment.last() == Some(&b'\n');
        let content = if ends_line {
            &segment[..segment.len() - 1]
        } else {
            segment
        };

        if !inner.partial_truncated {
            inner.partial.extend_from_slice(content);
            inner.bytes += content.len();
            // A single line longer than the byte cap is truncated at the
            // tail; the marker and the eventual newline must still fit.
            let cap = self.max_bytes.saturating_sub(2).max(1);
            if inner.partial.len() > cap {
                let dropped = inner.partial.len() - cap;
                inner.partial.truncate(cap);
                inner.partial.push(TRUNCATION_MARKER);
                inner.bytes -= dropped;
                inner.bytes += 1;
                inner.partial_truncated = true;
            }
        }

        if ends_line {
            inner.partial.push(b'\n');
            inner.bytes += 1;
            let line = std::mem::take(&mut inner.partial);
            inner.lines.push_back(line);
            inner.partial_truncated = false;
        }
    }

    /// Drop oldest complete lines until both caps hold.
    fn evict(&self, inner: &mut Inner) {
        while inner.lines.len() > self.max_lines
            || (inner.bytes > self.max_bytes && !inner.lines.is_empty())
        {
            if let Some(line) = inner.lines.pop_front() {
                inner.bytes -= line.len();
            } else {
                break;
            }
        }
    }

    /// Atomically snapshot the buffered history and subscribe to the live
    /// stream. The returned receiver sees every append after the snapshot
    /// and none before it.
    pub fn snapshot_and_subscribe(&self) -> (Bytes, broadcast::Receiver<Bytes>) {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.bytes);
        for line in &inner.lines {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(&inner.partial);
        let rx = self.tx.subscribe();
        (Bytes::from(out), rx)
    }

    /// Release buffered memory. Called at session termination.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lines = VecDeque::new();
        inner.partial = Vec::new();
        inner.partial_truncated = false;
        inner.bytes = 0;
    }

    /// Bytes currently held.
    pub fn len_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Complete lines currently held.
    pub fn len_lines(&self) -> usize {
        self.inner.lock().lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ring: &OutputRing) -> Vec<u8> {
        ring.snapshot_and_subscribe().0.to_vec()
    }

    #[test]
    fn appends_accumulate_in_order() {
        let ring = OutputRing::new(100, 4096);
        ring.append(b"one\n");
        ring.append(b"two\n");
        ring.append(b"three");
        assert_eq!(snapshot(&ring), b"one\ntwo\nthree");
    }

    #[test]
    fn partial_lines_complete_across_appends() {
        let ring = OutputRing::new(100, 4096);
        ring.append(b"hel");
        ring.append(b"lo\nwor");
        ring.append(b"ld\n");
        assert_eq!(snapshot(&ring), b"hello\nworld\n");
        assert_eq!(ring.len_lines(), 2);
    }

    #[test]
    fn line_cap_evicts_oldest() {
        let ring = OutputRing::new(3, 4096);
        for i in 0..5 {
            ring.append(format!("line-{i}\n").as_bytes());
        }
        assert_eq!(ring.len_lines(), 3);
        assert_eq!(snapshot(&ring), b"line-2\nline-3\nline-4\n");
    }

    #[test]
    fn byte_cap_evicts_oldest() {
        let ring = OutputRing::new(1000, 16);
        ring.append(b"aaaa\n"); // 5 bytes
        ring.append(b"bbbb\n"); // 10
        ring.append(b"cccc\n"); // 15
        ring.append(b"dddd\n"); // would be 20 -> evict from head
        assert!(ring.len_bytes() <= 16, "bytes = {}", ring.len_bytes());
        let snap = snapshot(&ring);
        assert!(snap.ends_with(b"dddd\n"));
        assert!(!snap.starts_with(b"aaaa"));
    }

    #[test]
    fn caps_hold_under_mixed_writes() {
        let ring = OutputRing::new(10, 64);
        for i in 0..100 {
            ring.append(format!("chunk {i} with some text\n").as_bytes());
            assert!(ring.len_lines() <= 10);
            assert!(ring.len_bytes() <= 64);
        }
    }

    #[test]
    fn single_long_line_is_truncated_with_marker() {
        let ring = OutputRing::new(10, 32);
        ring.append(&[b'x'; 100]);
        let snap = snapshot(&ring);
        assert!(snap.len() <= 32);
        assert_eq!(*snap.last().unwrap(), TRUNCATION_MARKER);
    }

    #[test]
    fn truncated_line_discards_tail_until_newline() {
        let ring = OutputRing::new(10, 32);
        ring.append(&[b'x'; 100]);
        ring.append(&[b'y'; 100]); // same line, still discarded
        ring.append(b"z\n"); // completes the truncated line
        let snap = snapshot(&ring);
        let text = String::from_utf8_lossy(&snap);
        assert!(!text.contains('y'), "discarded tail leaked: {text:?}");
        assert!(!text.contains('z'), "discarded tail leaked: {text:?}");
        assert!(snap.ends_with(&[TRUNCATION_MARKER, b'\n']));

        // After the newline, appends accumulate normally (the oversized
        // line is evicted to satisfy the byte cap).
        ring.append(b"next\n");
        assert_eq!(snapshot(&ring), b"next\n");
    }

    #[test]
    fn replay_is_contiguous_suffix_of_input() {
        let ring = OutputRing::new(5, 4096);
        let mut all = Vec::new();
        for i in 0..20 {
            let chunk = format!("entry number {i}\n");
            all.extend_from_slice(chunk.as_bytes());
            ring.append(chunk.as_bytes());
        }
        let snap = snapshot(&ring);
        // Whatever survives is an in-order, gap-free suffix of the input.
        assert!(all.ends_with(&snap), "snapshot is not a suffix of the input");
    }

    #[tokio::test]
    async fn subscriber_sees_appends_after_snapshot_only() {
        let ring = OutputRing::new(100, 4096);
        ring.append(b"before\n");
        let (snap, mut rx) = ring.snapshot_and_subscribe();
        assert_eq!(snap.as_ref(), b"before\n");

        ring.append(b"after\n");
        let live = rx.recv().await.unwrap();
        assert_eq!(live.as_ref(), b"after\n");
        // Nothing else pending: the pre-snapshot bytes never hit the channel.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_stream_carries_raw_chunks() {
        let ring = OutputRing::new(2, 16);
        let (_, mut rx) = ring.snapshot_and_subscribe();
        // Live forwarding is verbatim even when the ring truncates.
        let big = vec![b'q'; 64];
        ring.append(&big);
        let live = rx.recv().await.unwrap();
        assert_eq!(live.len(), 64);
    }

    #[test]
    fn clear_releases_everything() {
        let ring = OutputRing::new(100, 4096);
        ring.append(b"data\nmore\n");
        ring.clear();
        assert_eq!(ring.len_bytes(), 0);
        assert_eq!(ring.len_lines(), 0);
        assert!(snapshot(&ring).is_empty());
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let ring = OutputRing::new(100, 4096);
        ring.append(b"");
        assert_eq!(ring.len_bytes(), 0);
    }
}
