//! Per-stream receive buffers
//!
//! Ordered streams pass frames through a [`ReorderQueue`] before the bytes
//! reach a [`BytePipe`]; unordered streams hand each payload straight to a
//! [`DatagramPipe`].

use super::frame::{Closing, Frame};
use super::pipe::{BytePipe, DatagramPipe};
use super::TunnelError;
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Common contract of the receive buffers
#[async_trait]
pub trait RecvBuffer: Send + Sync {
    /// Deliver a frame; `Ok(true)` when the frame closes the stream
    async fn write(&self, frame: Frame) -> Result<bool, TunnelError>;

    /// Read buffered payload; `ClosedPipe` once closed and drained
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    fn close(&self);

    fn set_read_deadline(&self, deadline: Option<Instant>);
}

/// What one incoming frame released
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Payloads now in sequence, oldest first
    pub payloads: Vec<Bytes>,
    /// A closing frame was reached in sequence
    pub close: bool,
}

struct Pending(Frame);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.seq.cmp(&other.0.seq)
    }
}

/// Min-heap of out-of-order frames keyed by sequence number
#[derive(Default)]
pub struct ReorderQueue {
    next_seq: u64,
    heap: BinaryHeap<Reverse<Pending>>,
}

impl ReorderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Frames held back waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    pub fn push(&mut self, frame: Frame) -> Delivery {
        let mut delivery = Delivery::default();
        if frame.seq < self.next_seq {
            return delivery;
        }
        if frame.seq > self.next_seq {
            self.heap.push(Reverse(Pending(frame)));
            return delivery;
        }

        if self.accept(frame, &mut delivery) {
            return delivery;
        }
        while let Some(Reverse(Pending(top))) = self.heap.peek() {
            if top.seq > self.next_seq {
                break;
            }
            let Some(Reverse(Pending(top))) = self.heap.pop() else {
                break;
            };
            // duplicates of already-emitted frames
            if top.seq < self.next_seq {
                continue;
            }
            if self.accept(top, &mut delivery) {
                break;
            }
        }
        delivery
    }

    /// Emit the in-sequence `frame`; true when it closes the stream
    fn accept(&mut self, frame: Frame, delivery: &mut Delivery) -> bool {
        self.next_seq += 1;
        if frame.closing != Closing::None {
            delivery.close = true;
            return true;
        }
        if !frame.payload.is_empty() {
            delivery.payloads.push(frame.payload);
        }
        false
    }
}

/// Ordered stream buffer
pub struct StreamBuffer {
    sorter: tokio::sync::Mutex<ReorderQueue>,
    pipe: BytePipe,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            sorter: tokio::sync::Mutex::new(ReorderQueue::new()),
            pipe: BytePipe::new(),
        }
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecvBuffer for StreamBuffer {
    async fn write(&self, frame: Frame) -> Result<bool, TunnelError> {
        // held across the pipe writes so concurrent read loops cannot interleave
        let mut sorter = self.sorter.lock().await;
        let delivery = sorter.push(frame);
        for payload in &delivery.payloads {
            self.pipe.write(payload).await?;
        }
        Ok(delivery.close)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.pipe.read(buf).await
    }

    fn close(&self) {
        self.pipe.close();
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.pipe.set_read_deadline(deadline);
    }
}

/// Unordered stream buffer; duplicates are not filtered
pub struct DatagramBuffer {
    pipe: DatagramPipe,
}

impl DatagramBuffer {
    pub fn new() -> Self {
        Self {
            pipe: DatagramPipe::new(),
        }
    }
}

impl Default for DatagramBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecvBuffer for DatagramBuffer {
    async fn write(&self, frame: Frame) -> Result<bool, TunnelError> {
        if frame.closing != Closing::None {
            return Ok(true);
        }
        self.pipe.write(frame.payload)?;
        Ok(false)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.pipe.read(buf).await
    }

    fn close(&self) {
        self.pipe.close();
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.pipe.set_read_deadline(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn data(seq: u64) -> Frame {
        Frame::data(1, seq, Bytes::from(seq.to_be_bytes().to_vec()))
    }

    fn flatten(payloads: &[Bytes]) -> Vec<u64> {
        payloads
            .iter()
            .map(|p| u64::from_be_bytes(p[..8].try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_in_order() {
        let mut queue = ReorderQueue::new();
        for seq in 0..5 {
            let delivery = queue.push(data(seq));
            assert_eq!(flatten(&delivery.payloads), vec![seq]);
        }
        assert_eq!(queue.next_seq(), 5);
    }

    #[test]
    fn test_gap_fill() {
        let mut queue = ReorderQueue::new();
        assert!(queue.push(data(2)).payloads.is_empty());
        assert!(queue.push(data(1)).payloads.is_empty());
        assert_eq!(queue.pending(), 2);
        assert_eq!(flatten(&queue.push(data(0)).payloads), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut queue = ReorderQueue::new();
        queue.push(data(0));
        queue.push(data(1));
        assert_eq!(queue.push(data(0)), Delivery::default());
        assert_eq!(queue.push(data(1)), Delivery::default());

        queue.push(data(3));
        queue.push(data(3));
        assert_eq!(flatten(&queue.push(data(2)).payloads), vec![2, 3]);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.next_seq(), 4);
    }

    #[test]
    fn test_close_in_sequence() {
        let mut queue = ReorderQueue::new();
        let close = Frame::closing(1, 2, Closing::ClosingStream);
        assert!(!queue.push(close).close);

        let delivery = queue.push(data(1));
        assert!(!delivery.close);
        let delivery = queue.push(data(0));
        assert_eq!(flatten(&delivery.payloads), vec![0, 1]);
        assert!(delivery.close);
    }

    proptest! {
        #[test]
        fn prop_any_permutation_delivers_in_order(
            order in Just((0u64..40).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let mut queue = ReorderQueue::new();
            let mut out = Vec::new();
            for seq in order {
                out.extend(flatten(&queue.push(data(seq)).payloads));
            }
            prop_assert_eq!(out, (0u64..40).collect::<Vec<_>>());
            prop_assert_eq!(queue.pending(), 0);
        }

        #[test]
        fn prop_stale_frames_change_nothing(stale in 0u64..10) {
            let mut queue = ReorderQueue::new();
            for seq in 0..10 {
                queue.push(data(seq));
            }
            prop_assert_eq!(queue.push(data(stale)), Delivery::default());
            prop_assert_eq!(queue.next_seq(), 10);
        }
    }

    #[tokio::test]
    async fn test_stream_buffer_reorders() {
        let buffer = StreamBuffer::new();
        buffer.write(Frame::data(1, 1, Bytes::from_static(b"world"))).await.unwrap();
        buffer.write(Frame::data(1, 0, Bytes::from_static(b"hello "))).await.unwrap();

        let mut buf = [0u8; 32];
        let n = buffer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");

        assert!(buffer.write(Frame::closing(1, 2, Closing::ClosingStream)).await.unwrap());
    }

    #[tokio::test]
    async fn test_datagram_buffer() {
        let buffer = DatagramBuffer::new();
        buffer.write(Frame::data(1, 5, Bytes::from_static(b"b"))).await.unwrap();
        buffer.write(Frame::data(1, 4, Bytes::from_static(b"aa"))).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(buffer.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buffer.read(&mut buf).await.unwrap(), 2);
        assert!(buffer.write(Frame::closing(1, 6, Closing::ClosingStream)).await.unwrap());
    }
}
