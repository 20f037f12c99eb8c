//! The bounded data stream delivered to callers while `Connected`.
//!
//! Notification payloads arrive off the platform's delegate queue faster
//! than a slow consumer may drain them. The stream is backed by a bounded
//! channel with drop-newest-when-full semantics: once full, a fresh chunk
//! is discarded rather than applying backpressure to the delegate queue,
//! which would risk reordering or stalling other callbacks on the same
//! queue.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use tokio::sync::mpsc;
use tracing::warn;

/// The producer half, held by the state machine and handed to the
/// delegate bridge for the lifetime of a single `Connected` phase.
pub type DataProducer = mpsc::Sender<Bytes>;

/// The consumer half, returned to the facade caller.
///
/// Implements [`Stream`]; polling after the producer is dropped (phase
/// left `Connected`) yields `None`, ending the stream.
pub struct DataStream {
    receiver: mpsc::Receiver<Bytes>,
}

impl DataStream {
    /// Create a bounded producer/consumer pair with capacity `chunks`.
    pub fn channel(chunks: usize) -> (DataProducer, Self) {
        let (tx, rx) = mpsc::channel(chunks);
        (tx, Self { receiver: rx })
    }
}

impl Stream for DataStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

/// Publish `chunk` to `producer`, dropping it (and logging) rather than
/// blocking if the bounded buffer is full.
pub fn publish(producer: &DataProducer, chunk: Bytes) {
    if let Err(mpsc::error::TrySendError::Full(_)) = producer.try_send(chunk) {
        warn!("data stream buffer full, dropping notification chunk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (tx, mut rx) = DataStream::channel(4);
        publish(&tx, Bytes::from_static(b"hello"));
        assert_eq!(rx.next().await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_stream_ends_when_producer_dropped() {
        let (tx, mut rx) = DataStream::channel(4);
        drop(tx);
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_newest_chunk() {
        let (tx, mut rx) = DataStream::channel(1);
        publish(&tx, Bytes::from_static(b"first"));
        publish(&tx, Bytes::from_static(b"second"));
        assert_eq!(rx.next().await, Some(Bytes::from_static(b"first")));
        // The second chunk was dropped, not queued.
        drop(tx);
        assert_eq!(rx.next().await, None);
    }
}
