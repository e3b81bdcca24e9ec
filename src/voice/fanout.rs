//! Bounded, drop-oldest distribution of microphone frames
//!
//! The microphone is the single producer. The wake word listener and the
//! capture service each hold a [`FrameReceiver`]. A consumer that falls more
//! than `capacity` frames behind loses the oldest frames; the producer never
//! waits.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::audio::AudioChunk;

/// Producer side of the frame fan-out
#[derive(Debug, Clone)]
pub struct FrameFanout {
    tx: broadcast::Sender<AudioChunk>,
}

impl FrameFanout {
    /// Create a fan-out buffering at most `capacity` frames per consumer
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a frame to every current consumer
    ///
    /// Returns the number of consumers that will see it.
    pub fn publish(&self, chunk: AudioChunk) -> usize {
        self.tx.send(chunk).unwrap_or(0)
    }

    /// Attach a new consumer; it sees frames published from now on
    #[must_use]
    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Handle that can attach consumers later without keeping the fan-out open
    #[must_use]
    pub fn source(&self) -> FrameSource {
        FrameSource {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of attached receivers, including idle [`FrameSource`] handles
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Factory for [`FrameReceiver`]s
///
/// Holding a source does not keep the producer alive: once the
/// [`FrameFanout`] is dropped, every receiver it hands out reports the end of
/// the stream.
#[derive(Debug)]
pub struct FrameSource {
    rx: broadcast::Receiver<AudioChunk>,
}

impl FrameSource {
    /// Attach a consumer that sees frames published from now on
    #[must_use]
    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.rx.resubscribe(),
            dropped: 0,
        }
    }
}

impl Clone for FrameSource {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
        }
    }
}

/// Consumer side of the frame fan-out
#[derive(Debug)]
pub struct FrameReceiver {
    rx: broadcast::Receiver<AudioChunk>,
    dropped: u64,
}

impl FrameReceiver {
    /// Next frame, skipping over any the consumer was too slow to see
    ///
    /// Returns `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<AudioChunk> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!(
                        dropped = n,
                        total = self.dropped,
                        "slow frame consumer, dropped oldest frames"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Discard anything buffered so the next frame is live
    pub fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Frames lost to lag since this receiver was created
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::audio::SAMPLE_RATE;

    fn chunk(marker: f32) -> AudioChunk {
        AudioChunk::new(vec![marker], SAMPLE_RATE)
    }

    #[tokio::test]
    async fn every_consumer_sees_every_frame() {
        let fanout = FrameFanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        assert_eq!(fanout.publish(chunk(1.0)), 2);

        assert_eq!(a.recv().await.map(|c| c.samples), Some(vec![1.0]));
        assert_eq!(b.recv().await.map(|c| c.samples), Some(vec![1.0]));
    }

    #[tokio::test]
    async fn slow_consumer_loses_oldest_frames() {
        let fanout = FrameFanout::new(2);
        let mut slow = fanout.subscribe();

        for i in 0..5u8 {
            fanout.publish(chunk(f32::from(i)));
        }

        assert_eq!(slow.recv().await.map(|c| c.samples), Some(vec![3.0]));
        assert_eq!(slow.recv().await.map(|c| c.samples), Some(vec![4.0]));
        assert_eq!(slow.dropped(), 3);
    }

    #[tokio::test]
    async fn closed_producer_ends_stream() {
        let fanout = FrameFanout::new(2);
        let mut rx = fanout.subscribe();
        drop(fanout);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn source_does_not_keep_stream_open() {
        let fanout = FrameFanout::new(2);
        let source = fanout.source();
        let mut rx = source.subscribe();

        fanout.publish(chunk(1.0));
        assert_eq!(rx.recv().await.map(|c| c.samples), Some(vec![1.0]));

        drop(fanout);
        assert!(rx.recv().await.is_none());
        assert!(source.subscribe().recv().await.is_none());
    }

    #[test]
    fn publish_without_consumers_is_harmless() {
        let fanout = FrameFanout::new(2);
        assert_eq!(fanout.consumer_count(), 0);
        assert_eq!(fanout.publish(chunk(0.0)), 0);
    }

    #[tokio::test]
    async fn drain_skips_backlog() {
        let fanout = FrameFanout::new(4);
        let mut rx = fanout.subscribe();
        fanout.publish(chunk(1.0));
        fanout.publish(chunk(2.0));
        rx.drain();
        fanout.publish(chunk(3.0));
        assert_eq!(rx.recv().await.map(|c| c.samples), Some(vec![3.0]));
    }
}
