// Copyright 2025-2026 CEMAXECUTER LLC

//! Moves sample blocks from the acquisition queue onto the async side.
//!
//! The consumer channel is bounded too. When the consumer falls behind the
//! block is dropped and counted; the bridge never waits on either side
//! longer than one poll interval, so the acquisition thread is never held
//! up by a slow consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, TryRecvError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use rf_sdr::SampleBlock;

use crate::stats::{should_log_drop, StreamStats};

pub struct StreamBridge {
    queue: Receiver<SampleBlock>,
    consumer: mpsc::Sender<SampleBlock>,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    poll: Duration,
}

impl StreamBridge {
    pub fn new(
        queue: Receiver<SampleBlock>,
        consumer: mpsc::Sender<SampleBlock>,
        running: Arc<AtomicBool>,
        stats: Arc<StreamStats>,
        poll: Duration,
    ) -> Self {
        Self {
            queue,
            consumer,
            running,
            stats,
            poll,
        }
    }

    /// Forward blocks until the stop flag clears, the acquisition side
    /// hangs up, or the consumer goes away. Dropping `self` at the end
    /// closes the consumer channel.
    pub async fn run(self) {
        log::debug!("bridge started");
        while self.running.load(Ordering::SeqCst) {
            match self.queue.try_recv() {
                Ok(block) => {
                    if !self.forward(block) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                Err(TryRecvError::Empty) => tokio::time::sleep(self.poll).await,
                Err(TryRecvError::Disconnected) => {
                    // Whatever was queued before the hang-up is already out.
                    log::debug!("acquisition queue closed");
                    break;
                }
            }
        }
        log::debug!("bridge exiting");
    }

    /// Returns false once the consumer is gone.
    fn forward(&self, block: SampleBlock) -> bool {
        match self.consumer.try_send(block) {
            Ok(()) => {
                self.stats.record_delivered();
                true
            }
            Err(TrySendError::Full(_)) => {
                let drops = self.stats.record_channel_drop();
                if should_log_drop(drops) {
                    log::warn!("consumer channel full, dropped {} block(s) so far", drops);
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("consumer closed, bridge stopping");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use num_complex::Complex32;
    use std::time::SystemTime;

    fn block(sequence: u64) -> SampleBlock {
        SampleBlock {
            samples: vec![Complex32::new(0.0, 0.0); 4],
            center_freq: 100e6,
            sample_rate: 2e6,
            captured_at: SystemTime::now(),
            sequence,
        }
    }

    #[tokio::test]
    async fn test_forwards_in_order_then_closes() {
        let (tx, rx) = bounded(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let stats = Arc::new(StreamStats::default());
        for i in 0..5 {
            tx.send(block(i)).unwrap();
        }
        drop(tx);

        let bridge = StreamBridge::new(rx, out_tx, Arc::new(AtomicBool::new(true)), stats.clone(), Duration::from_millis(1));
        bridge.run().await;

        let mut seen = Vec::new();
        while let Some(b) = out_rx.recv().await {
            seen.push(b.sequence);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(stats.snapshot().delivered, 5);
    }

    #[tokio::test]
    async fn test_full_consumer_drops_and_counts() {
        let (tx, rx) = bounded(16);
        let (out_tx, mut out_rx) = mpsc::channel(2);
        let stats = Arc::new(StreamStats::default());
        for i in 0..10 {
            tx.send(block(i)).unwrap();
        }
        drop(tx);

        StreamBridge::new(rx, out_tx, Arc::new(AtomicBool::new(true)), stats.clone(), Duration::from_millis(1))
            .run()
            .await;

        let mut seen = Vec::new();
        while let Some(b) = out_rx.recv().await {
            seen.push(b.sequence);
        }
        // Nobody read while the bridge ran: the first two fit, the rest drop.
        assert_eq!(seen, vec![0, 1]);
        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.channel_drops, 8);
    }

    #[tokio::test]
    async fn test_consumer_gone_stops_bridge() {
        let (tx, rx) = bounded(4);
        let (out_tx, out_rx) = mpsc::channel(4);
        drop(out_rx);
        tx.send(block(0)).unwrap();
        let running = Arc::new(AtomicBool::new(true));

        tokio::time::timeout(
            Duration::from_secs(1),
            StreamBridge::new(rx, out_tx, running, Arc::new(StreamStats::default()), Duration::from_millis(1)).run(),
        )
        .await
        .expect("bridge should exit when the consumer is dropped");
        // The queue end is dropped with the bridge.
        assert!(tx.send(block(1)).is_err());
    }

    #[tokio::test]
    async fn test_stop_flag_ends_idle_bridge() {
        let (_tx, rx) = bounded::<SampleBlock>(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(
            StreamBridge::new(rx, out_tx, running.clone(), Arc::new(StreamStats::default()), Duration::from_millis(1)).run(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        running.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("bridge should notice the stop flag")
            .unwrap();
    }
}
