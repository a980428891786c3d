//! CAN bus signal transport.
//!
//! [`CanBus`] turns a raw frame adapter into a [`SignalTransport`]:
//!
//! ```text
//! adapter.receive() ──▶ reception worker ──▶ FrameQueue (drop-oldest) ──▶ decoder worker
//!                                                                           │
//!                                                   MessageDatabase::decode ▼
//!                                                                      SignalCache
//! procedures ──▶ write_signals ──▶ tx shadow + encode ──▶ adapter.transmit()
//! ```
//!
//! The reception worker never waits on the decoder or on the sequencer; when the decoder falls
//! behind, the queue discards the oldest frames and counts them.

use super::cache::{FrameQueue, SignalCache};
use super::database::{MessageDatabase, MessageDef, SignalDef};
use super::{CanFrame, SignalSample, SignalTransport};
use crate::error::{EolError, EolResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Back-off after a failed adapter read.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Capability: raw CAN frame I/O
///
/// Implemented by vendor adapter bindings (PCAN, Kvaser, SocketCAN, ...).
#[async_trait]
pub trait CanAdapter: Send + Sync {
    /// Transmit one frame.
    async fn transmit(&self, frame: &CanFrame) -> EolResult<()>;

    /// Wait for the next inbound frame; `Ok(None)` once the adapter is closed.
    async fn receive(&self) -> EolResult<Option<CanFrame>>;

    /// Whether the adapter channel is open.
    fn is_connected(&self) -> bool;
}

/// Signal transport over a [`CanAdapter`] and a [`MessageDatabase`].
pub struct CanBus {
    adapter: Arc<dyn CanAdapter>,
    database: Arc<MessageDatabase>,
    cache: Arc<SignalCache>,
    queue: FrameQueue,
    tx_shadow: Mutex<HashMap<u32, HashMap<String, f64>>>,
    workers: Vec<JoinHandle<()>>,
}

impl CanBus {
    /// Wrap an adapter and spawn the reception and decoder workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        adapter: Arc<dyn CanAdapter>,
        database: MessageDatabase,
        queue_capacity: usize,
    ) -> Self {
        let database = Arc::new(database);
        let cache = Arc::new(SignalCache::new());
        let queue = FrameQueue::new(queue_capacity);

        // Subscribe before the reception worker can push anything.
        let mut frames = queue.subscribe();
        let decoder = {
            let database = Arc::clone(&database);
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    if !database.contains(frame.id) {
                        trace!(id = frame.id, "Ignoring frame without definition");
                        continue;
                    }
                    match database.decode(&frame) {
                        Ok(values) => cache.update(frame.id, values, Utc::now()),
                        Err(e) => debug!(id = frame.id, error = %e, "Frame decode failed"),
                    }
                }
                debug!("Decoder worker stopped");
            })
        };

        let reception = {
            let adapter = Arc::clone(&adapter);
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    match adapter.receive().await {
                        Ok(Some(frame)) => queue.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            if !adapter.is_connected() {
                                warn!(error = %e, "CAN adapter disconnected, reception stopped");
                                break;
                            }
                            debug!(error = %e, "CAN receive error");
                            tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                        }
                    }
                }
                debug!("Reception worker stopped");
            })
        };

        info!(
            messages = database.len(),
            queue_capacity,
            "CAN bus transport started"
        );

        Self {
            adapter,
            database,
            cache,
            queue,
            tx_shadow: Mutex::new(HashMap::new()),
            workers: vec![reception, decoder],
        }
    }

    /// Shared handle to the latest-value cache, for concurrent readers.
    pub fn cache(&self) -> Arc<SignalCache> {
        Arc::clone(&self.cache)
    }

    /// Loaded message database.
    pub fn database(&self) -> &MessageDatabase {
        &self.database
    }

    /// Frames lost to queue overflow since start.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[async_trait]
impl SignalTransport for CanBus {
    async fn send(&self, frame: CanFrame) -> EolResult<()> {
        if !self.adapter.is_connected() {
            return Err(EolError::Unreachable("CAN adapter not connected".into()));
        }
        trace!(id = frame.id, len = frame.data.len(), "Transmit");
        self.adapter.transmit(&frame).await
    }

    async fn write_signals(&self, message_id: u32, values: &[(&str, f64)]) -> EolResult<()> {
        let mut merged = self
            .tx_shadow
            .lock()
            .get(&message_id)
            .cloned()
            .unwrap_or_default();
        for (name, value) in values {
            merged.insert((*name).to_string(), *value);
        }
        let frame = self
            .database
            .encode(message_id, merged.iter().map(|(k, v)| (k.as_str(), *v)))?;
        self.send(frame).await?;
        // Only values that reached the bus become the message's remembered state.
        self.tx_shadow.lock().insert(message_id, merged);
        Ok(())
    }

    fn latest_value(&self, message_id: u32, signal: &str) -> Option<SignalSample> {
        self.cache.get(message_id, signal)
    }

    fn find_message_and_signal(
        &self,
        message_id: u32,
        signal: &str,
    ) -> Option<(&MessageDef, &SignalDef)> {
        self.database.find(message_id, signal)
    }

    fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }
}

/// In-memory [`CanAdapter`] backed by channels, for loopback tests and dry runs.
pub struct ChannelAdapter {
    outbound: mpsc::UnboundedSender<CanFrame>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<CanFrame>>,
    connected: Arc<AtomicBool>,
}

/// The far end of a [`ChannelAdapter`]: injects inbound frames, observes transmitted ones.
pub struct ChannelPeer {
    /// Frames the adapter transmitted
    pub transmitted: mpsc::UnboundedReceiver<CanFrame>,
    inject: mpsc::UnboundedSender<CanFrame>,
    connected: Arc<AtomicBool>,
}

impl ChannelAdapter {
    /// Create a connected adapter and its peer.
    pub fn pair() -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        (
            Self {
                outbound: out_tx,
                inbound: tokio::sync::Mutex::new(in_rx),
                connected: Arc::clone(&connected),
            },
            ChannelPeer {
                transmitted: out_rx,
                inject: in_tx,
                connected,
            },
        )
    }
}

impl ChannelPeer {
    /// Deliver a frame to the adapter's receive side.
    pub fn inject(&self, frame: CanFrame) -> EolResult<()> {
        self.inject
            .send(frame)
            .map_err(|_| EolError::Transport("adapter receive side closed".into()))
    }

    /// Simulate unplugging the adapter.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Simulate plugging the adapter back in.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CanAdapter for ChannelAdapter {
    async fn transmit(&self, frame: &CanFrame) -> EolResult<()> {
        if !self.is_connected() {
            return Err(EolError::Unreachable("channel adapter disconnected".into()));
        }
        self.outbound
            .send(frame.clone())
            .map_err(|_| EolError::Transport("peer dropped".into()))
    }

    async fn receive(&self) -> EolResult<Option<CanFrame>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    const DB: &str = r#"
        [[messages]]
        id = 0x10
        name = "EOL_Command"
        [[messages.signals]]
        name = "Relay"
        start_bit = 0
        length = 1
        [[messages.signals]]
        name = "DacCmd"
        start_bit = 8
        length = 16

        [[messages]]
        id = 0x20
        name = "DUT_Feedback"
        [[messages.signals]]
        name = "RelayFb"
        start_bit = 0
        length = 1
    "#;

    fn database() -> MessageDatabase {
        MessageDatabase::from_toml_str(DB).unwrap()
    }

    async fn wait_for_value(bus: &CanBus, id: u32, name: &str) -> Option<f64> {
        for _ in 0..100 {
            if let Some(sample) = bus.latest_value(id, name) {
                return Some(sample.value);
            }
            sleep(Duration::from_millis(2)).await;
        }
        None
    }

    #[tokio::test]
    async fn decodes_inbound_frames_into_cache() {
        let (adapter, peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), database(), 64);
        let db = database();

        peer.inject(db.encode(0x20, [("RelayFb", 1.0)]).unwrap())
            .unwrap();
        assert_eq!(wait_for_value(&bus, 0x20, "RelayFb").await, Some(1.0));
        assert!(bus.find_message_and_signal(0x20, "RelayFb").is_some());
    }

    #[tokio::test]
    async fn write_keeps_other_signals_of_message() {
        let (adapter, mut peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), database(), 64);

        bus.write_signals(0x10, &[("DacCmd", 500.0)]).await.unwrap();
        bus.write_signals(0x10, &[("Relay", 1.0)]).await.unwrap();

        let _first = peer.transmitted.recv().await.unwrap();
        let second = timeout(Duration::from_secs(1), peer.transmitted.recv())
            .await
            .unwrap()
            .unwrap();
        let decoded = database().decode(&second).unwrap();
        assert!(decoded.contains(&("Relay".to_string(), 1.0)));
        assert!(decoded.contains(&("DacCmd".to_string(), 500.0)));
    }

    #[tokio::test]
    async fn send_fails_when_disconnected() {
        let (adapter, peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), database(), 64);
        peer.disconnect();

        let err = bus
            .write_signals(0x10, &[("Relay", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EolError::Unreachable(_)));
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn failed_transmit_is_not_resent_later() {
        let (adapter, mut peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), database(), 64);

        peer.disconnect();
        assert!(bus.write_signals(0x10, &[("Relay", 1.0)]).await.is_err());
        peer.reconnect();
        bus.write_signals(0x10, &[("DacCmd", 20.0)]).await.unwrap();

        let frame = timeout(Duration::from_secs(1), peer.transmitted.recv())
            .await
            .unwrap()
            .unwrap();
        let decoded = database().decode(&frame).unwrap();
        assert!(decoded.contains(&("Relay".to_string(), 0.0)));
        assert!(decoded.contains(&("DacCmd".to_string(), 20.0)));
        assert!(peer.transmitted.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_signal_is_rejected_before_transmit() {
        let (adapter, _peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), database(), 64);
        let err = bus
            .write_signals(0x10, &[("Bogus", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EolError::UnknownSignal { .. }));
    }
}
