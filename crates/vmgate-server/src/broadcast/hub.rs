//! Status Broadcast Hub.
//!
//! A single [`HubLoop`] task owns the subscriber map; every mutation
//! (register, unregister, eviction after a failed write) happens inside that
//! loop, so the map needs no lock. Producers hold a cloneable [`StatusHub`]
//! handle which feeds three inlets:
//!
//! - `register` / `unregister`: small bounded channels, awaited by the caller.
//! - `broadcast`: bounded to [`HubConfig::capacity`] and fed with `try_send`,
//!   so publishers never wait on hub backpressure. A full buffer drops the
//!   message with a warning.

use super::subscriber::Subscriber;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vmgate_core::{BroadcastMessage, GateError, GateResult, VmRecord};

/// Connection identity of a registered subscriber.
pub type SubscriberId = u64;

const CONTROL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast inlet buffer size.
    pub capacity: usize,
    /// Bound on a single subscriber write. Expiry counts as a write failure.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

struct Registration {
    id: SubscriberId,
    subscriber: Box<dyn Subscriber>,
    /// Sent to this subscriber only, before it joins the fan-out.
    snapshot: Option<String>,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct StatusHub {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    broadcast_tx: mpsc::Sender<String>,
    next_id: Arc<AtomicU64>,
    subscribers: Arc<AtomicUsize>,
}

/// The event loop. Runs until every [`StatusHub`] clone is dropped.
pub struct HubLoop {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<SubscriberId>,
    broadcast_rx: mpsc::Receiver<String>,
    subscribers: HashMap<SubscriberId, Box<dyn Subscriber>>,
    count: Arc<AtomicUsize>,
    write_timeout: Duration,
}

impl StatusHub {
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.capacity.max(1));
        let count = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            subscribers: count.clone(),
        };
        let hub_loop = HubLoop {
            register_rx,
            unregister_rx,
            broadcast_rx,
            subscribers: HashMap::new(),
            count,
            write_timeout: config.write_timeout,
        };
        (hub, hub_loop)
    }

    /// Create the hub and spawn its loop.
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, hub_loop) = Self::new(config);
        (hub, tokio::spawn(hub_loop.run()))
    }

    /// Hand a subscriber to the loop. `snapshot` is written to it first and
    /// only to it; if that write fails the subscriber is dropped.
    pub async fn register(
        &self,
        subscriber: Box<dyn Subscriber>,
        snapshot: Option<String>,
    ) -> GateResult<SubscriberId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.register_tx
            .send(Registration {
                id,
                subscriber,
                snapshot,
            })
            .await
            .map_err(|_| GateError::Other("status hub stopped".to_string()))?;
        Ok(id)
    }

    /// Remove and close a subscriber. Unknown ids are a no-op.
    pub async fn unregister(&self, id: SubscriberId) {
        if self.unregister_tx.send(id).await.is_err() {
            debug!(subscriber = id, "unregister after hub stopped");
        }
    }

    /// Enqueue raw text for every subscriber without waiting.
    ///
    /// Returns `false` if the message was dropped.
    pub fn broadcast(&self, text: String) -> bool {
        match self.broadcast_tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("broadcast buffer full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("status hub stopped, dropping message");
                false
            }
        }
    }

    pub fn publish_vm_update(&self, vm: &VmRecord) -> bool {
        self.publish(&BroadcastMessage::VmUpdate { vm: vm.clone() })
    }

    pub fn publish_vm_list(&self, vms: &[VmRecord]) -> bool {
        self.publish(&BroadcastMessage::VmList { vms: vms.to_vec() })
    }

    fn publish(&self, message: &BroadcastMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.broadcast(text),
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast message");
                false
            }
        }
    }

    /// Current number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

impl HubLoop {
    pub async fn run(mut self) {
        debug!("status hub started");
        loop {
            tokio::select! {
                biased;
                Some(reg) = self.register_rx.recv() => self.add(reg).await,
                Some(id) = self.unregister_rx.recv() => self.remove(id).await,
                Some(text) = self.broadcast_rx.recv() => self.fan_out(&text).await,
                else => break,
            }
        }

        let timeout = self.write_timeout;
        for (_, mut subscriber) in self.subscribers.drain() {
            close_within(subscriber.as_mut(), timeout).await;
        }
        self.count.store(0, Ordering::Relaxed);
        debug!("status hub stopped");
    }

    async fn add(&mut self, reg: Registration) {
        let Registration {
            id,
            mut subscriber,
            snapshot,
        } = reg;

        if let Some(snapshot) = snapshot {
            if let Err(e) = deliver(subscriber.as_mut(), &snapshot, self.write_timeout).await {
                warn!(subscriber = id, error = %e, "initial snapshot failed, dropping subscriber");
                close_within(subscriber.as_mut(), self.write_timeout).await;
                return;
            }
        }

        self.subscribers.insert(id, subscriber);
        self.sync_count();
        info!(
            subscriber = id,
            total_subscribers = self.subscribers.len(),
            "status subscriber registered"
        );
    }

    async fn remove(&mut self, id: SubscriberId) {
        if let Some(mut subscriber) = self.subscribers.remove(&id) {
            close_within(subscriber.as_mut(), self.write_timeout).await;
            self.sync_count();
        }
        info!(
            subscriber = id,
            total_subscribers = self.subscribers.len(),
            "status subscriber unregistered"
        );
    }

    async fn fan_out(&mut self, text: &str) {
        let timeout = self.write_timeout;
        let mut evicted = Vec::new();

        for (id, subscriber) in self.subscribers.iter_mut() {
            if let Err(e) = deliver(subscriber.as_mut(), text, timeout).await {
                warn!(subscriber = *id, error = %e, "write failed, evicting subscriber");
                close_within(subscriber.as_mut(), timeout).await;
                evicted.push(*id);
            }
        }

        if !evicted.is_empty() {
            for id in &evicted {
                self.subscribers.remove(id);
            }
            self.sync_count();
            info!(
                evicted = evicted.len(),
                total_subscribers = self.subscribers.len(),
                "evicted broken subscribers"
            );
        }
    }

    fn sync_count(&self) {
        self.count.store(self.subscribers.len(), Ordering::Relaxed);
    }
}

async fn deliver(subscriber: &mut dyn Subscriber, text: &str, timeout: Duration) -> GateResult<()> {
    match tokio::time::timeout(timeout, subscriber.send_text(text)).await {
        Ok(result) => result,
        Err(_) => Err(GateError::Timeout),
    }
}

/// Close a subscriber, abandoning the handshake if the peer will not drain it.
async fn close_within(subscriber: &mut dyn Subscriber, timeout: Duration) {
    if tokio::time::timeout(timeout, subscriber.close()).await.is_err() {
        debug!("subscriber close timed out, dropping");
    }
}
