//! Socket registry and cross-instance fan-out.
//!
//! The user -> socket map is local to the instance that accepted the TCP
//! connection. Delivery to a user with no local socket goes out on the
//! fleet-wide `fleet:user` channel; whichever instance holds that user's
//! sockets re-delivers locally. Presence flips online on the first socket
//! and offline after the last one across the fleet disappears (coalesced by
//! the presence TTL).

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::metrics::{MetricsSink, names};
use crate::store::{SharedStore, StoreResult};
use chrono::{DateTime, Utc};
use mp_protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const USER_CHANNEL: &str = "fleet:user";
pub const PRESENCE_CHANNEL: &str = "fleet:presence";

/// One frame on a socket's outbound path. Non-critical frames are shed
/// first under backpressure; a critical frame that cannot be queued costs
/// the socket its connection.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub msg: ServerMessage,
    pub critical: bool,
}

impl OutboundFrame {
    pub fn new(msg: ServerMessage) -> Self {
        let critical = !matches!(
            msg,
            ServerMessage::UserCount(_)
                | ServerMessage::QueuePosition(_)
                | ServerMessage::ChatTyping
                | ServerMessage::ChatStopTyping
        );
        Self { msg, critical }
    }
}

/// Cross-instance delivery envelope on `fleet:user`.
#[derive(Debug, Serialize, Deserialize)]
struct DirectedMessage {
    target_user_id: String,
    origin_instance_id: String,
    message: ServerMessage,
}

/// Presence transition on `fleet:presence`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub instance_id: String,
    pub online: bool,
}

struct SocketHandle {
    connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundFrame>,
}

#[derive(Default)]
struct RegistryInner {
    by_user: HashMap<String, HashMap<String, SocketHandle>>,
    total: usize,
}

pub struct SocketRegistry {
    instance_id: String,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<RegistryInner>,
    /// Shared with the fleet coordinator for the load heartbeat.
    connections: Arc<AtomicUsize>,
}

impl SocketRegistry {
    pub fn new(
        instance_id: String,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        connections: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            instance_id,
            store,
            clock,
            config,
            metrics,
            inner: Mutex::new(RegistryInner::default()),
            connections,
        }
    }

    fn presence_key(user_id: &str) -> String {
        format!("presence:{user_id}")
    }

    /// Register a socket. The first socket for a user flips presence online
    /// fleet-wide.
    pub async fn register(
        &self,
        user_id: &str,
        socket_id: &str,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> StoreResult<()> {
        let first_socket = {
            let mut inner = self.inner.lock().unwrap();
            let sockets = inner.by_user.entry(user_id.to_owned()).or_default();
            let first = sockets.is_empty();
            sockets.insert(
                socket_id.to_owned(),
                SocketHandle {
                    connected_at: self.clock.now(),
                    sender,
                },
            );
            inner.total += 1;
            first
        };
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.touch_presence(user_id).await?;
        if first_socket {
            self.publish_presence(user_id, true).await?;
        }
        debug!(user_id = %user_id, socket_id = %socket_id, "socket registered");
        Ok(())
    }

    /// Remove a socket. The last local socket publishes offline and clears
    /// the presence record, provided no other instance has claimed the user
    /// in the meantime.
    pub async fn unregister(&self, user_id: &str, socket_id: &str) -> StoreResult<()> {
        let last_local = {
            let mut inner = self.inner.lock().unwrap();
            let Some(sockets) = inner.by_user.get_mut(user_id) else {
                return Ok(());
            };
            if sockets.remove(socket_id).is_none() {
                return Ok(());
            }
            inner.total -= 1;
            let emptied = inner
                .by_user
                .get(user_id)
                .is_some_and(HashMap::is_empty);
            if emptied {
                inner.by_user.remove(user_id);
            }
            emptied
        };
        self.connections.fetch_sub(1, Ordering::SeqCst);
        if last_local {
            let key = Self::presence_key(user_id);
            if self.store.get(&key).await?.as_deref() == Some(self.instance_id.as_str()) {
                self.store.delete(&key).await?;
            }
            self.publish_presence(user_id, false).await?;
        }
        debug!(user_id = %user_id, socket_id = %socket_id, "socket unregistered");
        Ok(())
    }

    /// Refresh the presence record's TTL; called on register and from the
    /// per-socket keepalive tick.
    pub async fn touch_presence(&self, user_id: &str) -> StoreResult<()> {
        self.store
            .set(
                &Self::presence_key(user_id),
                &self.instance_id,
                Some(self.config.presence_ttl),
            )
            .await
    }

    pub async fn is_present(&self, user_id: &str) -> StoreResult<bool> {
        Ok(self.store.get(&Self::presence_key(user_id)).await?.is_some())
    }

    async fn publish_presence(&self, user_id: &str, online: bool) -> StoreResult<()> {
        let event = PresenceEvent {
            user_id: user_id.to_owned(),
            instance_id: self.instance_id.clone(),
            online,
        };
        let payload = serde_json::to_string(&event).unwrap_or_default();
        self.store.publish(PRESENCE_CHANNEL, &payload).await
    }

    /// Deliver to every local socket of the user. Returns whether at least
    /// one socket took the frame, plus the sockets that must be closed
    /// (critical frame refused, or writer already gone).
    fn try_deliver_local(&self, user_id: &str, frame: &OutboundFrame) -> (bool, Vec<String>) {
        let mut doomed: Vec<String> = Vec::new();
        let mut delivered = false;
        let inner = self.inner.lock().unwrap();
        let Some(sockets) = inner.by_user.get(user_id) else {
            return (false, doomed);
        };
        for (socket_id, handle) in sockets {
            match handle.sender.try_send(frame.clone()) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if frame.critical {
                        // A full buffer that cannot take a critical frame
                        // forfeits the connection.
                        doomed.push(socket_id.clone());
                    } else {
                        self.metrics.counter(names::FRAMES_DROPPED_TOTAL, &[], 1);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    doomed.push(socket_id.clone());
                }
            }
        }
        (delivered, doomed)
    }

    /// Unregister sockets whose outbound path failed. Dropping the handle
    /// closes the channel; the writer task drains what was queued and exits.
    async fn reap_doomed(&self, user_id: &str, doomed: Vec<String>) {
        for socket_id in doomed {
            warn!(user_id = %user_id, socket_id = %socket_id, "force-closing backlogged socket");
            self.metrics.counter(names::SOCKETS_FORCE_CLOSED_TOTAL, &[], 1);
            if let Err(e) = self.unregister(user_id, &socket_id).await {
                warn!(error = %e, "cleanup of backlogged socket failed");
            }
        }
    }

    async fn deliver_local(&self, user_id: &str, frame: &OutboundFrame) -> bool {
        let (delivered, doomed) = self.try_deliver_local(user_id, frame);
        self.reap_doomed(user_id, doomed).await;
        delivered
    }

    /// Targeted delivery: local sockets first, otherwise out to the fleet.
    pub async fn emit_to_user(&self, user_id: &str, msg: ServerMessage) -> StoreResult<()> {
        let frame = OutboundFrame::new(msg);
        if self.deliver_local(user_id, &frame).await {
            return Ok(());
        }
        let envelope = DirectedMessage {
            target_user_id: user_id.to_owned(),
            origin_instance_id: self.instance_id.clone(),
            message: frame.msg,
        };
        let payload = serde_json::to_string(&envelope).unwrap_or_default();
        self.store.publish(USER_CHANNEL, &payload).await
    }

    /// Delivery to one specific local socket (errors go to the socket that
    /// caused them, not to every tab).
    pub async fn emit_to_socket(&self, user_id: &str, socket_id: &str, msg: ServerMessage) {
        let frame = OutboundFrame::new(msg);
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner
                .by_user
                .get(user_id)
                .and_then(|sockets| sockets.get(socket_id))
                .map(|handle| handle.sender.clone())
        };
        if let Some(sender) = sender {
            match sender.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(f)) if !f.critical => {
                    self.metrics.counter(names::FRAMES_DROPPED_TOTAL, &[], 1);
                }
                Err(_) => {
                    self.reap_doomed(user_id, vec![socket_id.to_owned()]).await;
                }
            }
        }
    }

    /// Best-effort broadcast to every local socket (shutdown notice,
    /// user counts).
    pub fn broadcast_local(&self, msg: &ServerMessage) {
        let senders: Vec<mpsc::Sender<OutboundFrame>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .by_user
                .values()
                .flat_map(HashMap::values)
                .map(|handle| handle.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.try_send(OutboundFrame::new(msg.clone()));
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn has_local_sockets(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .by_user
            .get(user_id)
            .is_some_and(|sockets| !sockets.is_empty())
    }

    pub fn socket_connected_at(&self, user_id: &str, socket_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .by_user
            .get(user_id)
            .and_then(|sockets| sockets.get(socket_id))
            .map(|handle| handle.connected_at)
    }

    /// Fleet subscriber: re-delivers directed messages whose target has a
    /// socket here. Local delivery only; never republished, so no loops.
    pub async fn run_subscriber(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sub = match self.store.subscribe(USER_CHANNEL).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "could not subscribe to the fleet user channel");
                return;
            }
        };
        info!(instance_id = %self.instance_id, "fleet subscriber running");
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_str::<DirectedMessage>(&msg.payload) {
                        Ok(directed) => {
                            if directed.origin_instance_id == self.instance_id {
                                // Already attempted locally before publishing.
                                continue;
                            }
                            let frame = OutboundFrame::new(directed.message);
                            self.deliver_local(&directed.target_user_id, &frame).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "bad directed message on fleet channel");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
