//! MQTT transport using rumqttc.
//!
//! Each connection owns an `AsyncClient` and a spawned task polling its event
//! loop. The event loop reconnects on the next poll after an error; the task
//! waits `ReconnectPolicy::delay_for_attempt` between attempts and, once the
//! broker acknowledges the new session, subscribes the full topic set again.
//!
//! Requests are queued with the non-blocking `try_*` client calls. The request
//! channel only drains while the broker is reachable, so an awaiting call
//! would park the caller for as long as the broker is down.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loragent_core::config::TransportConfig;
use loragent_core::model::ConnectionKey;
use loragent_core::{ConnectionState, Error, GatewayEvent, ReconnectPolicy, Result};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FrameSink, TransportConnection, TransportConnector};
use crate::uplink::UplinkFrame;

/// Capacity of the client request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Topic filters per SUBSCRIBE packet when restoring a session.
const RESUBSCRIBE_BATCH: usize = 32;

/// How long `close()` lets the event loop write DISCONNECT.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Opens one rumqttc client per connection key.
pub struct MqttConnector {
    config: TransportConfig,
}

impl MqttConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        sink: FrameSink,
    ) -> Result<Arc<dyn TransportConnection>> {
        let client_id = format!("{}-{}", self.config.client_id_prefix, Uuid::new_v4());
        let mut options = MqttOptions::new(&client_id, &key.host, key.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&key.username, &key.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let topics = Arc::new(RwLock::new(BTreeSet::new()));
        let resync = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = EventLoopWorker {
            broker: key.to_string(),
            client: client.clone(),
            topics: topics.clone(),
            resync: resync.clone(),
            sink,
            state: state_tx,
            policy: self.config.reconnect.clone(),
        };
        let task = tokio::spawn(worker.run(eventloop, shutdown_rx));

        info!(
            category = "transport",
            broker = %key,
            client_id = %client_id,
            "MQTT connection started"
        );

        Ok(Arc::new(MqttConnection {
            key: key.clone(),
            client,
            topics,
            resync,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// A live rumqttc client.
pub struct MqttConnection {
    key: ConnectionKey,
    client: AsyncClient,
    /// Topics the next session must carry, including ones whose request
    /// could not be queued.
    topics: Arc<RwLock<BTreeSet<String>>>,
    /// Set when a subscribe request was rejected; the event loop then sends
    /// the whole topic set once the session allows it.
    resync: Arc<AtomicBool>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportConnection for MqttConnection {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.topics.write().await.insert(topic.to_string());
        if let Err(e) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
            self.resync.store(true, Ordering::SeqCst);
            return Err(Error::Transport(format!(
                "subscribe {} on {}: {}",
                topic, self.key, e
            )));
        }
        debug!(category = "transport", broker = %self.key, topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.topics.write().await.remove(topic);
        self.client.try_unsubscribe(topic).map_err(|e| {
            Error::Transport(format!("unsubscribe {} on {}: {}", topic, self.key, e))
        })?;
        debug!(category = "transport", broker = %self.key, topic, "Unsubscribed");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn close(&self) -> Result<()> {
        let Some(mut task) = self.task.lock().await.take() else {
            return Ok(());
        };

        let disconnect_requested = match self.state() {
            ConnectionState::Connected | ConnectionState::Reconciling => {
                match self.client.try_disconnect() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(category = "transport", broker = %self.key, "Disconnect request not queued: {}", e);
                        false
                    }
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => false,
        };

        // The event loop exits on its own once DISCONNECT is written.
        let flushed = if disconnect_requested {
            tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, &mut task)
                .await
                .ok()
        } else {
            None
        };
        let joined = match flushed {
            Some(joined) => joined,
            None => {
                let _ = self.shutdown.send(true);
                task.await
            }
        };
        joined.map_err(|e| Error::Transport(format!("event loop of {} failed: {}", self.key, e)))?;

        info!(category = "transport", broker = %self.key, "MQTT connection closed");
        Ok(())
    }
}

struct EventLoopWorker {
    broker: String,
    client: AsyncClient,
    topics: Arc<RwLock<BTreeSet<String>>>,
    resync: Arc<AtomicBool>,
    sink: FrameSink,
    state: watch::Sender<ConnectionState>,
    policy: ReconnectPolicy,
}

impl EventLoopWorker {
    async fn run(self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        let mut sessions: u64 = 0;
        // Topics still to be sent on the current session.
        let mut pending: Vec<String> = Vec::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    attempt = 0;
                    sessions += 1;
                    self.set_state(ConnectionState::Connected);
                    info!(category = "transport", broker = %self.broker, "MQTT connected");
                    if sessions > 1 {
                        self.resync.store(true, Ordering::SeqCst);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let frame = UplinkFrame::new(publish.topic, publish.payload.to_vec());
                    self.sink.offer(frame);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!(category = "transport", broker = %self.broker, "DISCONNECT sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    pending.clear();
                    self.set_state(ConnectionState::Disconnected);
                    attempt = attempt.saturating_add(1);
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        category = "transport",
                        broker = %self.broker,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "MQTT connection error: {}",
                        e
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.set_state(ConnectionState::Connecting);
                    continue;
                }
            }

            if sessions > 0 && pending.is_empty() && self.resync.swap(false, Ordering::SeqCst) {
                pending = self.topics.read().await.iter().cloned().collect();
                if !pending.is_empty() {
                    self.set_state(ConnectionState::Reconciling);
                }
            }
            if !pending.is_empty() {
                self.resubscribe(&mut pending);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!(category = "transport", broker = %self.broker, "MQTT event loop stopped");
    }

    /// Queue SUBSCRIBE packets for `pending`, removing what was queued.
    ///
    /// Runs on the event loop task, so a full request channel only defers
    /// the rest to a later iteration.
    fn resubscribe(&self, pending: &mut Vec<String>) {
        while !pending.is_empty() {
            let n = pending.len().min(RESUBSCRIBE_BATCH);
            let filters: Vec<SubscribeFilter> = pending[..n]
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce))
                .collect();
            if let Err(e) = self.client.try_subscribe_many(filters) {
                debug!(
                    category = "transport",
                    broker = %self.broker,
                    remaining = pending.len(),
                    "Resubscribe deferred: {}",
                    e
                );
                return;
            }
            pending.drain(..n);
        }
        info!(
            category = "transport",
            broker = %self.broker,
            "Topic set restored on the current session"
        );
        self.set_state(ConnectionState::Connected);
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        let _ = self.state.send(state);
        self.sink.event_bus().publish(GatewayEvent::ConnectionStateChanged {
            broker: self.broker.clone(),
            state,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}
