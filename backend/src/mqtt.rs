//! Broker connection shared by all requests.
//!
//! rumqttc hands a publish to its event loop and returns before the broker
//! has seen it. To answer only after the PUBACK, every QoS 1/2 publish
//! leaves a waiter behind. The event loop reports the packet id it assigned
//! (`Outgoing::Publish`) in the order requests were queued, which pairs the
//! oldest unassigned waiter with that id; the matching PUBACK/PUBCOMP then
//! resolves it.
//!
//! The pairing holds only while `queued` and the client's request channel
//! hold the same requests in the same order. A waiter is therefore pushed
//! in the same critical section that enqueues its request, and a lost
//! connection fails every waiter and discards every request rumqttc would
//! otherwise replay after reconnecting.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Transport};
use tokio::sync::oneshot;

pub use rumqttc::QoS;

use crate::{config::Broker, error::BridgeError};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the broker accepted the message at the requested QoS.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;
}

type AckSender = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct Inflight {
    /// handed to the client, no packet id seen yet
    queued: VecDeque<AckSender>,
    /// waiting for the broker's ack
    sent: HashMap<u16, AckSender>,
}

impl Inflight {
    fn on_outgoing(&mut self, pkid: u16) {
        // QoS 0 publishes carry pkid 0 and never get a waiter
        if pkid == 0 {
            return;
        }
        match self.queued.pop_front() {
            Some(tx) => {
                if let Some(stale) = self.sent.insert(pkid, tx) {
                    let _ = stale.send(Err(format!("packet id {pkid} reused before ack")));
                }
            }
            None => debug!("outgoing publish {pkid} without a waiter"),
        }
    }

    fn on_ack(&mut self, pkid: u16) {
        match self.sent.remove(&pkid) {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => debug!("ack for unknown packet id {pkid}"),
        }
    }

    fn fail_all(&mut self, reason: &str) -> usize {
        let waiters = self.queued.drain(..).chain(self.sent.drain().map(|(_, tx)| tx));
        let mut count = 0;
        for tx in waiters {
            let _ = tx.send(Err(reason.to_string()));
            count += 1;
        }
        count
    }
}

/// State the publishing side and the event loop share.
#[derive(Default)]
pub struct Session {
    connected: AtomicBool,
    inflight: Mutex<Inflight>,
}

impl Session {
    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn handle_event(&self, event: &Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("MQTT connected ({:?})", ack.code);
                self.connected.store(true, Ordering::Release);
            }
            Event::Incoming(Packet::PubAck(ack)) => self.inflight().on_ack(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.inflight().on_ack(comp.pkid),
            Event::Incoming(Packet::Disconnect) => {
                warn!("MQTT broker sent disconnect");
                self.connection_lost("broker disconnected");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.inflight().on_outgoing(*pkid),
            _ => {}
        }
    }

    /// Fails every waiting publish.
    pub fn connection_lost(&self, reason: &str) -> usize {
        self.abandon(reason, || {})
    }

    /// Marks the session down, runs `discard` and fails every waiter, all
    /// without letting a publish slip in between.
    fn abandon(&self, reason: &str, discard: impl FnOnce()) -> usize {
        let mut inflight = self.inflight();
        self.connected.store(false, Ordering::Release);
        discard();
        inflight.fail_all(reason)
    }
}

/// rumqttc replays unacked publishes and unsent requests after reconnecting,
/// whatever the clean session flag says. Their callers were already failed.
fn discard_requests(eventloop: &mut EventLoop) {
    // moves anything still in the request channel into `pending`
    eventloop.clean();
    if !eventloop.pending.is_empty() {
        debug!(
            "dropping {} request(s) queued before the connection was lost",
            eventloop.pending.len()
        );
        eventloop.pending.clear();
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    session: Arc<Session>,
}

/// Owns the rumqttc event loop; must be driven for anything to reach the broker.
pub struct BrokerConnection {
    eventloop: EventLoop,
    session: Arc<Session>,
    address: String,
}

impl MqttPublisher {
    pub fn connect(broker: &Broker) -> (Self, BrokerConnection) {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(username) = &broker.username {
            options.set_credentials(username, broker.password.clone().unwrap_or_default());
        }
        if broker.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let session = Arc::new(Session::default());

        let publisher = Self {
            client,
            session: session.clone(),
        };
        let connection = BrokerConnection {
            eventloop,
            session,
            address: format!("{}:{}", broker.host, broker.port),
        };
        (publisher, connection)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {e}");
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BridgeError> {
        if !self.session.is_connected() {
            return Err(BridgeError::Delivery("broker not connected".to_string()));
        }

        if qos == QoS::AtMostOnce {
            return self
                .client
                .publish(topic, qos, false, payload)
                .await
                .map_err(|e| BridgeError::Delivery(e.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        {
            // no await in here: the waiter and its request are queued together or not at all
            let mut inflight = self.session.inflight();
            if !self.session.is_connected() {
                return Err(BridgeError::Delivery("broker not connected".to_string()));
            }
            self.client
                .try_publish(topic, qos, false, payload)
                .map_err(|e| BridgeError::Delivery(format!("request queue full: {e}")))?;
            inflight.queued.push_back(tx);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(BridgeError::Delivery(reason)),
            Err(_) => Err(BridgeError::Delivery("event loop stopped".to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}

impl BrokerConnection {
    pub async fn run(mut self) {
        info!("Connecting to MQTT broker: {}", self.address);
        loop {
            match self.eventloop.poll().await {
                Ok(event) => self.session.handle_event(&event),
                Err(e) => {
                    let eventloop = &mut self.eventloop;
                    let failed = self
                        .session
                        .abandon(&e.to_string(), || discard_requests(eventloop));
                    error!("MQTT error ({}): {e}, {failed} pending publish(es) failed", self.address);
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
}
