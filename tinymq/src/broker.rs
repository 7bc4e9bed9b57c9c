use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Sink, Stream};
use serde_json::json;

use tinymq_conf::Settings;
use tinymq_net::MqttError;

use crate::auth::{AllowAll, Authenticator};
use crate::packet_id::PacketIdAllocator;
use crate::registry::Registry;
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::router::{DefaultRouter, Router};
use crate::session;
use crate::store::Store;
use crate::topic::Topic;
use crate::types::{ClientId, Packet, Publish, QoS, Reason, Stats, TopicFilter};
use crate::Result;

/// Shared broker state: routing, retained messages, durable store and the live session registry.
/// Cloning is cheap.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub struct BrokerInner {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub router: Box<dyn Router>,
    pub retain: Box<dyn RetainStorage>,
    pub auth: Box<dyn Authenticator>,
    pub packet_ids: PacketIdAllocator,
    pub registry: Registry,
    pub stats: Arc<Stats>,
    session_seq: AtomicU64,
}

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker {{ sessions: {}, stats: {} }}", self.registry.len(), self.stats())
    }
}

impl Broker {
    #[inline]
    pub fn new(settings: Settings, store: Arc<dyn Store>) -> Self {
        Self::with_authenticator(settings, store, AllowAll)
    }

    pub fn with_authenticator<A>(settings: Settings, store: Arc<dyn Store>, auth: A) -> Self
    where
        A: Authenticator + 'static,
    {
        Broker {
            inner: Arc::new(BrokerInner {
                settings,
                router: Box::new(DefaultRouter::new(store.clone())),
                retain: Box::new(DefaultRetainStorage::new()),
                auth: Box::new(auth),
                store,
                packet_ids: PacketIdAllocator::new(),
                registry: Registry::new(),
                stats: Arc::new(Stats::default()),
                session_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Reloads durable state after a restart: subscriptions into the router, retained messages into
    /// the retained tree, and the packet ids held by stored outbound packets.
    pub async fn restore(&self) -> Result<()> {
        let subscriptions = self.router.restore().await?;

        let retaineds = self.store.lookup_all_retained().await?;
        let retained_count = retaineds.len();
        for publish in retaineds {
            self.retain.set(publish).await?;
        }

        let outbound_ids = self.store.lookup_all_outbound_ids().await?;
        for (client_id, packet_id) in outbound_ids.iter() {
            self.packet_ids.reserve(client_id, *packet_id);
        }

        log::info!(
            "restored {} subscriptions, {} retained messages, {} outbound packets",
            subscriptions,
            retained_count,
            outbound_ids.len()
        );
        Ok(())
    }

    /// Publishes a message on behalf of `from`, returning the number of matched subscriptions.
    ///
    /// A retain-flagged message replaces the retained message of its topic (an empty payload
    /// clears it); if the store cannot record it, nothing is published. Each subscriber gets a copy with `retain` cleared and its QoS capped to the
    /// granted QoS.
    pub async fn publish(&self, from: &ClientId, mut publish: Publish) -> Result<usize> {
        let topic = Topic::parse_name(&publish.topic)?;
        publish.dup = false;
        publish.packet_id = None;

        if publish.retain {
            self.store.store_retained(&publish).await.map_err(|e| {
                log::warn!("{:?} failed to store retained message {:?}, {:?}", from, publish.topic, e);
                e
            })?;
            self.retain.set(publish.clone()).await?;
        }

        let subscribers = self.router.matches(&topic).await;
        log::debug!("{:?} publish {:?}, matched subscribers: {}", from, publish.topic, subscribers.len());
        let matched = subscribers.len();
        for (client_id, qos) in subscribers {
            let mut p = publish.clone();
            p.retain = false;
            p.qos = publish.qos.less_value(qos);
            self.deliver(&client_id, p).await;
        }
        Ok(matched)
    }

    async fn deliver(&self, client_id: &ClientId, publish: Publish) {
        let publish = match self.registry.get(client_id) {
            Some(handle) => match handle.forward(publish) {
                Ok(()) => return,
                Err(p) if handle.clean_session || p.qos == QoS::AtMostOnce => {
                    self.stats.dropped_packets.inc();
                    log::warn!("{:?} session queue is full or closed, dropped message {:?}", client_id, p);
                    return;
                }
                Err(p) => p,
            },
            None => publish,
        };
        if publish.qos != QoS::AtMostOnce {
            self.store_offline(client_id, publish).await;
        }
    }

    /// Queues a message for a client that is not reachable right now. It is sent when the client
    /// reconnects with a persistent session.
    pub(crate) async fn store_offline(&self, client_id: &ClientId, mut publish: Publish) -> bool {
        let packet_id = match self.packet_ids.request(client_id) {
            Ok(packet_id) => packet_id,
            Err(e) => {
                self.stats.dropped_packets.inc();
                log::warn!("{:?} {}, dropped offline message {:?}", client_id, e, publish);
                return false;
            }
        };
        publish.packet_id = Some(packet_id);
        publish.dup = false;
        match self.store.store_outbound_packet(client_id, packet_id, &publish).await {
            Ok(()) => {
                self.stats.offline_packets.inc();
                true
            }
            Err(e) => {
                self.packet_ids.free(client_id, packet_id);
                self.stats.dropped_packets.inc();
                log::warn!("{:?} failed to store offline message {:?}, {:?}", client_id, publish, e);
                false
            }
        }
    }

    /// Adds a subscription and returns the retained messages it matches, ready to send.
    pub async fn subscribe(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<Vec<Publish>> {
        self.router.add(topic_filter, client_id, qos).await?;
        let retaineds = self
            .retain
            .get(topic_filter)
            .await?
            .into_iter()
            .map(|mut p| {
                p.qos = p.qos.less_value(qos);
                p.retain = true;
                p.dup = false;
                p.packet_id = None;
                p
            })
            .collect();
        Ok(retaineds)
    }

    #[inline]
    pub async fn unsubscribe(&self, client_id: &ClientId, topic_filter: &TopicFilter) -> Result<bool> {
        self.router.remove(topic_filter, client_id).await
    }

    /// Drops all session state of `client_id`: subscriptions, stored packets and packet ids.
    pub async fn clean_session(&self, client_id: &ClientId) {
        if let Err(e) = self.router.remove_all(client_id).await {
            log::warn!("{:?} failed to remove subscriptions, {:?}", client_id, e);
        }
        if let Err(e) = self.store.clean_all_packets(client_id).await {
            log::warn!("{:?} failed to clean stored packets, {:?}", client_id, e);
        }
        self.packet_ids.clean(client_id);
    }

    /// Runs one client connection to completion and returns why it ended.
    pub async fn handle_connection<R, W, E>(&self, reader: R, writer: W, remote_addr: SocketAddr) -> Reason
    where
        R: Stream<Item = std::result::Result<Packet, E>> + Unpin + Send + 'static,
        E: Into<MqttError> + Send + 'static,
        W: Sink<Packet> + Unpin + Send + 'static,
        W::Error: fmt::Debug + Send,
    {
        session::handle(self.clone(), reader, writer, remote_addr).await
    }

    /// Stops every live session and waits, up to `mqtt.shutdown_timeout`, for them to finish.
    pub async fn shutdown(&self) -> bool {
        self.registry.shutdown_all(self.settings.mqtt.shutdown_timeout).await
    }

    #[inline]
    pub(crate) fn next_session_id(&self) -> u64 {
        self.session_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut stats = self.stats.to_json();
        if let Some(obj) = stats.as_object_mut() {
            let subscriptions = self.router.subscriptions();
            obj.insert("subscriptions.count".into(), json!(subscriptions.count()));
            obj.insert("subscriptions.max".into(), json!(subscriptions.max()));
            obj.insert("retaineds.count".into(), json!(self.retain.count()));
            obj.insert("retaineds.max".into(), json!(self.retain.max()));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use nonzero_ext::nonzero;
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{Message, SessionHandle};
    use crate::store::testing::FaultyStore;
    use crate::store::MemoryStore;
    use crate::types::PacketId;

    fn broker() -> (Broker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Broker::new(Settings::default(), store.clone()), store)
    }

    fn publish(topic: &str, qos: QoS, retain: bool, payload: &'static [u8]) -> Publish {
        Publish { dup: false, retain, qos, topic: topic.into(), packet_id: None, payload: Bytes::from_static(payload) }
    }

    async fn online(broker: &Broker, client_id: &str, clean_session: bool, cap: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(cap);
        let handle = SessionHandle::new(broker.next_session_id(), client_id.into(), clean_session, ([127, 0, 0, 1], 1).into(), tx);
        broker.registry.register(handle, std::time::Duration::from_millis(10)).await;
        rx
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let (broker, _) = broker();
        let c1: ClientId = "c1".into();
        let c2: ClientId = "c2".into();
        broker.subscribe(&c1, &"a/+".into(), QoS::AtLeastOnce).await.unwrap();
        broker.subscribe(&c1, &"a/#".into(), QoS::ExactlyOnce).await.unwrap();
        broker.subscribe(&c2, &"a/b".into(), QoS::AtMostOnce).await.unwrap();
        let mut rx1 = online(&broker, "c1", true, 8).await;
        let mut rx2 = online(&broker, "c2", true, 8).await;

        assert_eq!(broker.publish(&"p".into(), publish("a/b", QoS::ExactlyOnce, true, b"x")).await.unwrap(), 2);
        match rx1.recv().await {
            Some(Message::Forward(p)) => {
                assert_eq!(p.qos, QoS::ExactlyOnce);
                assert!(!p.retain);
            }
            m => panic!("unexpected {:?}", m),
        }
        assert!(rx1.try_recv().is_err());
        match rx2.recv().await {
            Some(Message::Forward(p)) => assert_eq!(p.qos, QoS::AtMostOnce),
            m => panic!("unexpected {:?}", m),
        }

        assert!(broker.publish(&"p".into(), publish("a/+", QoS::AtMostOnce, false, b"x")).await.is_err());
        assert_eq!(broker.stats()["subscriptions.count"], 3);
        assert_eq!(broker.stats()["retaineds.count"], 1);
    }

    #[tokio::test]
    async fn test_offline_delivery() {
        let (broker, store) = broker();
        let c1: ClientId = "c1".into();
        broker.subscribe(&c1, &"t".into(), QoS::AtLeastOnce).await.unwrap();

        broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"1")).await.unwrap();
        broker.publish(&"p".into(), publish("t", QoS::AtMostOnce, false, b"2")).await.unwrap();
        assert_eq!(store.outbound_len(&c1), 1);
        assert_eq!(broker.packet_ids.in_use(&c1), 1);
        assert_eq!(broker.stats.offline_packets.count(), 1);

        let _rx = online(&broker, "c1", false, 1).await;
        broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"3")).await.unwrap();
        broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"4")).await.unwrap();
        broker.publish(&"p".into(), publish("t", QoS::AtMostOnce, false, b"5")).await.unwrap();
        assert_eq!(store.outbound_len(&c1), 2);
        assert_eq!(broker.stats.dropped_packets.count(), 1);
    }

    #[tokio::test]
    async fn test_retained_on_subscribe() {
        let (broker, _) = broker();
        broker.publish(&"p".into(), publish("r/1", QoS::ExactlyOnce, true, b"keep")).await.unwrap();
        broker.publish(&"p".into(), publish("r/2", QoS::AtLeastOnce, true, b"")).await.unwrap();

        let retaineds = broker.subscribe(&"c".into(), &"r/#".into(), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(retaineds.len(), 1);
        assert_eq!(retaineds[0].qos, QoS::AtLeastOnce);
        assert!(retaineds[0].retain);

        broker.publish(&"p".into(), publish("r/1", QoS::AtMostOnce, true, b"")).await.unwrap();
        assert!(broker.subscribe(&"c".into(), &"r/#".into(), QoS::AtLeastOnce).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore() {
        let (broker, store) = broker();
        let c1: ClientId = "c1".into();
        broker.subscribe(&c1, &"x/#".into(), QoS::AtLeastOnce).await.unwrap();
        broker.publish(&"p".into(), publish("x/1", QoS::AtLeastOnce, true, b"r")).await.unwrap();
        assert_eq!(store.outbound_len(&c1), 1);

        let restored = Broker::new(Settings::default(), store.clone());
        restored.restore().await.unwrap();
        assert_eq!(restored.router.subscriptions_of(&c1).await, vec![("x/#".into(), QoS::AtLeastOnce)]);
        assert_eq!(restored.retain.count(), 1);
        let held: PacketId = nonzero!(1u16);
        assert!(!restored.packet_ids.reserve(&c1, held));
        assert_eq!(restored.packet_ids.request(&c1).unwrap(), nonzero!(2u16));
    }

    #[tokio::test]
    async fn test_store_failures() {
        let store = Arc::new(FaultyStore::default());
        let broker = Broker::new(Settings::default(), store.clone());
        let c1: ClientId = "c1".into();
        broker.subscribe(&c1, &"t".into(), QoS::AtLeastOnce).await.unwrap();

        store.fail_retained.store(true, Ordering::SeqCst);
        assert!(broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, true, b"r")).await.is_err());
        assert_eq!(broker.retain.count(), 0);
        assert_eq!(store.inner.outbound_len(&c1), 0);

        store.fail_outbound.store(true, Ordering::SeqCst);
        assert_eq!(broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"1")).await.unwrap(), 1);
        assert_eq!(store.inner.outbound_len(&c1), 0);
        assert_eq!(broker.packet_ids.in_use(&c1), 0);
        assert_eq!(broker.stats.dropped_packets.count(), 1);
        assert_eq!(broker.stats.offline_packets.count(), 0);
    }

    #[tokio::test]
    async fn test_clean_session() {
        let (broker, store) = broker();
        let c1: ClientId = "c1".into();
        broker.subscribe(&c1, &"t".into(), QoS::AtLeastOnce).await.unwrap();
        broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"1")).await.unwrap();
        broker.clean_session(&c1).await;
        assert_eq!(store.outbound_len(&c1), 0);
        assert_eq!(broker.packet_ids.in_use(&c1), 0);
        assert_eq!(broker.publish(&"p".into(), publish("t", QoS::AtLeastOnce, false, b"2")).await.unwrap(), 0);
    }
}
