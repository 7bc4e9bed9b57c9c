//! Durable session state.
//!
//! The broker persists four kinds of records through [`Store`]: subscriptions, retained messages,
//! inbound QoS 2 packets awaiting PUBREL, and outbound QoS 1/2 packets awaiting acknowledgement
//! (including those queued for offline clients). [`MemoryStore`] keeps everything in process.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use tinymq_utils::{timestamp_millis, TimestampMillis};

use crate::types::{ClientId, HashMap, PacketId, Publish, QoS, TopicFilter, TopicName};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPacket {
    pub client_id: ClientId,
    pub packet_id: PacketId,
    pub direction: Direction,
    /// For outbound records, the form to send when the packet is replayed.
    pub publish: Publish,
    /// Outbound QoS 2 only: PUBREC was received, PUBREL is owed instead of the PUBLISH.
    #[serde(default)]
    pub released: bool,
    pub stored_at: TimestampMillis,
}

impl StoredPacket {
    #[inline]
    fn new(client_id: &ClientId, packet_id: PacketId, direction: Direction, publish: &Publish) -> Self {
        Self {
            client_id: client_id.clone(),
            packet_id,
            direction,
            publish: publish.clone(),
            released: false,
            stored_at: timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait Store: Sync + Send {
    async fn store_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<()>;

    async fn delete_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter) -> Result<()>;

    async fn clean_subscriptions(&self, client_id: &ClientId) -> Result<()>;

    async fn lookup_all_subscriptions(&self) -> Result<Vec<(ClientId, TopicFilter, QoS)>>;

    ///An empty payload deletes the retained message of `publish.topic`
    async fn store_retained(&self, publish: &Publish) -> Result<()>;

    async fn lookup_all_retained(&self) -> Result<Vec<Publish>>;

    async fn store_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId, publish: &Publish) -> Result<()>;

    async fn find_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<Option<StoredPacket>>;

    async fn delete_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    ///Storing an id that is already present replaces the packet but keeps its position
    async fn store_outbound_packet(&self, client_id: &ClientId, packet_id: PacketId, publish: &Publish)
        -> Result<()>;

    ///Marks a stored outbound QoS 2 packet as acknowledged by PUBREC, so a replay sends PUBREL
    async fn release_outbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    ///Outbound packets of `client_id` in the order they were first stored
    fn stream_outbound_packets(&self, client_id: &ClientId) -> BoxStream<'static, Result<StoredPacket>>;

    async fn delete_outbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    ///Ids of every stored outbound packet, used to seed the packet id tables at startup
    async fn lookup_all_outbound_ids(&self) -> Result<Vec<(ClientId, PacketId)>>;

    ///Removes both inbound and outbound packets of `client_id`
    async fn clean_all_packets(&self, client_id: &ClientId) -> Result<()>;
}

type Packets = HashMap<PacketId, StoredPacket>;
type OrderedPackets = HashMap<PacketId, (u64, StoredPacket)>;

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: DashMap<ClientId, HashMap<TopicFilter, QoS>, ahash::RandomState>,
    retained: DashMap<TopicName, Publish, ahash::RandomState>,
    inbound: DashMap<ClientId, Packets, ahash::RandomState>,
    outbound: DashMap<ClientId, OrderedPackets, ahash::RandomState>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn outbound_len(&self, client_id: &ClientId) -> usize {
        self.outbound.get(client_id).map(|p| p.len()).unwrap_or_default()
    }

    #[inline]
    pub fn inbound_len(&self, client_id: &ClientId) -> usize {
        self.inbound.get(client_id).map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn store_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<()> {
        self.subscriptions.entry(client_id.clone()).or_default().insert(topic_filter.clone(), qos);
        Ok(())
    }

    async fn delete_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter) -> Result<()> {
        if let Some(mut subs) = self.subscriptions.get_mut(client_id) {
            subs.remove(topic_filter);
        }
        self.subscriptions.remove_if(client_id, |_, subs| subs.is_empty());
        Ok(())
    }

    async fn clean_subscriptions(&self, client_id: &ClientId) -> Result<()> {
        self.subscriptions.remove(client_id);
        Ok(())
    }

    async fn lookup_all_subscriptions(&self) -> Result<Vec<(ClientId, TopicFilter, QoS)>> {
        let mut all = Vec::new();
        for entry in self.subscriptions.iter() {
            for (topic_filter, qos) in entry.value().iter() {
                all.push((entry.key().clone(), topic_filter.clone(), *qos));
            }
        }
        Ok(all)
    }

    async fn store_retained(&self, publish: &Publish) -> Result<()> {
        if publish.payload.is_empty() {
            self.retained.remove(&publish.topic);
        } else {
            self.retained.insert(publish.topic.clone(), publish.clone());
        }
        Ok(())
    }

    async fn lookup_all_retained(&self) -> Result<Vec<Publish>> {
        Ok(self.retained.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn store_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId, publish: &Publish) -> Result<()> {
        let packet = StoredPacket::new(client_id, packet_id, Direction::Inbound, publish);
        self.inbound.entry(client_id.clone()).or_default().insert(packet_id, packet);
        Ok(())
    }

    async fn find_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<Option<StoredPacket>> {
        Ok(self.inbound.get(client_id).and_then(|packets| packets.get(&packet_id).cloned()))
    }

    async fn delete_inbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        if let Some(mut packets) = self.inbound.get_mut(client_id) {
            packets.remove(&packet_id);
        }
        self.inbound.remove_if(client_id, |_, packets| packets.is_empty());
        Ok(())
    }

    async fn store_outbound_packet(
        &self,
        client_id: &ClientId,
        packet_id: PacketId,
        publish: &Publish,
    ) -> Result<()> {
        let packet = StoredPacket::new(client_id, packet_id, Direction::Outbound, publish);
        let mut packets = self.outbound.entry(client_id.clone()).or_default();
        match packets.entry(packet_id) {
            Entry::Occupied(mut e) => e.get_mut().1 = packet,
            Entry::Vacant(e) => {
                e.insert((self.seq.fetch_add(1, Ordering::SeqCst), packet));
            }
        }
        Ok(())
    }

    async fn release_outbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        if let Some(mut packets) = self.outbound.get_mut(client_id) {
            if let Some((_, packet)) = packets.get_mut(&packet_id) {
                packet.released = true;
            }
        }
        Ok(())
    }

    fn stream_outbound_packets(&self, client_id: &ClientId) -> BoxStream<'static, Result<StoredPacket>> {
        let mut packets = self
            .outbound
            .get(client_id)
            .map(|packets| packets.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        packets.sort_by_key(|(seq, _)| *seq);
        stream::iter(packets.into_iter().map(|(_, p)| Ok(p))).boxed()
    }

    async fn delete_outbound_packet(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        if let Some(mut packets) = self.outbound.get_mut(client_id) {
            packets.remove(&packet_id);
        }
        self.outbound.remove_if(client_id, |_, packets| packets.is_empty());
        Ok(())
    }

    async fn lookup_all_outbound_ids(&self) -> Result<Vec<(ClientId, PacketId)>> {
        let mut all = Vec::new();
        for entry in self.outbound.iter() {
            all.extend(entry.value().keys().map(|id| (entry.key().clone(), *id)));
        }
        Ok(all)
    }

    async fn clean_all_packets(&self, client_id: &ClientId) -> Result<()> {
        self.inbound.remove(client_id);
        self.outbound.remove(client_id);
        Ok(())
    }
}
