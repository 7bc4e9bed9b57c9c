use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{PacketId, Publish};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum MomentStatus {
    /// QoS 1, waiting for PUBACK
    UnAck,
    /// QoS 2, waiting for PUBREC
    UnReceived,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

#[derive(Debug, Clone)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub status: MomentStatus,
    pub update_time: Instant,
    pub retries: usize,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, publish: Publish) -> Self {
        Self { publish, status, update_time: Instant::now(), retries: 0 }
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus) {
        self.update_time = Instant::now();
        self.status = status;
    }

    #[inline]
    pub fn timeout(&self, interval: Duration, now: Instant) -> bool {
        !interval.is_zero() && now.saturating_duration_since(self.update_time) >= interval
    }
}

/// Outbound QoS 1/2 messages sent to the client and not yet acknowledged.
pub struct OutInflight {
    retry_interval: Duration,
    max_retries: usize,
    queues: BTreeMap<PacketId, OutInflightMessage>,
}

impl OutInflight {
    #[inline]
    pub fn new(retry_interval: Duration, max_retries: usize) -> Self {
        Self { retry_interval, max_retries, queues: BTreeMap::new() }
    }

    #[inline]
    pub fn push_back(&mut self, m: OutInflightMessage) -> Option<OutInflightMessage> {
        match m.publish.packet_id {
            Some(packet_id) => self.queues.insert(packet_id, m),
            None => {
                log::warn!("packet_id is None, inflight message: {:?}", m);
                None
            }
        }
    }

    #[inline]
    pub fn get(&self, packet_id: &PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(packet_id)
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        self.queues.remove(packet_id)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, s: MomentStatus) -> bool {
        match self.queues.get_mut(packet_id) {
            Some(m) => {
                m.update_status(s);
                true
            }
            None => false,
        }
    }

    /// Messages due for a resend, oldest first. Each returned message has its retry count bumped
    /// and its timer restarted; messages that ran out of retries are returned once in `exhausted`.
    pub fn take_timeouts(&mut self) -> (Vec<OutInflightMessage>, Vec<PacketId>) {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        for (packet_id, m) in self.queues.iter_mut() {
            if m.retries > self.max_retries || !m.timeout(self.retry_interval, now) {
                continue;
            }
            if m.retries == self.max_retries {
                //stays inflight until acknowledged or replayed on reconnect
                m.retries += 1;
                exhausted.push(*packet_id);
                continue;
            }
            let sent_at = m.update_time;
            m.retries += 1;
            m.update_time = now;
            resend.push((sent_at, m.clone()));
        }
        resend.sort_by_key(|(sent_at, _)| *sent_at);
        (resend.into_iter().map(|(_, m)| m).collect(), exhausted)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
