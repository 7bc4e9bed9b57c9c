use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

use tinymq_conf::QueuePolicy;

use crate::types::{ClientId, Packet, Reason, Stats};

/// Producer side of a session's inbound packet queue, applying the configured full-queue policy.
pub(crate) struct InboundSender {
    client_id: ClientId,
    tx: mpsc::Sender<Packet>,
    policy: QueuePolicy,
    timeout: Duration,
    stats: Arc<Stats>,
}

impl InboundSender {
    pub(crate) fn new(
        client_id: ClientId,
        tx: mpsc::Sender<Packet>,
        policy: QueuePolicy,
        timeout: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self { client_id, tx, policy, timeout, stats }
    }

    /// Queues `packet` for the processor. An error is the reason the reader should stop.
    pub(crate) async fn push(&self, packet: Packet) -> Result<(), Reason> {
        match self.policy {
            QueuePolicy::Block => match self.tx.send_timeout(packet, self.timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(p)) => {
                    log::warn!(
                        "{:?} inbound queue is full for {:?}, dropping connection, packet: {}",
                        self.client_id,
                        self.timeout,
                        p.name()
                    );
                    Err(Reason::InboundQueueFull)
                }
                Err(SendTimeoutError::Closed(_)) => Err(Reason::RemoteClose(None)),
            },
            QueuePolicy::Drop => match self.tx.try_send(packet) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(p)) => {
                    self.stats.dropped_packets.inc();
                    log::warn!("{:?} inbound queue is full, dropped packet: {}", self.client_id, p.name());
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(Reason::RemoteClose(None)),
            },
        }
    }
}
