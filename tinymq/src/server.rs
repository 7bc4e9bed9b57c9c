//! Accept loop.
//!
//! [`MqttServer`] takes connections from an [`Acceptor`] and runs each on its own task until the
//! server is shut down. Transient accept failures (aborted handshakes, descriptor exhaustion) are
//! retried with exponential backoff from 5ms up to 1s; any other accept error ends the loop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::{Sink, Stream};
use tokio::sync::watch;

use tinymq_codec::error::DecodeError;
use tinymq_net::{is_transient_accept_error, Builder, Listener, MqttError, PacketReader, PacketWriter};

use crate::broker::Broker;
use crate::types::Packet;
use crate::Result;

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A source of framed client connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    type Reader: Stream<Item = std::result::Result<Packet, Self::Error>> + Unpin + Send + 'static;
    type Writer: Sink<Packet> + Unpin + Send + 'static;
    type Error: Into<MqttError> + Send + 'static;

    async fn accept(&self) -> io::Result<(Self::Reader, Self::Writer, SocketAddr)>;
}

#[async_trait]
impl Acceptor for Listener {
    type Reader = PacketReader;
    type Writer = PacketWriter;
    type Error = DecodeError;

    #[inline]
    async fn accept(&self) -> io::Result<(PacketReader, PacketWriter, SocketAddr)> {
        let conn = Listener::accept(self).await?;
        Ok((conn.reader, conn.writer, conn.remote_addr))
    }
}

fn accept_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(5))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(MAX_ACCEPT_BACKOFF)
        .with_max_elapsed_time(None)
        .build()
}

pub struct MqttServer {
    broker: Broker,
    shutdown: watch::Sender<bool>,
}

impl MqttServer {
    pub fn new(broker: Broker) -> Self {
        Self { broker, shutdown: watch::channel(false).0 }
    }

    #[inline]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Binds `builder` and serves it until shutdown.
    pub async fn listen(&self, builder: Builder) -> Result<()> {
        let listener = builder.bind()?;
        self.serve(listener).await
    }

    /// Accepts connections from `acceptor` until [`shutdown`](Self::shutdown) is called or a
    /// non-transient accept error occurs.
    pub async fn serve<A>(&self, acceptor: A) -> Result<()>
    where
        A: Acceptor,
        <A::Writer as Sink<Packet>>::Error: fmt::Debug + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = accept_backoff();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok((reader, writer, remote_addr)) => {
                    backoff.reset();
                    let broker = self.broker.clone();
                    tokio::spawn(async move {
                        let reason = broker.handle_connection(reader, writer, remote_addr).await;
                        log::debug!("{} connection closed, reason: {}", remote_addr, reason);
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = backoff.next_backoff().unwrap_or(MAX_ACCEPT_BACKOFF);
                    log::warn!("accept error, {:?}, retry in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("accept error, {:?}", e);
                    return Err(e.into());
                }
            }
        }
        log::info!("accept loop stopped");
        Ok(())
    }

    /// Stops accepting, tells every session to stop, and waits for them up to
    /// `mqtt.shutdown_timeout`. Returns false if some sessions did not finish in time.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.send_replace(true);
        self.broker.shutdown().await
    }
}
