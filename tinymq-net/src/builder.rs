use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

use tinymq_codec::MqttCodec;

use crate::Result;

pub type PacketReader = FramedRead<OwnedReadHalf, MqttCodec>;
pub type PacketWriter = FramedWrite<OwnedWriteHalf, MqttCodec>;

#[derive(Clone, Debug)]
pub struct Builder {
    /// The name of the listener, used in logs.
    pub name: String,
    ///The local address the server listens on.
    pub laddr: SocketAddr,
    ///The maximum length of the pending connection queue.
    pub backlog: i32,
    ///Sets the value of the TCP_NODELAY option on accepted sockets.
    pub nodelay: bool,
    ///Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    ///Whether to enable the SO_REUSEPORT option.
    pub reuseport: Option<bool>,
    ///Maximum allowed mqtt packet length. 0 means unlimited, default: 1M
    pub max_packet_size: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 1883)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1024 * 1024,
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn reuseport(mut self, reuseport: Option<bool>) -> Self {
        self.reuseport = reuseport;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Binds the socket. Must be called from within a tokio runtime.
    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_linger(Some(Duration::from_secs(10)))?;
        builder.set_nonblocking(true)?;

        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        #[cfg(not(windows))]
        if let Some(reuseport) = self.reuseport {
            builder.set_reuse_port(reuseport)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let tcp_listener = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        log::info!("MQTT Broker Listening on {} {}", self.name, self.laddr);
        Ok(Listener { cfg: Arc::new(self), tcp_listener })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    tcp_listener: TcpListener,
}

impl Listener {
    /// The address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    /// Accepts one connection and splits it into framed packet halves.
    pub async fn accept(&self) -> io::Result<Connection> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        socket.set_nodelay(self.cfg.nodelay)?;
        let (r, w) = socket.into_split();
        let max_packet_size = self.cfg.max_packet_size;
        Ok(Connection {
            reader: FramedRead::new(r, MqttCodec::new(max_packet_size)),
            writer: FramedWrite::new(w, MqttCodec::new(max_packet_size)),
            remote_addr,
        })
    }
}

pub struct Connection {
    pub reader: PacketReader,
    pub writer: PacketWriter,
    pub remote_addr: SocketAddr,
}

/// Accept errors worth retrying: aborted handshakes and descriptor exhaustion.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // EMFILE / ENFILE
        _ => matches!(e.raw_os_error(), Some(23) | Some(24)),
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use tinymq_codec::Packet;

    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_accept_framed() {
        let listener = Builder::new().name("test").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"\xc0\x00").await.unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = listener.accept().await.unwrap();
        let p = conn.reader.next().await.unwrap().unwrap();
        assert_eq!(p, Packet::PingRequest);
        conn.writer.send(Packet::PingResponse).await.unwrap();

        assert_eq!(&client.await.unwrap(), b"\xd0\x00");
    }
}
