//! Connection authentication.
//!
//! The broker asks its [`Authenticator`] about every CONNECT before the session is registered.
//! Anything other than `ConnectionAccepted` is sent back in the CONNACK and the connection is
//! closed. Authorization of individual publishes and subscriptions is not handled here.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::types::{Connect, ConnectAckReason};

#[async_trait]
pub trait Authenticator: Sync + Send {
    async fn authenticate(&self, connect: &Connect, remote_addr: SocketAddr) -> ConnectAckReason;
}

/// Admits every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    #[inline]
    async fn authenticate(&self, _connect: &Connect, _remote_addr: SocketAddr) -> ConnectAckReason {
        ConnectAckReason::ConnectionAccepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let connect = Connect { client_id: "c".into(), ..Default::default() };
        assert_eq!(
            AllowAll.authenticate(&connect, ([127, 0, 0, 1], 1883).into()).await,
            ConnectAckReason::ConnectionAccepted
        );
    }
}
