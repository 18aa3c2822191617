//! Point-to-point byte streams between committee members.
//!
//! Each protocol gets its own listener, so a server task for one protocol
//! never sees connections meant for another.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    sync::{Mutex, mpsc},
};

use crate::error::AlephError;

pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Gossip,
    Fetch,
    Multicast,
    Alert,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Gossip,
        Protocol::Fetch,
        Protocol::Multicast,
        Protocol::Alert,
    ];
}

#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Open a connection to `pid` for `protocol`.
    async fn dial(&self, pid: u16, protocol: Protocol) -> Result<BoxedConnection, AlephError>;

    /// Wait for the next inbound connection for `protocol`.
    async fn accept(&self, protocol: Protocol) -> Result<BoxedConnection, AlephError>;
}

const DUPLEX_BUFFER: usize = 64 * 1024;
const LISTEN_BACKLOG: usize = 64;

type Listener = Mutex<mpsc::Receiver<DuplexStream>>;

struct Hub {
    senders: HashMap<(u16, Protocol), mpsc::Sender<DuplexStream>>,
}

/// One member's endpoint of an in-process cluster.
pub struct MemoryNetwork {
    pid: u16,
    hub: Arc<Hub>,
    listeners: HashMap<Protocol, Listener>,
}

impl MemoryNetwork {
    /// Create connected endpoints for members `0..n_proc`.
    pub fn cluster(n_proc: u16) -> Vec<Arc<MemoryNetwork>> {
        let mut senders = HashMap::new();
        let mut receivers: Vec<HashMap<Protocol, Listener>> =
            (0..n_proc).map(|_| HashMap::new()).collect();
        for pid in 0..n_proc {
            for protocol in Protocol::ALL {
                let (sender, receiver) = mpsc::channel(LISTEN_BACKLOG);
                senders.insert((pid, protocol), sender);
                receivers[pid as usize].insert(protocol, Mutex::new(receiver));
            }
        }
        let hub = Arc::new(Hub { senders });
        receivers
            .into_iter()
            .enumerate()
            .map(|(pid, listeners)| {
                Arc::new(MemoryNetwork {
                    pid: pid as u16,
                    hub: hub.clone(),
                    listeners,
                })
            })
            .collect()
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn dial(&self, pid: u16, protocol: Protocol) -> Result<BoxedConnection, AlephError> {
        let sender = self
            .hub
            .senders
            .get(&(pid, protocol))
            .ok_or(AlephError::InvalidMember(pid))?;
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        sender
            .send(remote)
            .await
            .map_err(|_| AlephError::Network(format!("member {pid} is not listening")))?;
        Ok(Box::new(local))
    }

    async fn accept(&self, protocol: Protocol) -> Result<BoxedConnection, AlephError> {
        let listener = self
            .listeners
            .get(&protocol)
            .ok_or_else(|| AlephError::Network(format!("no listener for {protocol:?}")))?;
        let stream = listener
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AlephError::Network("network closed".to_string()))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_reaches_the_right_listener() {
        let cluster = MemoryNetwork::cluster(4);
        let server = cluster[2].clone();
        let handle = tokio::spawn(async move {
            let mut conn = server.accept(Protocol::Fetch).await.expect("accept");
            let value = conn.read_u32_le().await.expect("read");
            conn.write_u32_le(value + 1).await.expect("write");
        });

        let mut conn = cluster[0].dial(2, Protocol::Fetch).await.expect("dial");
        conn.write_u32_le(41).await.expect("write");
        assert_eq!(conn.read_u32_le().await.expect("read"), 42);
        handle.await.expect("server task");
    }

    #[tokio::test]
    async fn test_dial_unknown_member_fails() {
        let cluster = MemoryNetwork::cluster(4);
        let result = cluster[0].dial(9, Protocol::Gossip).await;
        assert!(matches!(result, Err(AlephError::InvalidMember(9))));
    }
}
