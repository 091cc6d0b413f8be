//! Rendezvous over plain TCP.
//!
//! The hosting side binds an ephemeral listener and publishes its address
//! as the endpoint. A joining side connects and writes the passphrase
//! before anything else; connections with the wrong passphrase are closed.

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_session::{Link, Rendezvous, RendezvousProvider, TcpTransport, UpgradeError};
use mesh_wire::{Band, Capability};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

const PASSPHRASE_LEN: usize = 16;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendezvous provider that stands up a TCP listener per group
pub struct TcpRendezvousProvider {
    bearer: Capability,
    bind_ip: IpAddr,
    capacity: usize,
    listeners: DashMap<String, Arc<TcpListener>>,
}

impl TcpRendezvousProvider {
    pub fn new(bearer: Capability, bind_ip: IpAddr, capacity: usize) -> Self {
        Self {
            bearer,
            bind_ip,
            capacity,
            listeners: DashMap::new(),
        }
    }

    /// Number of open listeners
    pub fn open_groups(&self) -> usize {
        self.listeners.len()
    }

    fn link(&self, stream: TcpStream) -> Result<Link, std::io::Error> {
        TcpTransport::link(stream, self.bearer, self.capacity)
    }
}

async fn read_passphrase(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = [0u8; PASSPHRASE_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl RendezvousProvider for TcpRendezvousProvider {
    async fn create_rendezvous(&self, owner: Uuid, band: Band) -> Result<Rendezvous, UpgradeError> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0))
            .await
            .map_err(|e| UpgradeError::Create(e.to_string()))?;
        let endpoint = listener
            .local_addr()
            .map_err(|e| UpgradeError::Create(e.to_string()))?;

        let mut secret = [0u8; PASSPHRASE_LEN / 2];
        rand::thread_rng().fill_bytes(&mut secret);
        let passphrase: String = secret.iter().map(|b| format!("{b:02x}")).collect();
        let name = Rendezvous::group_name(&owner);

        self.listeners.insert(name.clone(), Arc::new(listener));
        debug!("Listening for {} on {} ({})", name, endpoint, self.bearer);

        Ok(Rendezvous {
            name,
            passphrase,
            band,
            endpoint: endpoint.to_string(),
            owner,
        })
    }

    async fn accept(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError> {
        let listener = self
            .listeners
            .get(&rendezvous.name)
            .map(|l| l.clone())
            .ok_or_else(|| UpgradeError::Accept(format!("no group {}", rendezvous.name)))?;

        loop {
            let (mut stream, peer) = listener
                .accept()
                .await
                .map_err(|e| UpgradeError::Accept(e.to_string()))?;
            match timeout(JOIN_TIMEOUT, read_passphrase(&mut stream)).await {
                Ok(Ok(given)) if given == rendezvous.passphrase => {
                    debug!("{} joined {}", peer, rendezvous.name);
                    return self.link(stream).map_err(|e| UpgradeError::Accept(e.to_string()));
                }
                Ok(Ok(_)) => warn!("{} sent the wrong passphrase for {}", peer, rendezvous.name),
                Ok(Err(e)) => warn!("{} dropped before joining {}: {}", peer, rendezvous.name, e),
                Err(_) => warn!("{} too slow to join {}", peer, rendezvous.name),
            }
        }
    }

    async fn connect(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError> {
        let addr: SocketAddr = rendezvous
            .endpoint
            .parse()
            .map_err(|_| UpgradeError::Metadata(format!("bad endpoint {}", rendezvous.endpoint)))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| UpgradeError::Connect(e.to_string()))?;
        stream
            .write_all(rendezvous.passphrase.as_bytes())
            .await
            .map_err(|e| UpgradeError::Connect(e.to_string()))?;
        self.link(stream).map_err(|e| UpgradeError::Connect(e.to_string()))
    }

    async fn teardown(&self, rendezvous: &Rendezvous) {
        if self.listeners.remove(&rendezvous.name).is_some() {
            debug!("Closed listener for {}", rendezvous.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{AckPacket, Packet};
    use std::net::Ipv4Addr;

    fn provider() -> TcpRendezvousProvider {
        TcpRendezvousProvider::new(Capability::Lan, IpAddr::V4(Ipv4Addr::LOCALHOST), 64 * 1024)
    }

    #[tokio::test]
    async fn test_join_over_tcp() {
        let provider = provider();
        let rendezvous = provider.create_rendezvous(Uuid::new_v4(), Band::Any).await.unwrap();
        assert_eq!(rendezvous.passphrase.len(), PASSPHRASE_LEN);
        assert!(rendezvous.name.starts_with("DIRECT-"));

        let (host, joiner) = tokio::join!(provider.accept(&rendezvous), provider.connect(&rendezvous));
        let (host, joiner) = (host.unwrap(), joiner.unwrap());
        assert_eq!(host.bearer(), Capability::Lan);

        joiner.send_packet(&Packet::Ack(AckPacket::ok())).await.unwrap();
        assert_eq!(host.recv_packet().await.unwrap(), Packet::Ack(AckPacket::ok()));

        provider.teardown(&rendezvous).await;
        assert_eq!(provider.open_groups(), 0);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_refused() {
        let provider = Arc::new(provider());
        let rendezvous = provider.create_rendezvous(Uuid::new_v4(), Band::Any).await.unwrap();

        let host = tokio::spawn({
            let provider = provider.clone();
            let rendezvous = rendezvous.clone();
            async move { provider.accept(&rendezvous).await }
        });

        let mut intruder = rendezvous.clone();
        intruder.passphrase = "0000000000000000".to_string();
        let stray = provider.connect(&intruder).await.unwrap();
        // The host closes the stray connection and keeps waiting.
        assert!(stray.recv_packet().await.is_err());
        assert!(!host.is_finished());

        let joiner = provider.connect(&rendezvous).await.unwrap();
        let host = host.await.unwrap().unwrap();
        joiner.send_packet(&Packet::Ack(AckPacket::ok())).await.unwrap();
        assert!(host.recv_packet().await.is_ok());
        stray.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_endpoint() {
        let provider = provider();
        let rendezvous = Rendezvous {
            name: "DIRECT-00000000".to_string(),
            passphrase: "x".repeat(PASSPHRASE_LEN),
            band: Band::Any,
            endpoint: "mem://nowhere".to_string(),
            owner: Uuid::new_v4(),
        };
        assert!(matches!(
            provider.connect(&rendezvous).await,
            Err(UpgradeError::Metadata(_))
        ));
    }
}
