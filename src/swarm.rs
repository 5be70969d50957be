//! Peer connectivity maintenance.
//!
//! Keeps the IPFS daemon connected to a configured set of peers (the
//! uploader edge nodes holding the content) by periodically reconciling
//! `swarm/peers` against the target list. Connections are only ever added,
//! never torn down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::emit;
use crate::ipfs::IpfsApi;
use crate::metrics::events::PeersConnected;

/// Target peer set and reconciliation cadence.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Peer multiaddrs, each ending in a `/p2p/<peer-id>` component.
    pub addrs: Vec<String>,
    /// How many of the target peers must be connected at once.
    pub min_connections: usize,
    pub check_interval: Duration,
}

/// Extract the peer id from a multiaddr ending in `/p2p/<peer-id>`.
fn peer_id(addr: &str) -> Option<&str> {
    addr.rsplit_once("/p2p/").map(|(_, id)| id)
}

/// Handle to a running swarm maintenance task.
pub struct SwarmBind {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SwarmBind {
    /// Start the maintenance loop. The first reconciliation runs
    /// immediately, then repeats on the configured interval.
    pub fn spawn(ipfs: Arc<dyn IpfsApi>, config: SwarmConfig) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                check_and_connect(ipfs.as_ref(), &config).await;

                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(config.check_interval) => {}
                }
            }
        });

        Self { token, handle }
    }

    /// Stop the maintenance loop and wait for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        self.handle.await.ok();
    }
}

/// One reconciliation pass: dial enough unconnected target peers to reach
/// the connection floor. Failures are logged and retried next pass.
async fn check_and_connect(ipfs: &dyn IpfsApi, config: &SwarmConfig) {
    let peers = match ipfs.swarm_peers().await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list swarm peers");
            return;
        }
    };
    let connected: HashSet<&str> = peers.iter().map(|p| p.peer.as_str()).collect();

    let connected_targets = config
        .addrs
        .iter()
        .filter(|addr| peer_id(addr).is_some_and(|id| connected.contains(id)))
        .count();
    emit!(PeersConnected {
        count: connected_targets,
    });
    if connected_targets >= config.min_connections {
        return;
    }
    let wanted = config.min_connections - connected_targets;

    // Shuffle so repeated failures against one peer don't starve the rest.
    let mut candidates: Vec<&String> = config
        .addrs
        .iter()
        .filter(|addr| peer_id(addr).is_some_and(|id| !connected.contains(id)))
        .collect();
    candidates.shuffle(&mut rand::rng());
    candidates.truncate(wanted);

    tracing::debug!(
        connected = connected_targets,
        dialing = candidates.len(),
        "reconciling swarm connections"
    );

    let dials = candidates.into_iter().map(|addr| async move {
        if let Err(e) = ipfs.swarm_connect(addr).await {
            tracing::warn!(addr = %addr, error = %e, "swarm connect failed");
        }
    });
    join_all(dials).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpfsError;
    use crate::ipfs::{GcResult, Identity, ObjectStat, SwarmPeer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use cid::Cid;
    use std::sync::Mutex;

    struct FakeSwarm {
        connected: Mutex<Vec<String>>,
        dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IpfsApi for FakeSwarm {
        async fn id(&self) -> Result<Identity, IpfsError> {
            unimplemented!()
        }

        async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>, IpfsError> {
            Ok(self
                .connected
                .lock()
                .unwrap()
                .iter()
                .map(|id| SwarmPeer {
                    peer: id.clone(),
                    addr: String::new(),
                })
                .collect())
        }

        async fn swarm_connect(&self, addr: &str) -> Result<(), IpfsError> {
            self.dialed.lock().unwrap().push(addr.to_string());
            if let Some(id) = peer_id(addr) {
                self.connected.lock().unwrap().push(id.to_string());
            }
            Ok(())
        }

        async fn block_get(&self, _cid: &Cid) -> Result<Bytes, IpfsError> {
            unimplemented!()
        }

        async fn object_stat(&self, _cid: &Cid) -> Result<ObjectStat, IpfsError> {
            unimplemented!()
        }

        async fn dag_export(&self, _cid: &Cid) -> Result<crate::ipfs::ChunkStream, IpfsError> {
            unimplemented!()
        }

        async fn repo_gc(&self) -> Result<Vec<GcResult>, IpfsError> {
            Ok(vec![])
        }
    }

    fn addr(id: &str) -> String {
        format!("/dns4/elastic.dag.house/tcp/443/wss/p2p/{id}")
    }

    #[test]
    fn test_peer_id_extraction() {
        assert_eq!(peer_id(&addr("12D3KooWPeer")), Some("12D3KooWPeer"));
        assert_eq!(peer_id("/ip4/1.2.3.4/tcp/4001"), None);
    }

    #[tokio::test]
    async fn test_dials_up_to_connection_floor() {
        crate::metrics::server::init_test();
        let ipfs = FakeSwarm {
            connected: Mutex::new(vec!["peer-a".to_string()]),
            dialed: Mutex::new(vec![]),
        };
        let config = SwarmConfig {
            addrs: vec![addr("peer-a"), addr("peer-b"), addr("peer-c")],
            min_connections: 2,
            check_interval: Duration::from_secs(60),
        };

        check_and_connect(&ipfs, &config).await;

        // One already connected, floor of two: exactly one dial, and never
        // to the already-connected peer.
        let dialed = ipfs.dialed.lock().unwrap().clone();
        assert_eq!(dialed.len(), 1);
        assert_ne!(dialed[0], addr("peer-a"));
    }

    #[tokio::test]
    async fn test_no_dials_at_or_above_floor() {
        crate::metrics::server::init_test();
        let ipfs = FakeSwarm {
            connected: Mutex::new(vec!["peer-a".to_string(), "peer-b".to_string()]),
            dialed: Mutex::new(vec![]),
        };
        let config = SwarmConfig {
            addrs: vec![addr("peer-a"), addr("peer-b"), addr("peer-c")],
            min_connections: 2,
            check_interval: Duration::from_secs(60),
        };

        check_and_connect(&ipfs, &config).await;
        assert!(ipfs.dialed.lock().unwrap().is_empty());
    }
}
