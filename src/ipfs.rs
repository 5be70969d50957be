//! Client for the IPFS daemon RPC API (kubo).
//!
//! This is a thin transport wrapper: every method maps to a single RPC
//! endpoint, errors are surfaced uncategorized, and timeouts beyond the
//! default request timeout are the caller's concern (the export engine arms
//! its own size and idle timers). The [`IpfsApi`] trait is the seam the
//! export engine, the swarm maintainer, and the orchestrator test against.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use reqwest::Url;
use serde::Deserialize;
use snafu::prelude::*;

use crate::error::{InvalidUrlSnafu, IpfsError, RequestSnafu};

/// Default timeout for unary RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Daemon identity, from `api/v0/id`.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(rename = "ID")]
    pub id: String,
}

/// One connected peer, from `api/v0/swarm/peers`.
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmPeer {
    #[serde(rename = "Peer")]
    pub peer: String,
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

#[derive(Debug, Deserialize)]
struct SwarmPeersResponse {
    #[serde(rename = "Peers", default)]
    peers: Vec<SwarmPeer>,
}

/// DAG statistics, from `api/v0/object/stat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStat {
    #[serde(rename = "CumulativeSize")]
    pub cumulative_size: u64,
}

/// One result line from `api/v0/repo/gc` (NDJSON).
#[derive(Debug, Clone, Deserialize)]
pub struct GcResult {
    #[serde(rename = "Key", default)]
    pub key: Option<GcKey>,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
}

/// A removed object reference in a GC result line.
#[derive(Debug, Clone, Deserialize)]
pub struct GcKey {
    #[serde(rename = "/")]
    pub cid: String,
}

/// Byte-chunk stream of one DAG export.
pub type ChunkStream = BoxStream<'static, Result<Bytes, IpfsError>>;

/// Interface to the IPFS daemon.
///
/// Implemented by [`IpfsClient`] for production and by in-process mocks in
/// tests.
#[async_trait]
pub trait IpfsApi: Send + Sync {
    /// Fetch the daemon identity. Used as a startup readiness probe.
    async fn id(&self) -> Result<Identity, IpfsError>;

    /// List currently connected peers.
    async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>, IpfsError>;

    /// Connect to a peer multiaddr.
    async fn swarm_connect(&self, addr: &str) -> Result<(), IpfsError>;

    /// Fetch a raw block. Used for sizing raw-codec DAGs.
    async fn block_get(&self, cid: &Cid) -> Result<Bytes, IpfsError>;

    /// Fetch DAG statistics. Used for sizing dag-pb DAGs.
    async fn object_stat(&self, cid: &Cid) -> Result<ObjectStat, IpfsError>;

    /// Start a CAR export of the full DAG behind `cid`.
    ///
    /// The returned stream has no timeout of its own; the export engine
    /// owns the per-chunk idle timer.
    async fn dag_export(&self, cid: &Cid) -> Result<ChunkStream, IpfsError>;

    /// Run a repo garbage collection pass, returning one result per
    /// reclaimed (or failed) object.
    async fn repo_gc(&self) -> Result<Vec<GcResult>, IpfsError>;
}

/// HTTP client for the kubo RPC API.
pub struct IpfsClient {
    base: Url,
    http: reqwest::Client,
    /// Separate client without a total request timeout: a DAG export can
    /// legitimately run for hours, the idle timer guards it instead.
    streaming: reqwest::Client,
}

impl IpfsClient {
    /// Create a client for the given API base URL.
    pub fn new(api_url: &str) -> Result<Self, IpfsError> {
        let base = Url::parse(api_url)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .context(InvalidUrlSnafu { url: api_url })?;

        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .context(RequestSnafu)?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(RPC_TIMEOUT)
            .build()
            .context(RequestSnafu)?;

        Ok(Self {
            base,
            http,
            streaming,
        })
    }

    fn endpoint_url(&self, endpoint: &'static str, arg: Option<&str>) -> Url {
        let mut url = self
            .base
            .join(endpoint)
            .expect("endpoint paths are valid URL segments");
        if let Some(arg) = arg {
            url.query_pairs_mut().append_pair("arg", arg);
        }
        url
    }

    /// POST to an endpoint and return the successful response.
    async fn post(
        &self,
        client: &reqwest::Client,
        endpoint: &'static str,
        arg: Option<&str>,
    ) -> Result<reqwest::Response, IpfsError> {
        let res = client
            .post(self.endpoint_url(endpoint, arg))
            .send()
            .await
            .context(RequestSnafu)?;
        ensure!(
            res.status().is_success(),
            crate::error::StatusSnafu {
                endpoint,
                status: res.status().as_u16(),
            }
        );
        Ok(res)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        arg: Option<&str>,
    ) -> Result<T, IpfsError> {
        let res = self.post(&self.http, endpoint, arg).await?;
        res.json().await.map_err(|e| IpfsError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl IpfsApi for IpfsClient {
    async fn id(&self) -> Result<Identity, IpfsError> {
        self.post_json("api/v0/id", None).await
    }

    async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>, IpfsError> {
        let res: SwarmPeersResponse = self.post_json("api/v0/swarm/peers", None).await?;
        Ok(res.peers)
    }

    async fn swarm_connect(&self, addr: &str) -> Result<(), IpfsError> {
        self.post(&self.http, "api/v0/swarm/connect", Some(addr))
            .await?;
        Ok(())
    }

    async fn block_get(&self, cid: &Cid) -> Result<Bytes, IpfsError> {
        let res = self
            .post(&self.http, "api/v0/block/get", Some(&cid.to_string()))
            .await?;
        res.bytes().await.context(RequestSnafu)
    }

    async fn object_stat(&self, cid: &Cid) -> Result<ObjectStat, IpfsError> {
        self.post_json("api/v0/object/stat", Some(&cid.to_string()))
            .await
    }

    async fn dag_export(&self, cid: &Cid) -> Result<ChunkStream, IpfsError> {
        let res = self
            .post(&self.streaming, "api/v0/dag/export", Some(&cid.to_string()))
            .await?;
        let stream = res
            .bytes_stream()
            .map_err(|e| IpfsError::Request { source: e });
        Ok(Box::pin(stream))
    }

    async fn repo_gc(&self) -> Result<Vec<GcResult>, IpfsError> {
        let endpoint = "api/v0/repo/gc";
        let res = self.post(&self.http, endpoint, None).await?;
        let body = res.text().await.context(RequestSnafu)?;

        // The daemon answers with NDJSON, one result per reclaimed object.
        let mut results = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let result: GcResult =
                serde_json::from_str(line).map_err(|e| IpfsError::Decode {
                    endpoint,
                    message: e.to_string(),
                })?;
            results.push(result);
        }
        Ok(results)
    }
}

/// Fetch the daemon identity, retrying while it boots.
///
/// The daemon is typically a sidecar started alongside this process, so the
/// first few attempts commonly fail with connection refused.
pub async fn await_daemon(
    ipfs: &dyn IpfsApi,
    attempts: usize,
    delay: Duration,
) -> Result<Identity, IpfsError> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match ipfs.id().await {
            Ok(identity) => return Ok(identity),
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "IPFS daemon not ready");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}
