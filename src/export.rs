//! CAR export engine: size guard, idle timer, and progress reporting
//! around `dag/export`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ExportError;
use crate::ipfs::IpfsApi;
use crate::metrics::HealthState;

/// Multicodec for raw blocks.
const RAW_CODEC: u64 = 0x55;
/// Multicodec for dag-pb (UnixFS) nodes.
const DAG_PB_CODEC: u64 = 0x70;

/// How long the size determination step may take.
const SIZE_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum quiet time between chunks before the export is abandoned.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Progress log cadence for long exports.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Internal buffer between the export task and the uploader.
const CHANNEL_CAPACITY: usize = 4;

/// Streams CAR exports out of the IPFS daemon with guardrails.
pub struct Exporter {
    ipfs: Arc<dyn IpfsApi>,
    max_dag_size: u64,
    size_timeout: Duration,
    block_timeout: Duration,
    report_interval: Duration,
    health: Option<HealthState>,
}

impl Exporter {
    pub fn new(ipfs: Arc<dyn IpfsApi>, max_dag_size: u64) -> Self {
        Self {
            ipfs,
            max_dag_size,
            size_timeout: SIZE_TIMEOUT,
            block_timeout: BLOCK_TIMEOUT,
            report_interval: REPORT_INTERVAL,
            health: None,
        }
    }

    /// Heartbeat this liveness state on every progress tick, so an export
    /// that streams for longer than the health grace period stays green.
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    /// Shrink the guard timers, for tests.
    pub fn with_timeouts(mut self, size_timeout: Duration, block_timeout: Duration) -> Self {
        self.size_timeout = size_timeout;
        self.block_timeout = block_timeout;
        self
    }

    /// Shrink the progress cadence, for tests.
    pub fn with_report_interval(mut self, report_interval: Duration) -> Self {
        self.report_interval = report_interval;
        self
    }

    /// Determine the DAG size where the codec makes that cheap.
    ///
    /// Raw DAGs are a single block, so the block length is the size.
    /// dag-pb carries a cumulative size in its stat. Other codecs have no
    /// cheap size, so the guard is skipped and the export proceeds.
    async fn determine_size(&self, cid: &Cid) -> Result<Option<u64>, ExportError> {
        let lookup = async {
            match cid.codec() {
                RAW_CODEC => self.ipfs.block_get(cid).await.map(|b| Some(b.len() as u64)),
                DAG_PB_CODEC => self
                    .ipfs
                    .object_stat(cid)
                    .await
                    .map(|s| Some(s.cumulative_size)),
                _ => Ok(None),
            }
        };

        match tokio::time::timeout(self.size_timeout, lookup).await {
            Ok(Ok(size)) => Ok(size),
            Ok(Err(source)) => Err(ExportError::Transport { source }),
            Err(_) => Err(ExportError::SizeTimeout {
                timeout_secs: self.size_timeout.as_secs(),
            }),
        }
    }

    /// Start exporting the DAG behind `cid` as a CAR stream.
    ///
    /// Fails before any byte is streamed when the DAG's determinable size
    /// exceeds the configured maximum. Once streaming, an idle timer aborts
    /// the export if no chunk arrives within the block timeout.
    pub async fn export(&self, cid: &Cid) -> Result<ExportStream, ExportError> {
        let expected_size = self.determine_size(cid).await?;
        if let Some(size) = expected_size {
            if size > self.max_dag_size {
                return Err(ExportError::TooBig {
                    size,
                    max_size: self.max_dag_size,
                });
            }
        } else {
            tracing::debug!(cid = %cid, codec = cid.codec(), "DAG size not determinable, exporting unguarded");
        }

        // A daemon that accepts the connection but never answers would
        // otherwise park this await forever, before the idle timer exists.
        let upstream = match tokio::time::timeout(self.block_timeout, self.ipfs.dag_export(cid))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ExportError::Transport { source }),
            Err(_) => {
                tracing::warn!(cid = %cid, timeout_secs = self.block_timeout.as_secs(), "export never started, abandoning");
                return Err(ExportError::ChunkTimeout {
                    timeout_secs: self.block_timeout.as_secs(),
                });
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let received = Arc::new(AtomicU64::new(0));
        tokio::spawn(pump(
            *cid,
            upstream,
            tx,
            received.clone(),
            expected_size,
            PumpGuards {
                block_timeout: self.block_timeout,
                report_interval: self.report_interval,
                health: self.health.clone(),
            },
        ));

        Ok(ExportStream { rx, expected_size })
    }
}

/// Timers and liveness hook threaded into the pump task.
struct PumpGuards {
    block_timeout: Duration,
    report_interval: Duration,
    health: Option<HealthState>,
}

/// Drive the upstream chunk stream into the channel, enforcing the idle
/// timer and logging progress on long exports.
async fn pump(
    cid: Cid,
    mut upstream: crate::ipfs::ChunkStream,
    tx: mpsc::Sender<Result<Bytes, ExportError>>,
    received: Arc<AtomicU64>,
    expected_size: Option<u64>,
    guards: PumpGuards,
) {
    let block_timeout = guards.block_timeout;
    let mut deadline = Instant::now() + block_timeout;
    let mut report = tokio::time::interval_at(
        Instant::now() + guards.report_interval,
        guards.report_interval,
    );

    loop {
        tokio::select! {
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    deadline = Instant::now() + block_timeout;
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Consumer hung up (upload failed or was dropped).
                        return;
                    }
                }
                Some(Err(source)) => {
                    let _ = tx.send(Err(ExportError::Transport { source })).await;
                    return;
                }
                None => return,
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(cid = %cid, timeout_secs = block_timeout.as_secs(), "export idle, abandoning");
                let _ = tx
                    .send(Err(ExportError::ChunkTimeout {
                        timeout_secs: block_timeout.as_secs(),
                    }))
                    .await;
                return;
            }
            _ = report.tick() => {
                // A still-streaming export is a live pipeline.
                if let Some(health) = &guards.health {
                    health.heartbeat();
                }
                tracing::info!(
                    cid = %cid,
                    received_bytes = received.load(Ordering::Relaxed),
                    expected_bytes = expected_size,
                    "export in progress"
                );
            }
        }
    }
}

/// Byte-chunk stream of one guarded CAR export.
#[derive(Debug)]
pub struct ExportStream {
    rx: mpsc::Receiver<Result<Bytes, ExportError>>,
    expected_size: Option<u64>,
}

impl ExportStream {
    /// The DAG size determined up front, when the codec allowed it.
    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }
}

impl Stream for ExportStream {
    type Item = Result<Bytes, ExportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackupErrorKind, IpfsError};
    use crate::ipfs::{GcResult, Identity, IpfsClient, ObjectStat, SwarmPeer};
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::AtomicBool;

    // CIDv0, dag-pb codec.
    const CID_DAG_PB: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";
    // CIDv1, raw codec.
    const CID_RAW: &str = "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy";

    struct FakeIpfs {
        stat_size: u64,
        block: Bytes,
        chunks: std::sync::Mutex<Vec<Bytes>>,
        chunk_delay: Duration,
        stall_forever: bool,
        export_called: AtomicBool,
    }

    impl Default for FakeIpfs {
        fn default() -> Self {
            Self {
                stat_size: 0,
                block: Bytes::new(),
                chunks: std::sync::Mutex::new(vec![]),
                chunk_delay: Duration::ZERO,
                stall_forever: false,
                export_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl IpfsApi for FakeIpfs {
        async fn id(&self) -> Result<Identity, IpfsError> {
            unimplemented!()
        }

        async fn swarm_peers(&self) -> Result<Vec<SwarmPeer>, IpfsError> {
            unimplemented!()
        }

        async fn swarm_connect(&self, _addr: &str) -> Result<(), IpfsError> {
            unimplemented!()
        }

        async fn block_get(&self, _cid: &Cid) -> Result<Bytes, IpfsError> {
            Ok(self.block.clone())
        }

        async fn object_stat(&self, _cid: &Cid) -> Result<ObjectStat, IpfsError> {
            Ok(ObjectStat {
                cumulative_size: self.stat_size,
            })
        }

        async fn dag_export(&self, _cid: &Cid) -> Result<crate::ipfs::ChunkStream, IpfsError> {
            self.export_called.store(true, Ordering::Relaxed);
            if self.stall_forever {
                return Ok(Box::pin(futures::stream::pending()));
            }
            let chunks: Vec<Result<Bytes, IpfsError>> = self
                .chunks
                .lock()
                .unwrap()
                .drain(..)
                .map(Ok)
                .collect();
            let delay = self.chunk_delay;
            Ok(Box::pin(futures::stream::iter(chunks).then(
                move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                },
            )))
        }

        async fn repo_gc(&self) -> Result<Vec<GcResult>, IpfsError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_oversized_dag_rejected_before_streaming() {
        let ipfs = Arc::new(FakeIpfs {
            stat_size: 100,
            ..Default::default()
        });
        let exporter = Exporter::new(ipfs.clone(), 50);

        let err = exporter
            .export(&Cid::from_str(CID_DAG_PB).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::TooBig { size: 100, max_size: 50 }));
        assert_eq!(err.kind(), BackupErrorKind::TooBig);
        assert!(!ipfs.export_called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_raw_dag_sized_by_block_length() {
        let ipfs = Arc::new(FakeIpfs {
            block: Bytes::from(vec![0u8; 64]),
            chunks: std::sync::Mutex::new(vec![Bytes::from_static(b"chunk")]),
            ..Default::default()
        });
        let exporter = Exporter::new(ipfs, 1024);

        let stream = exporter
            .export(&Cid::from_str(CID_RAW).unwrap())
            .await
            .unwrap();
        assert_eq!(stream.expected_size(), Some(64));

        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"chunk");
    }

    #[tokio::test]
    async fn test_unknown_codec_exports_unguarded() {
        // dag-cbor CIDv1: size is not determinable, export must proceed
        // even with a tiny max size.
        let cid = Cid::new_v1(0x71, *Cid::from_str(CID_RAW).unwrap().hash());
        let ipfs = Arc::new(FakeIpfs {
            chunks: std::sync::Mutex::new(vec![Bytes::from_static(b"data")]),
            ..Default::default()
        });
        let exporter = Exporter::new(ipfs, 1);

        let stream = exporter.export(&cid).await.unwrap();
        assert_eq!(stream.expected_size(), None);
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let ipfs = Arc::new(FakeIpfs {
            stat_size: 10,
            stall_forever: true,
            ..Default::default()
        });
        let exporter = Exporter::new(ipfs, 1024)
            .with_timeouts(Duration::from_secs(10), Duration::from_millis(50));

        let mut stream = exporter
            .export(&Cid::from_str(CID_DAG_PB).unwrap())
            .await
            .unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ExportError::ChunkTimeout { .. }));
        assert_eq!(err.kind(), BackupErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out_before_streaming() {
        // A daemon that accepts the TCP connection but never writes a
        // response must not park the export forever.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let ipfs = Arc::new(IpfsClient::new(&format!("http://{addr}")).unwrap());
        // dag-cbor: no size lookup, the export request is the first RPC.
        let cid = Cid::new_v1(0x71, *Cid::from_str(CID_RAW).unwrap().hash());
        let exporter = Exporter::new(ipfs, 1024)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));

        let err = exporter.export(&cid).await.unwrap_err();
        assert!(matches!(err, ExportError::ChunkTimeout { .. }));
        assert_eq!(err.kind(), BackupErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_slow_export_keeps_health_fresh() {
        let health = HealthState::new(Duration::from_millis(200));
        let ipfs = Arc::new(FakeIpfs {
            stat_size: 10,
            chunks: std::sync::Mutex::new(vec![Bytes::from_static(b"chunk"); 5]),
            chunk_delay: Duration::from_millis(80),
            ..Default::default()
        });
        let exporter = Exporter::new(ipfs, 1024)
            .with_report_interval(Duration::from_millis(50))
            .with_health(health.clone());

        let stream = exporter
            .export(&Cid::from_str(CID_DAG_PB).unwrap())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 5);
        // 400ms of streaming outlasts the 200ms grace; the progress
        // ticks are what keep the liveness state green.
        assert!(health.is_healthy());
    }
}
