//! Error types for the permafrost backup pipeline.

use snafu::prelude::*;

/// Classification of a per-candidate backup failure.
///
/// This is what Failure Memory records and what the admission filter keys
/// its retry decision on. The wire codes are stable: they appear in the
/// JSON output log and in persisted failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupErrorKind {
    /// The DAG's determinable size exceeded the configured maximum.
    TooBig,
    /// The size lookup or the chunk stream timed out.
    Timeout,
    /// The IPFS daemon transport failed (connection, HTTP status, decode).
    Transport,
    /// The object store upload failed.
    Upload,
    /// The backup registration write failed.
    Registration,
}

impl BackupErrorKind {
    /// Stable wire code for this kind.
    pub fn as_code(&self) -> &'static str {
        match self {
            BackupErrorKind::TooBig => "ERR_TOO_BIG",
            BackupErrorKind::Timeout => "ERR_TIMEOUT",
            BackupErrorKind::Transport => "ERR_TRANSPORT",
            BackupErrorKind::Upload => "ERR_UPLOAD",
            BackupErrorKind::Registration => "ERR_REGISTRATION",
        }
    }

    /// Parse a wire code back into a kind.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ERR_TOO_BIG" => Some(BackupErrorKind::TooBig),
            "ERR_TIMEOUT" => Some(BackupErrorKind::Timeout),
            "ERR_TRANSPORT" => Some(BackupErrorKind::Transport),
            "ERR_UPLOAD" => Some(BackupErrorKind::Upload),
            "ERR_REGISTRATION" => Some(BackupErrorKind::Registration),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Catalog connection string is empty.
    #[snafu(display("Catalog connection string cannot be empty"))]
    EmptyDatabaseUrl,

    /// S3 bucket name is empty.
    #[snafu(display("S3 bucket name cannot be empty"))]
    EmptyBucket,

    /// Only one half of the S3 credential pair was provided.
    #[snafu(display("S3 access key id and secret access key must be provided together"))]
    PartialCredentials,

    /// Concurrency must be at least one.
    #[snafu(display("Concurrency must be at least 1"))]
    ZeroConcurrency,

    /// Batch size must be at least one.
    #[snafu(display("Batch size must be at least 1"))]
    ZeroBatchSize,

    /// Failed to parse the metrics listen address.
    #[snafu(display("Failed to parse metrics address {addr}: {source}"))]
    AddressParse {
        addr: String,
        source: std::net::AddrParseError,
    },

    /// A configured peer multiaddr has no peer id.
    #[snafu(display("Peer address {addr} has no /p2p/ peer id component"))]
    PeerAddrMissingId { addr: String },
}

/// Errors from the IPFS daemon RPC transport.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IpfsError {
    /// HTTP request failed (connection refused, timed out, body error).
    #[snafu(display("IPFS RPC request failed: {source}"))]
    Request { source: reqwest::Error },

    /// The daemon answered with a non-success status.
    #[snafu(display("IPFS RPC {endpoint} returned HTTP status {status}"))]
    Status {
        endpoint: &'static str,
        status: u16,
    },

    /// Failed to decode a response body.
    #[snafu(display("Failed to decode IPFS RPC response from {endpoint}: {message}"))]
    Decode {
        endpoint: &'static str,
        message: String,
    },

    /// Invalid RPC endpoint URL in configuration.
    #[snafu(display("Invalid IPFS API URL {url}"))]
    InvalidUrl { url: String },
}

/// Errors from the relational catalog (candidate scan and registration).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Failed to connect to the catalog database.
    #[snafu(display("Failed to connect to catalog: {source}"))]
    Connect { source: tokio_postgres::Error },

    /// A catalog query failed.
    #[snafu(display("Catalog query failed: {source}"))]
    Query { source: tokio_postgres::Error },

    /// A backup registration write failed.
    #[snafu(display("Failed to register backup for upload {upload_id}: {source}"))]
    Register {
        upload_id: String,
        source: tokio_postgres::Error,
    },
}

/// Errors that can occur while exporting a DAG from the IPFS daemon.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExportError {
    /// The DAG's determinable size exceeds the configured maximum.
    /// No bytes are streamed when this guard trips.
    #[snafu(display("DAG too big: {size} > {max_size} bytes"))]
    TooBig { size: u64, max_size: u64 },

    /// The size determination step did not complete in time.
    #[snafu(display("Timed out determining DAG size after {timeout_secs}s"))]
    SizeTimeout { timeout_secs: u64 },

    /// No chunk arrived within the idle timeout.
    #[snafu(display("Timed out waiting for next block after {timeout_secs}s"))]
    ChunkTimeout { timeout_secs: u64 },

    /// The underlying transport failed.
    #[snafu(display("Export transport error: {source}"))]
    Transport { source: IpfsError },
}

impl ExportError {
    /// Classify this export failure for Failure Memory.
    pub fn kind(&self) -> BackupErrorKind {
        match self {
            ExportError::TooBig { .. } => BackupErrorKind::TooBig,
            ExportError::SizeTimeout { .. } | ExportError::ChunkTimeout { .. } => {
                BackupErrorKind::Timeout
            }
            ExportError::Transport { .. } => BackupErrorKind::Transport,
        }
    }
}

/// Errors from the durable sink (object store).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Failed to build the S3 client from configuration.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// An object store operation failed.
    #[snafu(display("Sink storage operation failed: {source}"))]
    Storage { source: object_store::Error },

    /// The export stream yielded an error mid-upload.
    ///
    /// The partially written multipart upload is aborted before this is
    /// returned, so classification falls through to the export failure.
    #[snafu(display("Export stream failed during upload: {source}"))]
    Export { source: ExportError },
}

impl SinkError {
    /// Classify this sink failure for Failure Memory.
    pub fn kind(&self) -> BackupErrorKind {
        match self {
            SinkError::Export { source } => source.kind(),
            _ => BackupErrorKind::Upload,
        }
    }
}

/// Errors from the optional Failure Memory store.
///
/// These are always non-fatal after startup: callers log them and fail open.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FailureStoreError {
    /// Failed to connect to the failure memory database.
    #[snafu(display("Failed to connect to failure memory: {source}"))]
    StoreConnect { source: tokio_postgres::Error },

    /// A failure memory query failed.
    #[snafu(display("Failure memory query failed: {source}"))]
    StoreQuery { source: tokio_postgres::Error },

    /// Failed to serialize a failure record.
    #[snafu(display("Failed to serialize failure record: {source}"))]
    StoreSerialize { source: serde_json::Error },
}

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize the Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics were already initialized.
    #[snafu(display("Metrics already initialized"))]
    AlreadyInitialized,

    /// Metrics have not been initialized.
    #[snafu(display("Metrics not initialized"))]
    NotInitialized,
}

/// Top-level errors for a backup run.
///
/// Anything that reaches this enum is fatal for the run; per-candidate
/// failures are converted into outcome records instead and never
/// propagate here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackupError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Catalog error during scan setup or paging.
    #[snafu(display("Catalog error: {source}"))]
    Catalog { source: CatalogError },

    /// Could not reach the IPFS daemon at startup.
    #[snafu(display("IPFS daemon unreachable: {source}"))]
    IpfsUnreachable { source: IpfsError },

    /// Could not construct the sink client.
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// Could not connect the failure memory store at startup.
    #[snafu(display("Failure memory error: {source}"))]
    FailureStore { source: FailureStoreError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl From<CatalogError> for BackupError {
    fn from(source: CatalogError) -> Self {
        BackupError::Catalog { source }
    }
}

impl From<ConfigError> for BackupError {
    fn from(source: ConfigError) -> Self {
        BackupError::Config { source }
    }
}
