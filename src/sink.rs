//! Durable sink: CAR objects in S3-compatible storage.
//!
//! Keys are normalized to CIDv1 so the same content always lands at the
//! same object regardless of how the uploader spelled its CID.

use std::sync::Arc;

use cid::Cid;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutMultipartOpts, WriteMultipart};
use snafu::prelude::*;

use crate::error::{ExportError, S3ConfigSnafu, SinkError, StorageSnafu};

/// Multicodec for dag-pb, the implied codec of a CIDv0.
const DAG_PB_CODEC: u64 = 0x70;

/// Multipart part size.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// In-flight multipart part limit per upload.
const MAX_CONCURRENT_PARTS: usize = 8;

/// Object key for a complete DAG: `complete/<cidv1>.car`.
pub fn bucket_key(cid: &Cid) -> String {
    let v1 = match cid.version() {
        cid::Version::V0 => Cid::new_v1(DAG_PB_CODEC, *cid.hash()),
        _ => *cid,
    };
    format!("complete/{v1}.car")
}

/// S3 connection parameters for the sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Writes CAR streams into the object store.
pub struct CarSink {
    store: Arc<dyn ObjectStore>,
    public_base: String,
}

impl CarSink {
    /// Build an S3-backed sink from connection parameters.
    ///
    /// Credentials fall back to the ambient environment (instance profile,
    /// AWS_* variables) when not given explicitly.
    pub fn connect(config: &SinkConfig) -> Result<Self, SinkError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let public_base = match &config.endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
            None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
        };

        let store = Arc::new(builder.build().context(S3ConfigSnafu)?);
        Ok(Self { store, public_base })
    }

    /// Build a sink over an arbitrary store, for tests.
    pub fn with_store(store: Arc<dyn ObjectStore>, public_base: &str) -> Self {
        Self {
            store,
            public_base: public_base.to_string(),
        }
    }

    /// Public URL of the stored CAR for `cid`, recorded in the catalog.
    pub fn object_url(&self, cid: &Cid) -> String {
        format!("{}/{}", self.public_base, bucket_key(cid))
    }

    /// Whether a complete CAR for `cid` is already stored.
    pub async fn exists(&self, cid: &Cid) -> Result<bool, SinkError> {
        let path = Path::from(bucket_key(cid));
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(SinkError::Storage { source }),
        }
    }

    /// Stream a CAR export into the object at `bucket_key(cid)`.
    ///
    /// Uses a multipart upload so the CAR never needs to be buffered in
    /// full. If the export stream fails mid-way the multipart upload is
    /// aborted and nothing becomes visible in the bucket.
    pub async fn upload<S>(&self, cid: &Cid, mut stream: S) -> Result<u64, SinkError>
    where
        S: Stream<Item = Result<Bytes, ExportError>> + Unpin,
    {
        let path = Path::from(bucket_key(cid));

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::Metadata("structure".into()), "Complete".into());
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };

        let multipart = self
            .store
            .put_multipart_opts(&path, opts)
            .await
            .context(StorageSnafu)?;
        let mut upload = WriteMultipart::new_with_chunk_size(multipart, CHUNK_SIZE);

        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    total += bytes.len() as u64;
                    if let Err(source) =
                        upload.wait_for_capacity(MAX_CONCURRENT_PARTS).await
                    {
                        return Err(SinkError::Storage { source });
                    }
                    upload.write(&bytes);
                }
                Err(source) => {
                    upload.abort().await.ok();
                    return Err(SinkError::Export { source });
                }
            }
        }

        upload.finish().await.context(StorageSnafu)?;
        Ok(total)
    }
}
