//! Registry data migration into the replicated object store
//!
//! The registry's on-disk data is streamed out of the running registry pod as
//! a tar archive and each file entry is uploaded as an object. Extraction and
//! upload run concurrently over a bounded in-memory pipe.

use std::io::Read;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, ListParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addons::{REGISTRY_BUCKET, REGISTRY_NAMESPACE};

/// Directory the registry keeps its data in
pub const REGISTRY_DATA_DIR: &str = "/var/lib/registry";

/// Label selecting the registry pods
pub const REGISTRY_POD_SELECTOR: &str = "app=docker-registry";

/// Capacity of the pipe between the archive reader and the uploader
const PIPE_CAPACITY: usize = 64 * 1024;

/// Size of the chunks an archive entry is streamed to the store in
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the archive reader and one object upload
const CHUNK_BUFFER: usize = 4;

/// Objects larger than this are sent as a multipart upload of parts this size
pub const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("No running registry pod found")]
    NoRegistryPod,

    #[error("Unexpected file count output: {0:?}")]
    InvalidCount(String),

    #[error("Object body ended after {received} of {size} bytes")]
    TruncatedBody { received: u64, size: u64 },

    #[error("Object body is longer than the declared {size} bytes")]
    OversizedBody { size: u64 },

    #[error("Command {command:?} in the registry pod failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Migration cancelled")]
    Cancelled,
}

/// Content of one object, streamed in chunks.
///
/// The body knows its declared size and fails if the producer stops early or
/// sends more than that, so a store never commits a partial object.
#[derive(Debug)]
pub struct ObjectBody {
    size: u64,
    received: u64,
    chunks: mpsc::Receiver<Vec<u8>>,
}

impl ObjectBody {
    /// A body of `size` bytes and the sender that feeds it
    pub fn channel(size: u64) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (sender, chunks) = mpsc::channel(CHUNK_BUFFER);
        let body = Self {
            size,
            received: 0,
            chunks,
        };
        (sender, body)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes still expected
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.received)
    }

    /// Next chunk, or `None` once the whole declared size was received
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, MigrationError> {
        match self.chunks.recv().await {
            Some(chunk) => {
                self.received += chunk.len() as u64;
                if self.received > self.size {
                    return Err(MigrationError::OversizedBody { size: self.size });
                }
                Ok(Some(chunk))
            }
            None if self.received == self.size => Ok(None),
            None => Err(MigrationError::TruncatedBody {
                received: self.received,
                size: self.size,
            }),
        }
    }

    /// Collect up to `limit` bytes, fewer only at the end of the body
    pub async fn read_part(&mut self, limit: usize) -> Result<Vec<u8>, MigrationError> {
        let mut part = Vec::new();
        while part.len() < limit && self.remaining() > 0 {
            match self.next_chunk().await? {
                Some(chunk) => part.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(part)
    }
}

/// Bucket storage the registry data is copied into
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket unless it already exists
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), MigrationError>;

    /// Write an object, replacing any previous content under `key`
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
    ) -> Result<(), MigrationError>;
}

fn store_error<E>(err: E) -> MigrationError
where
    E: std::error::Error + 'static,
{
    MigrationError::Store(DisplayErrorContext(err).to_string())
}

/// Object store reached through its S3 API
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "installation-operator",
            ))
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
        }
    }
}

impl S3ObjectStore {
    /// Send the parts of a multipart upload, `first` included
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut ObjectBody,
    ) -> Result<(), MigrationError> {
        let mut parts = Vec::new();
        let mut part = first;
        let mut number = 1;
        loop {
            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(store_error)?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(number)
                    .build(),
            );
            if body.remaining() == 0 {
                break;
            }
            part = body.read_part(PART_SIZE).await?;
            number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), MigrationError> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(store_error)?;
        info!(bucket, "Created bucket");
        Ok(())
    }

    /// Small objects go out in one request, larger ones part by part, so
    /// at most one part is held in memory.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody,
    ) -> Result<(), MigrationError> {
        let first = body.read_part(PART_SIZE).await?;
        if body.remaining() == 0 {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(store_error)?;
            return Ok(());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(store_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| MigrationError::Store(format!("No upload id for {}", key)))?
            .to_string();

        let result = self
            .upload_parts(bucket, key, &upload_id, first, &mut body)
            .await;
        if result.is_err()
            && let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
        {
            warn!(key, "Failed to abort multipart upload: {}", DisplayErrorContext(e));
        }
        result
    }
}

/// Turns uploaded entry counts into percent-complete reports.
///
/// A report is emitted only when the percentage grows, so the observed
/// sequence is strictly increasing.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    uploaded: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            uploaded: 0,
            last: None,
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.uploaded.min(self.total) * 100 / self.total) as u8
    }

    fn report(&mut self, percent: u8) -> Option<u8> {
        if self.last.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }

    /// Record one uploaded entry, returning the new percentage if it grew
    pub fn record(&mut self) -> Option<u8> {
        self.uploaded += 1;
        self.report(self.percent())
    }

    /// Report completion unless 100 was already reported
    pub fn finish(&mut self) -> Option<u8> {
        self.report(100)
    }
}

fn record_error(slot: &Mutex<Option<MigrationError>>, err: MigrationError) {
    if let Ok(mut slot) = slot.lock() {
        slot.get_or_insert(err);
    }
}

/// Stream `size` bytes of `entry` into `sender`.
///
/// Stops quietly when the receiving upload is gone; the upload reports why.
fn stream_entry<R: Read>(
    entry: &mut R,
    size: u64,
    sender: &mpsc::Sender<Vec<u8>>,
) -> Result<(), MigrationError> {
    let mut remaining = size;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = entry.read(&mut buf[..want])?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("archive entry ended {} bytes short", remaining),
            )
            .into());
        }
        remaining -= read as u64;
        if sender.blocking_send(buf[..read].to_vec()).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

fn object_key(path: &std::path::Path) -> Option<String> {
    let key = path.to_string_lossy();
    let key = key.trim_start_matches("./").trim_start_matches('/');
    (!key.is_empty()).then(|| key.to_string())
}

/// Upload every file entry of the tar stream `source` into `bucket`.
///
/// `total` is the expected number of file entries and drives the progress
/// reports. A failure on either side of the pipe cancels the other and the
/// first error is returned. Returns the number of uploaded objects.
pub async fn copy_archive<R, F>(
    source: R,
    total: u64,
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    mut progress: F,
) -> Result<u64, MigrationError>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(u8) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let first_error: Arc<Mutex<Option<MigrationError>>> = Arc::new(Mutex::new(None));
    let (mut pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);

    let reader = {
        let cancel = cancel.clone();
        let first_error = first_error.clone();
        tokio::spawn(async move {
            let mut source = source;
            tokio::select! {
                _ = cancel.cancelled() => {}
                copied = tokio::io::copy(&mut source, &mut pipe_writer) => match copied {
                    Ok(bytes) => debug!(bytes, "Finished reading registry archive"),
                    Err(e) => {
                        record_error(&first_error, e.into());
                        cancel.cancel();
                    }
                },
            }
            // Dropping the writer closes the pipe so the uploader sees EOF.
            drop(pipe_writer);
        })
    };

    let handle = tokio::runtime::Handle::current();
    let bucket = bucket.to_string();
    let writer = {
        let cancel = cancel.clone();
        let first_error = first_error.clone();
        tokio::task::spawn_blocking(move || {
            let bridge = SyncIoBridge::new_with_handle(pipe_reader, handle.clone());
            let mut archive = tar::Archive::new(bridge);
            let mut tracker = ProgressTracker::new(total);

            let result = (|| -> Result<(), MigrationError> {
                for entry in archive.entries()? {
                    if cancel.is_cancelled() {
                        return Err(MigrationError::Cancelled);
                    }
                    let mut entry = entry?;
                    if !entry.header().entry_type().is_file() {
                        continue;
                    }
                    let Some(key) = object_key(&entry.path()?) else {
                        continue;
                    };
                    let size = entry.size();
                    let (sender, body) = ObjectBody::channel(size);
                    let upload = {
                        let store = store.clone();
                        let bucket = bucket.clone();
                        let cancel = cancel.clone();
                        handle.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => Err(MigrationError::Cancelled),
                                put = store.put_object(&bucket, &key, body) => put,
                            }
                        })
                    };
                    let streamed = stream_entry(&mut entry, size, &sender);
                    drop(sender);
                    let uploaded = handle
                        .block_on(upload)
                        .map_err(|e| MigrationError::Io(std::io::Error::other(e)))?;
                    streamed?;
                    uploaded?;
                    if let Some(percent) = tracker.record() {
                        progress(percent);
                    }
                }
                if let Some(percent) = tracker.finish() {
                    progress(percent);
                }
                Ok(())
            })();

            // On success, consume the archive padding so the reader never hits a
            // closed pipe. On failure the archive stays alive until the error is
            // recorded.
            let result = match result {
                Ok(()) => std::io::copy(&mut archive.into_inner(), &mut std::io::sink())
                    .map(|_| ())
                    .map_err(MigrationError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                record_error(&first_error, e);
                cancel.cancel();
            }
            tracker.uploaded()
        })
    };

    let writer_result = writer.await;
    cancel.cancel();
    let _ = reader.await;

    let recorded = first_error.lock().ok().and_then(|mut slot| slot.take());
    if let Some(err) = recorded {
        return Err(err);
    }
    writer_result.map_err(|e| MigrationError::Io(std::io::Error::other(e)))
}

/// Name of a running registry pod
async fn registry_pod(pods: &Api<Pod>) -> Result<String, MigrationError> {
    let list = pods
        .list(&ListParams::default().labels(REGISTRY_POD_SELECTOR))
        .await?;
    list.items
        .into_iter()
        .find(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        })
        .map(|pod| pod.name_any())
        .ok_or(MigrationError::NoRegistryPod)
}

fn parse_count(output: &str) -> Result<u64, MigrationError> {
    output
        .trim()
        .parse()
        .map_err(|_| MigrationError::InvalidCount(output.to_string()))
}

/// Number of files under the registry data directory in `pod`
async fn count_registry_files(pods: &Api<Pod>, pod: &str) -> Result<u64, MigrationError> {
    let command = format!("find {} -type f | wc -l", REGISTRY_DATA_DIR);
    let mut attached = pods
        .exec(
            pod,
            vec!["sh", "-c", command.as_str()],
            &AttachParams::default().stdout(true).stderr(false),
        )
        .await?;
    let mut output = String::new();
    if let Some(mut stdout) = attached.stdout() {
        stdout.read_to_string(&mut output).await?;
    }
    check_exit(&mut attached, &command).await?;
    attached
        .join()
        .await
        .map_err(|e| MigrationError::Io(std::io::Error::other(e)))?;
    parse_count(&output)
}

/// Fail unless the exec session reports success.
///
/// A session that closes without reporting a status is treated as failed.
async fn check_exit(attached: &mut AttachedProcess, command: &str) -> Result<(), MigrationError> {
    let failed = |message: String| MigrationError::CommandFailed {
        command: command.to_string(),
        message,
    };
    let status = attached
        .take_status()
        .ok_or_else(|| failed("exec session has no status channel".to_string()))?
        .await
        .ok_or_else(|| failed("exec session ended without a status".to_string()))?;
    exec_succeeded(status.status.as_deref(), status.message.as_deref()).map_err(failed)
}

/// Interpret the status reported by an exec session
fn exec_succeeded(status: Option<&str>, message: Option<&str>) -> Result<(), String> {
    match status {
        Some("Success") => Ok(()),
        other => Err(message
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit status {:?}", other.unwrap_or("unknown")))),
    }
}

/// Copy the registry data into the registry bucket of `store`.
///
/// `progress` receives percent-complete values as entries are uploaded.
pub async fn migrate_registry_data<F>(
    client: Client,
    store: Arc<dyn ObjectStore>,
    progress: F,
) -> Result<u64, MigrationError>
where
    F: FnMut(u8) + Send + 'static,
{
    let pods: Api<Pod> = Api::namespaced(client, REGISTRY_NAMESPACE);
    let pod = registry_pod(&pods).await?;
    let total = count_registry_files(&pods, &pod).await?;
    info!(pod = %pod, files = total, "Migrating registry data");

    store.ensure_bucket(REGISTRY_BUCKET).await?;

    let mut attached = pods
        .exec(
            &pod,
            vec!["tar", "-c", "-C", REGISTRY_DATA_DIR, "."],
            &AttachParams::default().stdout(true).stderr(false),
        )
        .await?;
    let stdout = attached.stdout().ok_or_else(|| {
        MigrationError::Io(std::io::Error::other("exec session has no stdout"))
    })?;

    let uploaded = copy_archive(stdout, total, store, REGISTRY_BUCKET, progress).await?;
    check_exit(&mut attached, "tar").await?;
    attached
        .join()
        .await
        .map_err(|e| MigrationError::Io(std::io::Error::other(e)))?;
    info!(objects = uploaded, "Registry data migrated");
    Ok(uploaded)
}
