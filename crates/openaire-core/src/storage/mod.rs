//! Object storage abstraction.
//!
//! Provides a unified interface over Google Cloud Storage (the staging
//! bucket in production) and the local filesystem (development and tests).

mod gcs;
mod local;
mod url_parser;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use snafu::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::emit;
use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    BytesUploaded, RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Files at or above this size are uploaded with a multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Size of each part in a multipart upload.
const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record(operation: StorageOperation, ok: bool, start: Instant) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    ///
    /// `service_account_path` is only consulted by the GCS backend; when it is
    /// `None` credentials are resolved from the environment.
    pub async fn for_url(
        url: &str,
        service_account_path: Option<&str>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Gcs(config) => Self::construct_gcs(config, service_account_path),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Canonical URL of the storage root, e.g. `gs://bucket`.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// List objects under a prefix (relative to the configured key prefix).
    ///
    /// Returns paths relative to the configured key prefix, sorted. A prefix
    /// that does not exist yields an empty listing.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        let full_prefix: Path = match self.config.key() {
            Some(key) => key.parts().chain(Path::from(prefix).parts()).collect(),
            None => Path::from(prefix),
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let mut stream = self.object_store.list(Some(&full_prefix));
        let mut paths: Vec<Path> = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => paths.push(meta.location.parts().skip(key_part_count).collect()),
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(prefix, "Prefix not found, treating as empty");
                    break;
                }
                Err(source) => {
                    record(StorageOperation::List, false, start);
                    return Err(StorageError::ObjectStore { source });
                }
            }
        }

        record(StorageOperation::List, true, start);
        paths.sort();
        Ok(paths)
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put(&path, payload).await;
        record(StorageOperation::Put, result.is_ok(), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Upload a local file to `path`, returning the number of bytes sent.
    ///
    /// Small files use a single PUT. Larger files are streamed from disk in
    /// fixed-size chunks through a multipart upload with at most
    /// `max_concurrent_parts` parts in flight, so the whole file is never
    /// held in memory.
    pub async fn upload_file(
        &self,
        local_path: &std::path::Path,
        path: &Path,
        max_concurrent_parts: usize,
    ) -> Result<u64, StorageError> {
        let mut file = tokio::fs::File::open(local_path)
            .await
            .context(IoSnafu { path: local_path })?;
        let size = file
            .metadata()
            .await
            .context(IoSnafu { path: local_path })?
            .len();

        if size < MULTIPART_THRESHOLD {
            let mut buf = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buf)
                .await
                .context(IoSnafu { path: local_path })?;
            self.put_payload(path, PutPayload::from(Bytes::from(buf)))
                .await?;
            emit!(BytesUploaded { bytes: size });
            return Ok(size);
        }

        self.upload_multipart(&mut file, local_path, path, max_concurrent_parts)
            .await?;
        emit!(BytesUploaded { bytes: size });
        debug!("Completed multipart upload of {} ({size} bytes)", path);
        Ok(size)
    }

    /// Stream `reader` to `path` through a multipart upload. Any failure
    /// while streaming aborts the upload before the error is returned.
    async fn upload_multipart<R>(
        &self,
        reader: &mut R,
        local_path: &std::path::Path,
        path: &Path,
        max_concurrent_parts: usize,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let qualified = self.qualify_path(path).into_owned();
        let start = Instant::now();
        let upload = self.object_store.put_multipart(&qualified).await;
        record(StorageOperation::CreateMultipart, upload.is_ok(), start);
        let mut writer = WriteMultipart::new(upload.context(ObjectStoreSnafu)?);

        if let Err(e) = write_parts(reader, &mut writer, local_path, max_concurrent_parts).await {
            if let Err(abort) = writer.abort().await {
                warn!(path = %path, error = %abort, "Failed to abort multipart upload");
            }
            return Err(e);
        }

        let start = Instant::now();
        let result = writer.finish().await;
        record(StorageOperation::CompleteMultipart, result.is_ok(), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

async fn write_parts<R>(
    reader: &mut R,
    writer: &mut WriteMultipart,
    local_path: &std::path::Path,
    max_concurrent_parts: usize,
) -> Result<(), StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; MULTIPART_CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut chunk)
            .await
            .context(IoSnafu { path: local_path })?;
        if read == 0 {
            return Ok(());
        }
        writer
            .wait_for_capacity(max_concurrent_parts.max(1))
            .await
            .context(ObjectStoreSnafu)?;
        writer.write(&chunk[..read]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn local_storage(dir: &TempDir) -> StorageProvider {
        StorageProvider::for_url(dir.path().to_str().unwrap(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_with_prefix_returns_relative_sorted_paths() {
        let temp_dir = TempDir::new().unwrap();
        let folder = temp_dir.path().join("openaire/publication");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("part-1_NR.json.gz"), b"b").unwrap();
        std::fs::write(folder.join("part-0_NR.json.gz"), b"a").unwrap();

        let storage = local_storage(&temp_dir).await;
        let paths = storage
            .list_with_prefix("openaire/publication")
            .await
            .unwrap();

        let names: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "openaire/publication/part-0_NR.json.gz",
                "openaire/publication/part-1_NR.json.gz"
            ]
        );
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let paths = storage.list_with_prefix("does/not/exist").await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_upload_small_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let local = source.path().join("part-0.json.gz");
        std::fs::write(&local, b"compressed bytes").unwrap();

        let storage = local_storage(&temp_dir).await;
        let path = Path::from("folder/table/part-0.json.gz");
        let sent = storage.upload_file(&local, &path, 4).await.unwrap();

        assert_eq!(sent, 16);
        let content = std::fs::read(temp_dir.path().join("folder/table/part-0.json.gz")).unwrap();
        assert_eq!(content, b"compressed bytes");
    }

    #[tokio::test]
    async fn test_upload_large_file_uses_multipart() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let local = source.path().join("big.json.gz");
        let data: Vec<u8> = (0..(MULTIPART_THRESHOLD as usize + 1024))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&local, &data).unwrap();

        let storage = local_storage(&temp_dir).await;
        let path = Path::from("big.json.gz");
        let sent = storage.upload_file(&local, &path, 2).await.unwrap();

        assert_eq!(sent, data.len() as u64);
        let content = std::fs::read(temp_dir.path().join("big.json.gz")).unwrap();
        assert_eq!(content.len(), data.len());
        assert_eq!(content, data);
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let err = storage
            .upload_file(
                std::path::Path::new("/definitely/missing.json.gz"),
                &Path::from("x.json.gz"),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound
        ));
    }

    /// Yields `remaining` bytes, then fails every read.
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("disk gone")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![7u8; n]);
            self.remaining -= n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_multipart_upload_is_aborted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;
        let mut reader = FailingReader {
            remaining: MULTIPART_CHUNK_SIZE + 1024,
        };

        let err = storage
            .upload_multipart(
                &mut reader,
                std::path::Path::new("big.json.gz"),
                &Path::from("big.json.gz"),
                2,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Io { .. }));
        // neither the object nor the staged parts are left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }
}
