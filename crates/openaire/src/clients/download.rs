//! HTTP downloader for upstream archives.

use async_trait::async_trait;
use futures::StreamExt;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use openaire_core::emit;
use openaire_core::metrics::events::ArchiveDownloaded;

use super::Downloader;
use crate::error::{
    BuildClientSnafu, DownloadError, HttpStatusSnafu, RequestSnafu, WriteDownloadSnafu,
};

/// Connect timeout; transfers themselves are unbounded since parts are large.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streams HTTP responses straight to disk.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self { client })
    }
}

/// `<destination>.partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context(RequestSnafu { url })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            HttpStatusSnafu {
                url,
                status: status.as_u16()
            }
        );

        let partial = partial_path(destination);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(WriteDownloadSnafu { path: parent })?;
        }
        let mut file = tokio::fs::File::create(&partial)
            .await
            .context(WriteDownloadSnafu { path: &partial })?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(RequestSnafu { url })?;
            file.write_all(&chunk)
                .await
                .context(WriteDownloadSnafu { path: &partial })?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .context(WriteDownloadSnafu { path: &partial })?;
        file.sync_all()
            .await
            .context(WriteDownloadSnafu { path: &partial })?;
        drop(file);

        tokio::fs::rename(&partial, destination)
            .await
            .context(WriteDownloadSnafu { path: destination })?;

        emit!(ArchiveDownloaded {
            bytes: written,
            duration: start.elapsed(),
        });
        info!(url, bytes = written, "Downloaded archive");
        debug!(path = %destination.display(), "Archive written");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/data/download/publication_1.tar")),
            PathBuf::from("/data/download/publication_1.tar.partial")
        );
    }

    #[test]
    fn test_new_builds_client() {
        assert!(HttpDownloader::new().is_ok());
    }
}
