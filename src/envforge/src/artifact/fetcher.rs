/// Artifact fetchers
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Network or storage failure while fetching. Never retried here.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unsupported artifact URL '{0}'")]
    InvalidUrl(String),

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to store artifact at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetches artifact bytes into a local file.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Write the artifact at `url` to `dest`; returns the byte count.
    /// `dest` must not exist afterwards unless the fetch completed.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// HTTP(S) fetcher. `file://` URLs are copied from the local filesystem.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &str, part_path: &Path) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: url.to_string(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let storage = |e| FetchError::Storage {
            path: part_path.to_path_buf(),
            source: e,
        };

        let mut file = fs::File::create(part_path).await.map_err(storage)?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Http {
                url: url.to_string(),
                source: e,
            })?;
            file.write_all(&chunk).await.map_err(storage)?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(storage)?;
        Ok(written)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Storage {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let part_path = part_path_for(dest);
        let start = std::time::Instant::now();

        let fetched = if let Some(local) = url.strip_prefix("file://") {
            tracing::info!("[HttpFetcher] Copying local artifact {} -> {:?}", local, dest);
            fs::copy(local, &part_path)
                .await
                .map_err(|e| FetchError::Storage {
                    path: part_path.clone(),
                    source: e,
                })
        } else if url.starts_with("http://") || url.starts_with("https://") {
            tracing::info!("[HttpFetcher] Downloading {} -> {:?}", url, dest);
            self.download(url, &part_path).await
        } else {
            return Err(FetchError::InvalidUrl(url.to_string()));
        };

        match fetched {
            Ok(bytes) => {
                fs::rename(&part_path, dest)
                    .await
                    .map_err(|e| FetchError::Storage {
                        path: dest.to_path_buf(),
                        source: e,
                    })?;
                tracing::info!(
                    "[TIMING] Fetched {} bytes in {}ms",
                    bytes,
                    start.elapsed().as_millis()
                );
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&part_path).await;
                tracing::error!("[HttpFetcher] Fetch of {} failed: {}", url, e);
                Err(e)
            }
        }
    }
}

fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_file_sits_next_to_destination() {
        let dest = Path::new("/cache/rootfs.tar.gz");
        assert_eq!(part_path_for(dest), Path::new("/cache/rootfs.tar.gz.part"));
    }

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = HttpFetcher::new()
            .fetch("ftp://example.com/rootfs.tar", &dir.path().join("rootfs.tar"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn copies_file_urls() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source.tar");
        std::fs::write(&source, b"rootfs bytes").unwrap();
        let dest = dir.path().join("cache").join("source.tar");

        let url = format!("file://{}", source.display());
        let bytes = HttpFetcher::new().fetch(&url, &dest).await.unwrap();
        assert_eq!(bytes, 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"rootfs bytes");
    }

    #[tokio::test]
    async fn failed_copy_leaves_nothing_at_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        // a directory cannot be copied as a file
        let source = dir.path().join("not-a-file");
        std::fs::create_dir(&source).unwrap();
        let dest = dir.path().join("cache").join("rootfs.tar.gz");

        let url = format!("file://{}", source.display());
        let err = HttpFetcher::new().fetch(&url, &dest).await.unwrap_err();

        assert!(matches!(err, FetchError::Storage { .. }));
        assert!(!dest.exists());
        assert!(!part_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn stale_part_file_is_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source.tar");
        std::fs::write(&source, b"complete").unwrap();
        let dest = dir.path().join("cache").join("source.tar");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(part_path_for(&dest), b"half a download from last time").unwrap();

        let url = format!("file://{}", source.display());
        HttpFetcher::new().fetch(&url, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"complete");
        assert!(!part_path_for(&dest).exists());
    }
}
