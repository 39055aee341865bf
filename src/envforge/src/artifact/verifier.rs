/// Integrity verifier for root filesystem artifacts
use super::fetcher::{ArtifactFetcher, FetchError, HttpFetcher};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Reference to an artifact that has not been verified yet
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub url: String,
    pub expected_digest: String,
}

impl ArtifactRef {
    pub fn new(url: impl Into<String>, expected_digest: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_digest: expected_digest.into(),
        }
    }
}

/// An artifact whose local bytes matched the expected digest.
///
/// Only [`IntegrityVerifier::verify`] constructs these.
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    url: String,
    digest: String,
    local_path: PathBuf,
}

impl VerifiedArtifact {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Lowercase hex SHA-256
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }
}

/// Local bytes do not hash to the expected digest.
///
/// `cached` is set when the bytes came from an earlier fetch rather than
/// this call. Such a file is never refetched automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityError {
    pub expected: String,
    pub actual: String,
    pub path: PathBuf,
    pub cached: bool,
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Digest mismatch for {:?}: expected {}, got {}",
            self.path, self.expected, self.actual
        )?;
        if self.cached {
            write!(
                f,
                " (cached copy; delete {:?} to fetch the artifact again)",
                self.path
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for IntegrityError {}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Invalid expected digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("Failed to hash {path:?}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Strip an optional `sha256:` prefix and check the hex shape. Returns lowercase hex.
pub fn normalize_digest(digest: &str) -> Result<String, VerifyError> {
    let trimmed = digest.trim();
    let hex = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };

    let invalid = |reason: String| VerifyError::InvalidDigest {
        digest: digest.to_string(),
        reason,
    };

    if hex.len() != SHA256_HEX_LEN {
        return Err(invalid(format!(
            "expected {} hex characters, got {}",
            SHA256_HEX_LEN,
            hex.len()
        )));
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("contains non-hex characters".to_string()));
    }
    Ok(hex.to_ascii_lowercase())
}

/// Cache file name for a URL: last path segment, sanitized.
pub fn file_name_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let segment = match path.split_once('/') {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or_default(),
        None => "",
    };

    let sanitized: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "artifact".to_string()
    } else {
        sanitized
    }
}

/// SHA-256 of a file, lowercase hex.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Downloads artifacts into a cache and checks them against their expected digest.
pub struct IntegrityVerifier {
    cache_dir: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl IntegrityVerifier {
    pub fn new(cache_dir: PathBuf, fetcher: Arc<dyn ArtifactFetcher>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        tracing::info!("[Verifier] Initialized with cache dir: {:?}", cache_dir);
        Ok(Self { cache_dir, fetcher })
    }

    pub fn with_http(cache_dir: PathBuf) -> std::io::Result<Self> {
        Self::new(cache_dir, Arc::new(HttpFetcher::new()))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Deterministic cache location for a URL
    pub fn cache_path_for(&self, url: &str) -> PathBuf {
        self.cache_dir.join(file_name_from_url(url))
    }

    /// Fetch if not cached, then always rehash the local bytes.
    ///
    /// A mismatching file is left in place for inspection.
    pub async fn verify(&self, artifact: &ArtifactRef) -> Result<VerifiedArtifact, VerifyError> {
        let expected = normalize_digest(&artifact.expected_digest)?;
        let local_path = self.cache_path_for(&artifact.url);

        let cached = tokio::fs::try_exists(&local_path).await.unwrap_or(false);
        if cached {
            tracing::info!(
                "[Verifier] Found cached artifact {:?}, re-verifying",
                local_path
            );
        } else {
            tracing::info!("[Verifier] Artifact not cached, fetching {}", artifact.url);
            self.fetcher.fetch(&artifact.url, &local_path).await?;
        }

        let start = std::time::Instant::now();
        let actual = sha256_file(&local_path)
            .await
            .map_err(|e| VerifyError::Hash {
                path: local_path.clone(),
                source: e,
            })?;
        tracing::info!(
            "[TIMING] Hashed {:?} in {}ms",
            local_path,
            start.elapsed().as_millis()
        );

        if !actual.eq_ignore_ascii_case(&expected) {
            let mismatch = IntegrityError {
                expected,
                actual,
                path: local_path,
                cached,
            };
            tracing::error!("[Verifier] {}", mismatch);
            return Err(mismatch.into());
        }

        tracing::info!("[Verifier] Artifact verified: sha256:{}", actual);
        Ok(VerifiedArtifact {
            url: artifact.url.clone(),
            digest: actual,
            local_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_prefix_and_uppercase() {
        let hex = "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08";
        let normalized = normalize_digest(&format!("SHA256:{}", hex)).unwrap();
        assert_eq!(normalized, hex.to_ascii_lowercase());
    }

    #[test]
    fn normalize_rejects_bad_shapes() {
        assert!(normalize_digest("").is_err());
        assert!(normalize_digest("abc123").is_err());
        let not_hex = "z".repeat(SHA256_HEX_LEN);
        assert!(matches!(
            normalize_digest(&not_hex),
            Err(VerifyError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn file_name_uses_last_segment() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/wsl/ubuntu-noble.rootfs.tar.gz?sig=1"),
            "ubuntu-noble.rootfs.tar.gz"
        );
        assert_eq!(file_name_from_url("https://example.com"), "artifact");
        assert_eq!(file_name_from_url("https://example.com/dir/"), "artifact");
        assert_eq!(file_name_from_url("https://example.com/a%20b.tar"), "a_20b.tar");
        assert_eq!(file_name_from_url("https://example.com/.."), "artifact");
    }

    #[test]
    fn stale_cache_mismatch_names_the_file_to_delete() {
        let mismatch = IntegrityError {
            expected: "aa".into(),
            actual: "bb".into(),
            path: PathBuf::from("/cache/rootfs.tar.gz"),
            cached: true,
        };
        let message = mismatch.to_string();
        assert!(message.contains("delete \"/cache/rootfs.tar.gz\""), "{message}");

        let fresh = IntegrityError {
            cached: false,
            ..mismatch
        };
        assert!(!fresh.to_string().contains("delete"));
    }

    #[tokio::test]
    async fn sha256_of_known_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test");
        std::fs::write(&path, b"test").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
