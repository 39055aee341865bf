/// Integrity verifier: artifact download, caching and SHA-256 checks.
pub mod fetcher;
pub mod verifier;

pub use fetcher::{ArtifactFetcher, FetchError, HttpFetcher};
pub use verifier::{
    file_name_from_url, normalize_digest, sha256_file, ArtifactRef, IntegrityError,
    IntegrityVerifier, VerifiedArtifact, VerifyError,
};
