// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
/// Errors returned by the updater.
pub enum Error {
    /// HTTP client error.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// A download endpoint responded with a non-success status.
    #[error("network failure: {0}")]
    Network(String),
    /// Malformed signed-stream framing or manifest container.
    #[error("malformed stream: {0}")]
    Format(String),
    /// The stream ended before the declared signature was read.
    #[error("signed stream ended before the declared signature was read")]
    Truncated,
    /// The payload signature does not verify under the configured public key.
    #[error("signature verification failed")]
    SignatureInvalid,
    /// A downloaded package does not match the size or digests announced by its manifest.
    #[error("{0} mismatch of downloaded package")]
    IntegrityMismatch(&'static str),
    /// An archive member would extract outside of the staging directory.
    #[error("unsafe archive member path: {0}")]
    PathUnsafe(String),
    /// An unpacked install tree does not match its embedded manifest.
    #[error("install verification failed: {0}")]
    VerificationFailed(String),
    /// I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Manifest JSON de/serialization errors.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Package archive errors.
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// RSA signing errors.
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
    /// Base64 decoding errors.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    /// URL parsing errors.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// HTTP header construction errors.
    #[error(transparent)]
    Http(#[from] http::Error),
    /// Time formatting/parsing errors.
    #[error(transparent)]
    TimeFormat(#[from] time::error::Format),
    /// The configured RSA key could not be decoded.
    #[error("invalid RSA key: {0}")]
    Key(String),
    /// A child process could not be spawned.
    #[error("failed to launch {0}: {1}")]
    Launch(PathBuf, std::io::Error),
    /// The updater was built without any manifest endpoints.
    #[error("update endpoints list is empty")]
    EmptyEndpoints,
    /// The installed application directory could not be determined.
    #[error("failed to determine the installed application directory")]
    BaseDirNotFound,
    /// No candidate update root was writable.
    #[error("no writable update root could be resolved")]
    NoInstallRoot,
}

/// Convenient type alias of Result type for the updater.
pub type Result<T> = std::result::Result<T, Error>;
