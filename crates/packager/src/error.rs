// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Errors bubbled up from the updater core.
    #[error(transparent)]
    Updater(#[from] autoupdater::Error),
    /// I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Manifest JSON parsing errors.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An RSA key could not be generated or decoded.
    #[error("invalid RSA key: {0}")]
    Key(String),
    /// Refusing to overwrite existing signing keys.
    #[error("aborted key generation, {0} already exists and --force was not given")]
    KeyExists(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
