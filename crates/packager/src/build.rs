// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::{fs, path::PathBuf};

use autoupdater::{build_package, UpdateInfo, MANIFEST_NAME, PACKAGE_NAME};
use clap::Parser;
use rsa::{pkcs8::DecodePrivateKey, RsaPrivateKey};

use crate::{Error, Result};

#[derive(Debug, Clone, Parser)]
#[clap(about = "Build and sign an update package from a directory")]
pub struct Options {
    /// Load the signing private key from a file or a PEM string.
    #[clap(short = 'k', long, env = "AUTOUPDATER_SIGN_PRIVATE_KEY")]
    private_key: String,
    /// The unsigned base manifest (JSON) carrying the release metadata and
    /// the ignore list.
    #[clap(short, long)]
    manifest: PathBuf,
    /// Directory the package and the signed remote manifest are written to.
    #[clap(short, long, default_value = ".")]
    out_dir: PathBuf,
    /// The directory containing the application files to package.
    input: PathBuf,
}

pub fn command(options: Options) -> Result<()> {
    let private_key = if PathBuf::from(&options.private_key).exists() {
        fs::read_to_string(&options.private_key)?
    } else {
        options.private_key
    };
    let key = RsaPrivateKey::from_pkcs8_pem(private_key.trim())
        .map_err(|e| Error::Key(e.to_string()))?;

    let base: UpdateInfo = serde_json::from_slice(&fs::read(&options.manifest)?)?;
    let input = dunce::canonicalize(&options.input)?;

    let remote = build_package(&input, &options.out_dir, &base, &key)?;

    tracing::info!(
        "Finished building {} ({} bytes) and {} for version {}",
        options.out_dir.join(PACKAGE_NAME).display(),
        remote.compressed_size,
        options.out_dir.join(MANIFEST_NAME).display(),
        remote.version
    );
    Ok(())
}
