// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::{fs, path::PathBuf};

use clap::Parser;
use rsa::{
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey,
};

use crate::{Error, Result};

#[derive(Debug, Clone, Parser)]
#[clap(about = "Generate a new RSA signing key pair")]
pub struct Options {
    /// A path where the private key will be stored; the public key lands
    /// next to it with a `.pub` suffix.
    #[clap(long)]
    path: Option<PathBuf>,
    /// Overwrite the keys even if they exist on the specified path.
    #[clap(short, long)]
    force: bool,
    /// RSA key size in bits.
    #[clap(long, default_value_t = 2048)]
    bits: usize,
}

pub fn command(options: Options) -> Result<()> {
    tracing::info!("Generating a new {}-bit RSA signing key.", options.bits);
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), options.bits)
        .map_err(|e| Error::Key(e.to_string()))?;

    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Key(e.to_string()))?;
    let public_pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Key(e.to_string()))?;

    match options.path {
        Some(path) => {
            let public_path = PathBuf::from(format!("{}.pub", path.display()));
            if path.exists() && !options.force {
                return Err(Error::KeyExists(path));
            }
            fs::write(&path, private_pem.as_bytes())?;
            fs::write(&public_path, public_pem.as_bytes())?;
            tracing::info!(
                "Finished generating and saving the keys:\n        {}\n        {}",
                dunce::simplified(&path).display(),
                dunce::simplified(&public_path).display()
            );
        }
        None => {
            tracing::info!("Finished generating private key:\n{}", &*private_pem);
            tracing::info!("Finished generating public key:\n{public_pem}");
        }
    }

    Ok(())
}
