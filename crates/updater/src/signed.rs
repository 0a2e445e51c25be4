// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Length-prefixed RSA-signed stream framing.
//!
//! A signed stream is `[u32 signature_length][signature][payload]` with the
//! length in network byte order. The signature is RSA PKCS#1 v1.5 over the
//! SHA-1 digest of the payload; the digest algorithm is fixed by the already
//! published manifests and must not be upgraded silently.

use std::io::{self, Read, Write};

use rsa::{pkcs1v15::Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// Upper bound for the declared signature length; anything above this is a
/// framing error, not a real key.
const MAX_SIGNATURE_LEN: usize = 64 * 1024;

/// Reads the whole payload from `input` and writes the signed framing to
/// `output`.
pub fn create_signed<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    key: &RsaPrivateKey,
) -> Result<()> {
    let mut payload = Vec::new();
    input.read_to_end(&mut payload)?;

    let digest = Sha1::digest(&payload);
    let signature = key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)?;

    output.write_all(&(signature.len() as u32).to_be_bytes())?;
    output.write_all(&signature)?;
    output.write_all(&payload)?;
    Ok(())
}

/// Reads the signature header from `input` and returns a reader over the
/// payload that verifies the signature at end-of-stream.
pub fn open_verifying<R: Read>(mut input: R, key: &RsaPublicKey) -> Result<VerifyingReader<R>> {
    let mut header = [0u8; 4];
    input.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Format("missing signature length header".into())
        } else {
            Error::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_SIGNATURE_LEN {
        return Err(Error::Format(format!("implausible signature length {len}")));
    }

    let mut signature = vec![0u8; len];
    input.read_exact(&mut signature).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e)
        }
    })?;

    Ok(VerifyingReader {
        inner: input,
        hasher: Sha1::new(),
        signature,
        key: key.clone(),
        verified: false,
    })
}

/// Convenience wrapper: reads and verifies an entire signed stream, returning
/// the payload only if the signature checks out.
pub fn read_verified<R: Read>(input: R, key: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut reader = open_verifying(input, key)?;
    let mut payload = Vec::new();
    reader
        .read_to_end(&mut payload)
        .map_err(unwrap_io_error)?;
    Ok(payload)
}

/// Recovers an [`Error`] smuggled through `io::Error` by [`VerifyingReader`].
pub(crate) fn unwrap_io_error(e: io::Error) -> Error {
    if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(err)) => *err,
            _ => Error::SignatureInvalid,
        }
    } else {
        Error::Io(e)
    }
}

/// Streams a signed payload, hashing every byte read; verifies the signature
/// when the underlying stream ends. A failed verification surfaces as an
/// `InvalidData` I/O error so that no consumer completes a read of a
/// tampered stream.
pub struct VerifyingReader<R: Read> {
    inner: R,
    hasher: Sha1,
    signature: Vec<u8>,
    key: RsaPublicKey,
    verified: bool,
}

impl<R: Read> VerifyingReader<R> {
    fn check_signature(&self) -> Result<()> {
        let digest = self.hasher.clone().finalize();
        self.key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &self.signature)
            .map_err(|_| Error::SignatureInvalid)
    }

    /// Consumes the remainder of the stream and verifies the signature.
    pub fn finish(mut self) -> Result<()> {
        let mut sink = Vec::new();
        self.read_to_end(&mut sink).map_err(unwrap_io_error)?;
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
        } else if !self.verified {
            self.check_signature()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.verified = true;
        }
        Ok(n)
    }
}
