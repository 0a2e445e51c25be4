// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Verification of unpacked install directories against their embedded
//! manifest: every non-ignored file must match both digests, and every file
//! on disk must be accounted for.

use std::{
    collections::HashMap,
    fs,
    io::{Cursor, Read},
    path::{Path, MAIN_SEPARATOR, MAIN_SEPARATOR_STR},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use md5::Md5;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::{signed, Error, FileEntry, Result, UpdateInfo, Updater, MANIFEST_NAME};

impl Updater {
    /// Validates an unpacked install directory against its embedded signed
    /// manifest. With `expected`, the embedded manifest must also match the
    /// given identity. Failures are reported to the error listener.
    pub fn verify_unpacked(&self, folder: &Path, expected: Option<&UpdateInfo>) -> bool {
        match self.verify_unpacked_inner(folder, expected) {
            Ok(()) => true,
            Err(e) => {
                self.report_error(&e);
                false
            }
        }
    }

    pub(crate) fn verify_unpacked_inner(
        &self,
        folder: &Path,
        expected: Option<&UpdateInfo>,
    ) -> Result<()> {
        let raw = fs::read(folder.join(MANIFEST_NAME))?;
        let payload = signed::read_verified(Cursor::new(&raw), &self.public_key)?;
        let manifest: UpdateInfo = serde_json::from_slice(&payload)?;

        if let Some(expected) = expected {
            if manifest.displayname != expected.displayname
                || manifest.release_time != expected.release_time
            {
                return Err(Error::VerificationFailed(
                    "embedded manifest does not match the expected release".into(),
                ));
            }
        }

        let entries = manifest.files.unwrap_or_default();

        // the signed manifest file verifies against its own digests
        let (manifest_sha256, manifest_md5, _) = digests_of_reader(Cursor::new(&raw))?;
        let manifest_entry = FileEntry {
            path: MANIFEST_NAME.into(),
            ignore: false,
            last_write_time: OffsetDateTime::UNIX_EPOCH,
            sha256: Some(manifest_sha256),
            md5: Some(manifest_md5),
        };

        let mut expected_files: HashMap<String, FileEntry> = entries
            .iter()
            .filter(|e| !e.ignore)
            .map(|e| (normalize_manifest_path(&e.path), e.clone()))
            .collect();
        expected_files.insert(normalize_manifest_path(MANIFEST_NAME), manifest_entry);

        let ignore_prefixes: Vec<String> = entries
            .iter()
            .filter(|e| e.ignore)
            .map(|e| normalize_manifest_path(&e.path))
            .collect();

        for entry in WalkDir::new(folder) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_path = entry.path().strip_prefix(folder).map_err(|_| {
                Error::VerificationFailed(format!(
                    "walked outside of {} somehow",
                    folder.display()
                ))
            })?;
            let rel = normalize_disk_path(rel_path);

            if self.config.ignore_webroot && under_prefix(&rel, "webroot") {
                continue;
            }

            match expected_files.remove(&rel) {
                Some(wanted) => {
                    let (sha256, md5, _) = digests_of_file(entry.path())?;
                    if wanted.sha256.as_deref() != Some(sha256.as_str())
                        || wanted.md5.as_deref() != Some(md5.as_str())
                    {
                        return Err(Error::VerificationFailed(format!(
                            "digest mismatch for {rel}"
                        )));
                    }
                }
                None => {
                    if !ignore_prefixes.iter().any(|p| matches_ignore(&rel, p)) {
                        return Err(Error::VerificationFailed(format!("unexpected file {rel}")));
                    }
                }
            }
        }

        for (rel, entry) in &expected_files {
            if entry.is_directory() {
                continue;
            }
            if self.config.ignore_webroot && under_prefix(rel, "webroot") {
                continue;
            }
            return Err(Error::VerificationFailed(format!("missing file {rel}")));
        }

        Ok(())
    }
}

/// Manifest paths are forward-slash separated; keys are compared with native
/// separators and, on Windows, without regard to case.
pub(crate) fn normalize_manifest_path(path: &str) -> String {
    let native = path.replace('/', MAIN_SEPARATOR_STR);
    if cfg!(windows) {
        native.to_lowercase()
    } else {
        native
    }
}

fn normalize_disk_path(path: &Path) -> String {
    let joined = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(MAIN_SEPARATOR_STR);
    if cfg!(windows) {
        joined.to_lowercase()
    } else {
        joined
    }
}

fn under_prefix(rel: &str, prefix: &str) -> bool {
    rel == prefix
        || rel
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with(MAIN_SEPARATOR))
            .unwrap_or(false)
}

fn matches_ignore(rel: &str, ignore: &str) -> bool {
    let trimmed = ignore.trim_end_matches(MAIN_SEPARATOR);
    under_prefix(rel, trimmed)
}

/// Base64 SHA-256 and MD5 of everything in `reader`, plus the byte count.
pub(crate) fn digests_of_reader<R: Read>(mut reader: R) -> Result<(String, String, u64)> {
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        md5.update(&buf[..n]);
        size += n as u64;
    }
    Ok((
        STANDARD.encode(sha256.finalize()),
        STANDARD.encode(md5.finalize()),
        size,
    ))
}

pub(crate) fn digests_of_file(path: &Path) -> Result<(String, String, u64)> {
    digests_of_reader(fs::File::open(path)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_support::{install_dir, test_key, updater_at};

    #[test]
    fn accepts_matching_tree() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        let manifest = install_dir(
            &folder,
            &key,
            "2.0.0.0",
            &[("bin/app", "binary"), ("data.txt", "payload")],
        );
        assert!(updater.verify_unpacked(&folder, None));
        assert!(updater.verify_unpacked(&folder, Some(&manifest)));
    }

    #[test]
    fn rejects_identity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        let manifest = install_dir(&folder, &key, "2.0.0.0", &[("data.txt", "payload")]);
        let other = UpdateInfo {
            displayname: "Somebody Else".into(),
            ..manifest
        };
        assert!(!updater.verify_unpacked(&folder, Some(&other)));
    }

    #[test]
    fn rejects_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        install_dir(&folder, &key, "2.0.0.0", &[("data.txt", "payload")]);
        fs::write(folder.join("data.txt"), b"tampered").unwrap();
        assert!(!updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn rejects_unexpected_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        install_dir(&folder, &key, "2.0.0.0", &[("data.txt", "payload")]);
        fs::write(folder.join("extra.txt"), b"surprise").unwrap();
        assert!(!updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        install_dir(
            &folder,
            &key,
            "2.0.0.0",
            &[("data.txt", "payload"), ("gone.txt", "bye")],
        );
        fs::remove_file(folder.join("gone.txt")).unwrap();
        assert!(!updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn ignored_subtree_may_drift() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        let mut manifest = crate::test_support::manifest_for(
            &folder,
            "2.0.0.0",
            &[("data.txt", "payload")],
        );
        manifest.files.as_mut().unwrap().push(FileEntry {
            path: "cache/".into(),
            ignore: true,
            last_write_time: OffsetDateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        });
        crate::test_support::write_signed_manifest(&folder, &manifest, &key);
        fs::create_dir_all(folder.join("cache")).unwrap();
        fs::write(folder.join("cache/scratch.bin"), b"whatever").unwrap();
        assert!(updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn webroot_flag_exempts_the_webroot_tree() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let mut updater = updater_at(&dir, &key);
        updater.config.ignore_webroot = true;
        let folder = dir.path().join("2.0.0.0");
        install_dir(&folder, &key, "2.0.0.0", &[("data.txt", "payload")]);
        fs::create_dir_all(folder.join("webroot/js")).unwrap();
        fs::write(folder.join("webroot/js/extra.js"), "locally patched").unwrap();
        assert!(updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn rejects_tampered_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let updater = updater_at(&dir, &key);
        let folder = dir.path().join("2.0.0.0");
        install_dir(&folder, &key, "2.0.0.0", &[("data.txt", "payload")]);
        let manifest_path = folder.join(MANIFEST_NAME);
        let mut raw = fs::read(&manifest_path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        fs::write(&manifest_path, raw).unwrap();
        assert!(!updater.verify_unpacked(&folder, None));
    }

    #[test]
    fn digest_helper_matches_known_value() {
        let (sha256, md5, size) = digests_of_reader(Cursor::new(b"abc")).unwrap();
        assert_eq!(size, 3);
        assert_eq!(sha256, "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
        assert_eq!(md5, "kAFQmDzST7DWlj99KOF/cg==");
    }
}
