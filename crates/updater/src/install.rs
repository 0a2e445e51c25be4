// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Package download, verification, unpacking and promotion.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use http::header::ACCEPT;
use reqwest::{blocking::Client, header::HeaderValue};
use url::Url;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::{verify::digests_of_file, Error, Result, UpdateInfo, Updater, CURRENT_POINTER};

impl Updater {
    /// Downloads the package announced by `update`, verifies it, unpacks it
    /// into a staging directory and promotes it to
    /// `<install_root>/<version>`.
    ///
    /// Candidate URLs are tried in order until one install succeeds; every
    /// failed candidate is reported to the error listener. Returns `true` on
    /// the first successful promote.
    pub fn download_and_unpack(&self, update: &UpdateInfo) -> bool {
        for candidate in self.package_candidates(update) {
            log::info!("downloading update package from {candidate}");
            match self.try_install_from(&candidate, update) {
                Ok(()) => return true,
                Err(e) => self.report_error(&e),
            }
        }
        false
    }

    /// Mirror URLs with the package file name spliced in come first, then
    /// the manifest's own URLs.
    fn package_candidates(&self, update: &UpdateInfo) -> Vec<Url> {
        let remotes: Vec<Url> = update
            .remote_urls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| match raw.parse() {
                Ok(url) => Some(url),
                Err(e) => {
                    log::debug!("skipping unparsable package URL {raw}: {e}");
                    None
                }
            })
            .collect();

        let mut candidates = Vec::new();
        if let Some(filename) = remotes.first().and_then(package_filename) {
            for mirror in &self.config.mirrors {
                let mut candidate = mirror.clone();
                if let Ok(mut segments) = candidate.path_segments_mut() {
                    segments.pop().push(&filename);
                } else {
                    continue;
                }
                candidates.push(candidate);
            }
        }
        candidates.extend(remotes);
        candidates
    }

    fn try_install_from(&self, url: &Url, update: &UpdateInfo) -> Result<()> {
        let mut package = tempfile::NamedTempFile::new()?;
        self.download_to(url, update, package.as_file_mut())?;
        self.verify_package(package.path(), update)?;

        let staging = tempfile::tempdir()?;
        extract_package(package.path(), staging.path())?;
        self.verify_unpacked_inner(staging.path(), Some(update))?;

        self.promote(staging.path(), update)?;
        self.collect_garbage();
        Ok(())
    }

    fn download_to<W: Write>(&self, url: &Url, update: &UpdateInfo, output: W) -> Result<()> {
        let mut headers = self.headers.clone();
        if !headers.contains_key(ACCEPT) {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str("application/octet-stream").unwrap(),
            );
        }

        let mut request = Client::new().get(url.clone()).headers(headers);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "package request to {url} failed with status {}",
                response.status()
            )));
        }

        struct DownloadProgress<'a, R> {
            inner: R,
            downloaded: u64,
            total: u64,
            on_chunk: Option<&'a crate::ProgressListener>,
        }

        impl<R: Read> Read for DownloadProgress<'_, R> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.inner.read(buf).inspect(|&n| {
                    self.downloaded += n as u64;
                    if let Some(on_chunk) = self.on_chunk {
                        let progress = if self.total == 0 {
                            0.0
                        } else {
                            (self.downloaded as f64 / self.total as f64).clamp(0.0, 1.0)
                        };
                        on_chunk(progress);
                    }
                })
            }
        }

        let mut source = DownloadProgress {
            inner: response,
            downloaded: 0,
            total: update.compressed_size,
            on_chunk: self.on_progress.as_ref(),
        };

        let mut output = io::BufWriter::new(output);
        io::copy(&mut source, &mut output)?;
        output.flush()?;
        Ok(())
    }

    /// Size and both digests must match the manifest before the archive is
    /// even opened.
    fn verify_package(&self, package: &Path, update: &UpdateInfo) -> Result<()> {
        let size = fs::metadata(package)?.len();
        if size != update.compressed_size {
            return Err(Error::IntegrityMismatch("size"));
        }
        let (sha256, md5, _) = digests_of_file(package)?;
        if update.sha256.as_deref() != Some(sha256.as_str()) {
            return Err(Error::IntegrityMismatch("SHA-256"));
        }
        if update.md5.as_deref() != Some(md5.as_str()) {
            return Err(Error::IntegrityMismatch("MD5"));
        }
        Ok(())
    }

    fn promote(&self, staging: &Path, update: &UpdateInfo) -> Result<()> {
        let versionstring = update.version.to_string();
        let target = self.install_root.join(&versionstring);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;
        copy_tree(staging, &target)?;

        let pointer_tmp = self.install_root.join(format!("{CURRENT_POINTER}.tmp"));
        fs::write(&pointer_tmp, &versionstring)?;
        fs::rename(&pointer_tmp, self.install_root.join(CURRENT_POINTER))?;

        self.invalidate_installed_cache();
        log::info!("installed update {versionstring}");
        Ok(())
    }

    /// Deletes obsolete installed versions, best effort. The newest install
    /// and the one right behind it are retained; the version named by
    /// `current` and the running version are never deleted.
    pub(crate) fn collect_garbage(&self) {
        let current = self.read_current_pointer();
        let mut installed = self.installed_versions();
        installed.sort_by(|a, b| b.manifest.version.cmp(&a.manifest.version));

        for stale in installed.iter().skip(2) {
            let folder_name = stale
                .folder
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            if folder_name.is_some() && folder_name == current {
                continue;
            }
            if stale.manifest.version == self.current_version {
                continue;
            }
            match fs::remove_dir_all(&stale.folder) {
                Ok(()) => log::debug!("removed obsolete version {}", stale.folder.display()),
                Err(e) => log::warn!(
                    "could not remove obsolete version {}: {e}",
                    stale.folder.display()
                ),
            }
        }
    }
}

fn package_filename(url: &Url) -> Option<String> {
    url.path_segments()?
        .last()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extracts every archive member into `dest`, refusing members that could
/// escape it.
fn extract_package(archive: &Path, dest: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(fs::File::open(archive)?)?;
    for i in 0..zip.len() {
        let mut member = zip.by_index(i)?;
        let raw_name = member.name().to_string();
        if is_unsafe_member(&raw_name) {
            return Err(Error::PathUnsafe(raw_name));
        }
        let rel: PathBuf = member
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::PathUnsafe(raw_name.clone()))?;
        let dest_path = dest.join(rel);

        if member.is_dir() {
            fs::create_dir_all(&dest_path)?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest_path)?;
        io::copy(&mut member, &mut out)?;
    }
    Ok(())
}

fn is_unsafe_member(name: &str) -> bool {
    if name.starts_with(['/', '\\']) {
        return true;
    }
    // windows drive or UNC style absolutes
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    name.starts_with("..")
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = match entry.path().strip_prefix(from) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
