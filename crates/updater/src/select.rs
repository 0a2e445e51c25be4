// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The installed-version catalog and the best-version selection.

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::{signed, Error, PackageVersion, Result, UpdateInfo, Updater, CURRENT_POINTER, MANIFEST_NAME};

/// A verified install below the update root: its folder and the embedded
/// manifest it was verified against.
#[derive(Debug, Clone)]
pub struct InstalledVersion {
    /// Absolute path of the versioned install directory.
    pub folder: PathBuf,
    /// The embedded manifest.
    pub manifest: UpdateInfo,
}

/// The version selected to run.
#[derive(Debug, Clone)]
pub struct BestVersion {
    /// Directory holding the selected version.
    pub folder: PathBuf,
    /// Its version; never older than the running one.
    pub version: PackageVersion,
    /// The embedded manifest, absent for the baseline install.
    pub manifest: Option<UpdateInfo>,
}

impl Updater {
    /// Scans the update root and returns every install that verifies against
    /// its embedded manifest. Unverifiable folders are skipped (and
    /// reported), never selected.
    pub fn installed_versions(&self) -> Vec<InstalledVersion> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(&self.install_root) else {
            return out;
        };
        for entry in entries.flatten() {
            let folder = entry.path();
            if !folder.is_dir() || !folder.join(MANIFEST_NAME).is_file() {
                continue;
            }
            if let Some(manifest) = self.read_installed_manifest(&folder) {
                if self.verify_unpacked(&folder, None) {
                    out.push(InstalledVersion { folder, manifest });
                }
            }
        }
        out
    }

    /// Reads and verifies the signed manifest embedded in `folder`.
    ///
    /// Returns `None` when the file is missing, its signature does not
    /// verify or it fails to parse; the latter two are reported.
    pub fn read_installed_manifest(&self, folder: &Path) -> Option<UpdateInfo> {
        match self.read_manifest_inner(folder) {
            Ok(manifest) => Some(manifest),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                self.report_error(&e);
                None
            }
        }
    }

    fn read_manifest_inner(&self, folder: &Path) -> Result<UpdateInfo> {
        let raw = fs::read(folder.join(MANIFEST_NAME))?;
        let payload = signed::read_verified(Cursor::new(&raw), &self.public_key)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    fn best_installed_update(&self, force_recheck: bool) -> Option<InstalledVersion> {
        let mut cache = self.best_installed.lock().unwrap();
        if force_recheck || cache.is_none() {
            let best = self
                .installed_versions()
                .into_iter()
                .filter(|iv| iv.manifest.version > self.current_version)
                .max_by(|a, b| a.manifest.version.cmp(&b.manifest.version));
            *cache = Some(best);
        }
        cache.as_ref().unwrap().clone()
    }

    /// Whether a verified update newer than the running version is
    /// installed. Cached; invalidated by a promote.
    pub fn has_installed_update(&self) -> bool {
        self.best_installed_update(false).is_some()
    }

    pub(crate) fn invalidate_installed_cache(&self) {
        *self.best_installed.lock().unwrap() = None;
    }

    pub(crate) fn read_current_pointer(&self) -> Option<String> {
        fs::read_to_string(self.install_root.join(CURRENT_POINTER))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Chooses the version to run: the baseline install, the highest
    /// verified installed update, or the version named by the `current`
    /// pointer — whichever verified candidate is newest.
    pub fn get_best_version(&self, force_recheck: bool) -> BestVersion {
        let mut best = BestVersion {
            folder: self.base_dir.clone(),
            version: self.current_version.clone(),
            manifest: None,
        };

        if let Some(installed) = self.best_installed_update(force_recheck) {
            if installed.manifest.version > best.version {
                best = BestVersion {
                    folder: installed.folder,
                    version: installed.manifest.version.clone(),
                    manifest: Some(installed.manifest),
                };
            }
        }

        if let Some(name) = self.read_current_pointer() {
            let folder = self.install_root.join(&name);
            if folder.is_dir() && folder != best.folder {
                if let Some(manifest) = self.read_installed_manifest(&folder) {
                    if manifest.version > best.version && self.verify_unpacked(&folder, None) {
                        best = BestVersion {
                            folder,
                            version: manifest.version.clone(),
                            manifest: Some(manifest),
                        };
                    }
                }
            }
        }

        best
    }
}
