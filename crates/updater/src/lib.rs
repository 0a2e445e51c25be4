// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # autoupdater
//!
//! A self-updating runtime for long-lived applications: it discovers newer
//! versions through RSA-signed manifests, downloads and verifies packages,
//! installs them side by side under a managed update root and relaunches the
//! wrapped application from the best installed version.
//!
//! ## Supervising an application
//!
//! The typical integration hands the whole `main` over to the supervisor:
//!
//! ```no_run
//! use autoupdater::{
//!     run_from_most_recent, Config, PackageVersion, UpdateStrategy, UpdaterBuilder,
//! };
//!
//! let config = Config {
//!     app_name: "myapp".into(),
//!     display_name: "My App".into(),
//!     endpoints: vec!["https://updates.myapp.com/stable/autoupdate.manifest"
//!         .parse()
//!         .unwrap()],
//!     pubkey: "<pem public key here>".into(),
//!     ..Default::default()
//! };
//!
//! let updater = UpdaterBuilder::new(PackageVersion::parse("1.0.0.0"), config)
//!     .build()
//!     .expect("failed to construct updater");
//!
//! let args: Vec<String> = std::env::args().skip(1).collect();
//! let code = run_from_most_recent(
//!     updater,
//!     |args| {
//!         // the real application entry point
//!         println!("running with {args:?}");
//!         0
//!     },
//!     &args,
//!     UpdateStrategy::CheckDuring,
//! );
//! std::process::exit(code);
//! ```
//!
//! On startup the supervisor selects the newest verified install (falling
//! back to the directory the application originally shipped in), spawns it as
//! a child process and waits. A child exiting with the magic code
//! [`MAGIC_EXIT_CODE`] asks the supervisor to re-evaluate and relaunch, which
//! is how a freshly installed update takes over without a manual restart.
//!
//! ## Checking manually
//!
//! All the building blocks are public: [`Updater::check_for_update`],
//! [`Updater::download_and_unpack`], [`Updater::get_best_version`] and
//! [`build_package`] can be driven directly when the supervisor loop is not
//! wanted.

#![deny(missing_docs)]

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use http::HeaderName;
use reqwest::header::{HeaderMap, HeaderValue};
use rsa::{pkcs8::DecodePublicKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use url::Url;

mod custom_serialization;
mod error;
mod fetch;
mod install;
mod manifest;
mod pack;
mod root;
mod select;
mod signed;
mod supervisor;
mod verify;

pub use error::*;
pub use manifest::{
    FileEntry, PackageVersion, ReleaseType, UpdateInfo, MANIFEST_NAME, PACKAGE_NAME,
};
pub use pack::build_package;
pub use select::{BestVersion, InstalledVersion};
pub use signed::{create_signed, open_verifying, read_verified, VerifyingReader};
pub use supervisor::{run_from_most_recent, UpdateStrategy, MAGIC_EXIT_CODE};

pub use http;
pub use reqwest;
pub use rsa;
pub use url;

/// Name of the `current` pointer file inside the update root.
pub const CURRENT_POINTER: &str = "current";

/// Updater configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Short machine-friendly application name; also keyed into the
    /// `AUTOUPDATER_<APP>_*` environment variables.
    pub app_name: String,
    /// Human-readable application name, matched against manifest
    /// `displayname` during install verification.
    pub display_name: String,
    /// Candidate manifest URLs, tried in order. A path segment naming a
    /// release track is replaced by the requested channel before the request
    /// is made.
    pub endpoints: Vec<Url>,
    /// Alternate package mirrors. For each mirror the last path segment is
    /// replaced with the package file name announced by the manifest, and
    /// the results are tried before the manifest's own URLs.
    pub mirrors: Vec<Url>,
    /// PEM-encoded RSA public key that every manifest signature is checked
    /// against.
    pub pubkey: String,
    /// Default release channel used when a check does not name one.
    pub channel: ReleaseType,
    /// Release track of the running build, as published in its manifest.
    pub release_type: String,
    /// Exempt a top-level `webroot` tree from install verification.
    pub ignore_webroot: bool,
}

pub(crate) type ErrorListener = Box<dyn Fn(&Error) + Send + Sync>;
pub(crate) type ProgressListener = Box<dyn Fn(f64) + Send + Sync>;

/// An [`Updater`] builder.
pub struct UpdaterBuilder {
    current_version: PackageVersion,
    config: Config,
    executable_path: Option<PathBuf>,
    headers: HeaderMap,
    timeout: Option<Duration>,
    on_error: Option<ErrorListener>,
    on_progress: Option<ProgressListener>,
}

impl UpdaterBuilder {
    /// Create a new updater builder for the given running version.
    pub fn new(current_version: PackageVersion, config: Config) -> Self {
        Self {
            current_version,
            config,
            executable_path: None,
            headers: Default::default(),
            timeout: None,
            on_error: None,
            on_progress: None,
        }
    }

    /// Specify the path to the current executable; its parent directory
    /// becomes the baseline install directory.
    pub fn executable_path<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.executable_path.replace(p.as_ref().into());
        self
    }

    /// Add a header to every updater request.
    pub fn header<K, V>(mut self, key: K, value: V) -> Result<Self>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let key: std::result::Result<HeaderName, http::Error> = key.try_into().map_err(Into::into);
        let value: std::result::Result<HeaderValue, http::Error> =
            value.try_into().map_err(Into::into);
        self.headers.insert(key?, value?);

        Ok(self)
    }

    /// Specify a timeout for updater requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a listener that receives every recovered error event.
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Register a listener for download progress in `[0, 1]`.
    pub fn on_progress<F: Fn(f64) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Build the updater: decodes the public key, determines the baseline
    /// install directory, resolves the writable update root and seeds it.
    pub fn build(self) -> Result<Updater> {
        if self.config.endpoints.is_empty() {
            return Err(Error::EmptyEndpoints);
        }

        let public_key = RsaPublicKey::from_public_key_pem(self.config.pubkey.trim())
            .map_err(|e| Error::Key(e.to_string()))?;

        // A populated install-root variable means we are the re-launched
        // child and it names the original application directory.
        let base_dir = match non_empty_env(&env_name(&self.config.app_name, "INSTALL_ROOT")) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let exe = match self.executable_path {
                    Some(p) => p,
                    None => std::env::current_exe()?,
                };
                exe.parent().ok_or(Error::BaseDirNotFound)?.to_path_buf()
            }
        };
        let base_dir = dunce::canonicalize(&base_dir).unwrap_or(base_dir);

        let install_root = root::resolve_install_root(&self.config, &base_dir)?;
        let install_id = root::seed_install_root(&install_root, &self.config);

        Ok(Updater {
            config: self.config,
            current_version: self.current_version,
            base_dir,
            install_root,
            install_id,
            public_key,
            headers: self.headers,
            timeout: self.timeout,
            on_error: self.on_error,
            on_progress: self.on_progress,
            best_installed: Mutex::new(None),
            last_check: Mutex::new(None),
        })
    }
}

/// The supervisor context: resolved directories, the verification key and
/// the cached catalog state, threaded through every update operation.
pub struct Updater {
    pub(crate) config: Config,
    pub(crate) current_version: PackageVersion,
    pub(crate) base_dir: PathBuf,
    pub(crate) install_root: PathBuf,
    pub(crate) install_id: Option<String>,
    pub(crate) public_key: RsaPublicKey,
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    on_error: Option<ErrorListener>,
    pub(crate) on_progress: Option<ProgressListener>,
    pub(crate) best_installed: Mutex<Option<Option<InstalledVersion>>>,
    last_check: Mutex<Option<UpdateInfo>>,
}

impl Updater {
    /// The configuration this updater was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The version of the running application.
    pub fn current_version(&self) -> &PackageVersion {
        &self.current_version
    }

    /// The directory the application originally shipped in. Read-only to the
    /// updater.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The managed directory holding side-installed update versions.
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Opaque installation identifier sent along with update checks.
    pub fn install_id(&self) -> Option<&str> {
        self.install_id.as_deref()
    }

    /// The manifest returned by the most recent successful update check.
    pub fn last_check(&self) -> Option<UpdateInfo> {
        self.last_check.lock().unwrap().clone()
    }

    pub(crate) fn record_check(&self, update: &UpdateInfo) {
        *self.last_check.lock().unwrap() = Some(update.clone());
    }

    pub(crate) fn report_error(&self, err: &Error) {
        log::error!("{err}");
        if let Some(listener) = &self.on_error {
            listener(err);
        }
    }

    pub(crate) fn env_name(&self, suffix: &str) -> String {
        env_name(&self.config.app_name, suffix)
    }
}

/// `AUTOUPDATER_<APP>_<SUFFIX>` with the application name uppercased and
/// non-alphanumeric characters collapsed to underscores.
pub(crate) fn env_name(app_name: &str, suffix: &str) -> String {
    let app: String = app_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("AUTOUPDATER_{app}_{suffix}")
}

pub(crate) fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{fs, io::Cursor, path::Path, sync::Mutex};

    use rsa::RsaPrivateKey;
    use time::OffsetDateTime;

    use crate::{signed, Config, FileEntry, PackageVersion, UpdateInfo, Updater, MANIFEST_NAME};

    pub(crate) fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
    }

    /// An updater rooted in a temp dir, running version 1.0.0.0, no probing.
    pub(crate) fn updater_at(dir: &tempfile::TempDir, key: &RsaPrivateKey) -> Updater {
        let base_dir = dir.path().join("app");
        fs::create_dir_all(&base_dir).unwrap();
        Updater {
            config: Config {
                app_name: "testapp".into(),
                display_name: "Test App".into(),
                ..Default::default()
            },
            current_version: PackageVersion::parse("1.0.0.0"),
            base_dir,
            install_root: dir.path().to_path_buf(),
            install_id: None,
            public_key: key.to_public_key(),
            headers: Default::default(),
            timeout: None,
            on_error: None,
            on_progress: None,
            best_installed: Mutex::new(None),
            last_check: Mutex::new(None),
        }
    }

    /// Writes the given files below `folder` and returns the unsigned
    /// embedded manifest describing them.
    pub(crate) fn manifest_for(
        folder: &Path,
        version: &str,
        files: &[(&str, &str)],
    ) -> UpdateInfo {
        let mut entries = Vec::new();
        let mut uncompressed_size = 0u64;
        for (rel, contents) in files {
            let path = folder.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
            let (sha256, md5, size) =
                crate::verify::digests_of_reader(Cursor::new(contents.as_bytes())).unwrap();
            uncompressed_size += size;
            entries.push(FileEntry {
                path: rel.to_string(),
                ignore: false,
                last_write_time: OffsetDateTime::UNIX_EPOCH,
                sha256: Some(sha256),
                md5: Some(md5),
            });
        }
        UpdateInfo {
            displayname: "Test App".into(),
            version: PackageVersion::parse(version),
            release_time: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            release_type: "Stable".into(),
            uncompressed_size,
            files: Some(entries),
            ..Default::default()
        }
    }

    pub(crate) fn write_signed_manifest(
        folder: &Path,
        manifest: &UpdateInfo,
        key: &RsaPrivateKey,
    ) {
        fs::create_dir_all(folder).unwrap();
        let json = serde_json::to_vec(manifest).unwrap();
        let out = fs::File::create(folder.join(MANIFEST_NAME)).unwrap();
        signed::create_signed(Cursor::new(&json), out, key).unwrap();
    }

    /// A complete verifiable install: files plus their signed manifest.
    pub(crate) fn install_dir(
        folder: &Path,
        key: &RsaPrivateKey,
        version: &str,
        files: &[(&str, &str)],
    ) -> UpdateInfo {
        let manifest = manifest_for(folder, version, files);
        write_signed_manifest(folder, &manifest, key);
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names() {
        assert_eq!(env_name("myapp", "POLICY"), "AUTOUPDATER_MYAPP_POLICY");
        assert_eq!(
            env_name("My App 2", "SKIP_UPDATE"),
            "AUTOUPDATER_MY_APP_2_SKIP_UPDATE"
        );
    }

    #[test]
    fn builder_requires_endpoints() {
        let updater = UpdaterBuilder::new(PackageVersion::parse("1.0"), Config::default()).build();
        assert!(matches!(updater, Err(Error::EmptyEndpoints)));
    }
}
