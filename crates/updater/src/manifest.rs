// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The update manifest model.
//!
//! A manifest exists in two shapes sharing one type: the *remote* manifest
//! served by an update endpoint carries the package digests and download
//! URLs and has no file table, while the *embedded* manifest stored inside a
//! package (and next to every unpacked install) carries the per-file table
//! and no download URLs.

use std::fmt;

use time::OffsetDateTime;

/// File name of the signed manifest, both inside a package archive and in an
/// unpacked install directory.
pub const MANIFEST_NAME: &str = "autoupdate.manifest";

/// File name of the package archive produced by [`crate::build_package`].
pub const PACKAGE_NAME: &str = "package.zip";

/// A dotted numeric package version, e.g. `2.1.0.0`.
///
/// Two to four numeric components are accepted; anything else parses as the
/// zero version `0.0`. Comparison is componentwise and a missing component
/// ranks below a present zero, so `2.1 < 2.1.0 < 2.1.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageVersion(Vec<u64>);

impl PackageVersion {
    /// Parse a version string. Never fails; unparsable input yields `0.0`.
    pub fn parse(s: &str) -> Self {
        let parts = s.trim().split('.').collect::<Vec<_>>();
        if !(2..=4).contains(&parts.len()) {
            return Self::zero();
        }
        let mut components = Vec::with_capacity(parts.len());
        for part in parts {
            match part.parse::<u64>() {
                Ok(n) => components.push(n),
                Err(_) => return Self::zero(),
            }
        }
        Self(components)
    }

    /// The zero version, used for anything that failed to parse.
    pub fn zero() -> Self {
        Self(vec![0, 0])
    }
}

impl Default for PackageVersion {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{c}")?;
            first = false;
        }
        Ok(())
    }
}

/// A release track.
///
/// The variants are totally ordered from strictest to loosest, so
/// `release_type <= channel` expresses "this release is acceptable on that
/// channel". Unrecognized strings parse as [`ReleaseType::Unknown`], which
/// ranks above every real track and is therefore never accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseType {
    /// Development builds.
    Debug,
    /// The default track.
    Stable,
    /// Pre-release builds considered ready for wider testing.
    Beta,
    /// Builds with experimental features enabled.
    Experimental,
    /// Frequent builds from the main branch.
    Canary,
    /// Automated builds, no stability promises.
    Nightly,
    /// Anything that did not parse as one of the known tracks.
    Unknown,
}

impl ReleaseType {
    /// Case-insensitive parse; unrecognized input maps to [`ReleaseType::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "stable" => Self::Stable,
            "beta" => Self::Beta,
            "experimental" => Self::Experimental,
            "canary" => Self::Canary,
            "nightly" => Self::Nightly,
            _ => Self::Unknown,
        }
    }

    /// The lowercase track name, as spliced into endpoint URLs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Experimental => "experimental",
            Self::Canary => "canary",
            Self::Nightly => "nightly",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for ReleaseType {
    fn default() -> Self {
        Self::Stable
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single entry of an embedded manifest's file table.
///
/// Directory entries carry a trailing `/` and no digests. Entries flagged
/// `ignore` may or may not exist on disk; ignored directories exempt their
/// whole subtree from verification.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Archive-relative path, forward-slash separated.
    pub path: String,
    /// Whether the entry is exempt from verification.
    pub ignore: bool,
    /// Last modification instant of the source file.
    pub last_write_time: OffsetDateTime,
    /// Base64 of the raw SHA-256 digest of the file contents.
    pub sha256: Option<String>,
    /// Base64 of the raw MD5 digest of the file contents.
    pub md5: Option<String>,
}

impl FileEntry {
    /// Whether this entry describes a directory.
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// An update manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInfo {
    /// Human-readable release name.
    pub displayname: String,
    /// Package version.
    pub version: PackageVersion,
    /// Release instant; the Unix epoch means "unknown".
    pub release_time: OffsetDateTime,
    /// Raw release track string as published.
    pub release_type: String,
    /// Size in bytes of the package archive. Remote manifest only.
    pub compressed_size: u64,
    /// Sum of the sizes of the package members.
    pub uncompressed_size: u64,
    /// Base64 SHA-256 of the package archive. Remote manifest only.
    pub sha256: Option<String>,
    /// Base64 MD5 of the package archive. Remote manifest only.
    pub md5: Option<String>,
    /// Ordered candidate download URLs. Remote manifest only.
    pub remote_urls: Option<Vec<String>>,
    /// Per-file table. Embedded manifest only.
    pub files: Option<Vec<FileEntry>>,
}

impl UpdateInfo {
    /// The release track this manifest belongs to.
    pub fn parsed_release_type(&self) -> ReleaseType {
        ReleaseType::parse(&self.release_type)
    }
}

impl Default for UpdateInfo {
    fn default() -> Self {
        Self {
            displayname: String::new(),
            version: PackageVersion::zero(),
            release_time: OffsetDateTime::UNIX_EPOCH,
            release_type: String::new(),
            compressed_size: 0,
            uncompressed_size: 0,
            sha256: None,
            md5: None,
            remote_urls: None,
            files: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_two_to_four_components() {
        assert_eq!(PackageVersion::parse("2.1").to_string(), "2.1");
        assert_eq!(PackageVersion::parse("2.1.0").to_string(), "2.1.0");
        assert_eq!(PackageVersion::parse("2.1.0.0").to_string(), "2.1.0.0");
    }

    #[test]
    fn version_rejects_to_zero() {
        assert_eq!(PackageVersion::parse("").to_string(), "0.0");
        assert_eq!(PackageVersion::parse("2").to_string(), "0.0");
        assert_eq!(PackageVersion::parse("1.2.3.4.5").to_string(), "0.0");
        assert_eq!(PackageVersion::parse("1.x").to_string(), "0.0");
        assert_eq!(PackageVersion::parse("-1.0").to_string(), "0.0");
    }

    #[test]
    fn version_ordering() {
        let v = PackageVersion::parse;
        assert!(v("2.1") < v("2.1.0"));
        assert!(v("2.1.0") < v("2.1.0.1"));
        assert!(v("2.2") > v("2.1.9.9"));
        assert!(v("10.0") > v("9.9.9.9"));
        assert_eq!(v("junk"), PackageVersion::zero());
    }

    #[test]
    fn release_type_order_and_parse() {
        assert!(ReleaseType::Stable < ReleaseType::Nightly);
        assert!(ReleaseType::Nightly < ReleaseType::Unknown);
        assert!(ReleaseType::Debug < ReleaseType::Stable);
        assert_eq!(ReleaseType::parse("BETA"), ReleaseType::Beta);
        assert_eq!(ReleaseType::parse(" canary "), ReleaseType::Canary);
        assert_eq!(ReleaseType::parse("rc1"), ReleaseType::Unknown);
    }

    #[test]
    fn directory_entries() {
        let entry = FileEntry {
            path: "webroot/".into(),
            ignore: true,
            last_write_time: OffsetDateTime::UNIX_EPOCH,
            sha256: None,
            md5: None,
        };
        assert!(entry.is_directory());
    }
}
