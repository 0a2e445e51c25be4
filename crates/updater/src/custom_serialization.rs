// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use serde::{
    de::Error as DeError, ser::SerializeStruct, Deserialize, Deserializer, Serialize, Serializer,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{FileEntry, PackageVersion, ReleaseType, UpdateInfo};

fn parse_time<'de, D>(value: Option<String>) -> std::result::Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    match value {
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
            .map_err(|e| D::Error::custom(format!("invalid timestamp `{raw}`: {e}"))),
        None => Ok(OffsetDateTime::UNIX_EPOCH),
    }
}

fn format_time<S: Serializer>(time: &OffsetDateTime) -> std::result::Result<String, S::Error> {
    time.format(&Rfc3339)
        .map_err(|e| serde::ser::Error::custom(format!("unformattable timestamp: {e}")))
}

impl<'de> Deserialize<'de> for PackageVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // unparsable versions degrade to 0.0 instead of failing the manifest
        let raw = String::deserialize(deserializer)?;
        Ok(PackageVersion::parse(&raw))
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReleaseType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ReleaseType::parse(&raw))
    }
}

impl Serialize for ReleaseType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for FileEntry {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct InnerFileEntry {
            path: String,
            #[serde(default)]
            ignore: bool,
            #[serde(default)]
            last_write_time: Option<String>,
            #[serde(rename = "SHA256", default)]
            sha256: Option<String>,
            #[serde(rename = "MD5", default)]
            md5: Option<String>,
        }

        let entry = InnerFileEntry::deserialize(deserializer)?;
        Ok(FileEntry {
            path: entry.path,
            ignore: entry.ignore,
            last_write_time: parse_time::<D>(entry.last_write_time)?,
            sha256: entry.sha256,
            md5: entry.md5,
        })
    }
}

impl Serialize for FileEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FileEntry", 5)?;
        state.serialize_field("path", &self.path)?;
        state.serialize_field("ignore", &self.ignore)?;
        state.serialize_field("last_write_time", &format_time::<S>(&self.last_write_time)?)?;
        state.serialize_field("SHA256", &self.sha256)?;
        state.serialize_field("MD5", &self.md5)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for UpdateInfo {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct InnerUpdateInfo {
            #[serde(default)]
            displayname: String,
            #[serde(default)]
            version: PackageVersion,
            #[serde(default)]
            release_time: Option<String>,
            #[serde(default)]
            release_type: String,
            #[serde(default)]
            compressed_size: u64,
            #[serde(default)]
            uncompressed_size: u64,
            #[serde(rename = "SHA256", default)]
            sha256: Option<String>,
            #[serde(rename = "MD5", default)]
            md5: Option<String>,
            #[serde(default)]
            remote_urls: Option<Vec<String>>,
            #[serde(default)]
            files: Option<Vec<FileEntry>>,
        }

        let info = InnerUpdateInfo::deserialize(deserializer)?;
        Ok(UpdateInfo {
            displayname: info.displayname,
            version: info.version,
            release_time: parse_time::<D>(info.release_time)?,
            release_type: info.release_type,
            compressed_size: info.compressed_size,
            uncompressed_size: info.uncompressed_size,
            sha256: info.sha256,
            md5: info.md5,
            remote_urls: info.remote_urls,
            files: info.files,
        })
    }
}

impl Serialize for UpdateInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UpdateInfo", 10)?;
        state.serialize_field("displayname", &self.displayname)?;
        state.serialize_field("version", &self.version)?;
        state.serialize_field("release_time", &format_time::<S>(&self.release_time)?)?;
        state.serialize_field("release_type", &self.release_type)?;
        state.serialize_field("compressed_size", &self.compressed_size)?;
        state.serialize_field("uncompressed_size", &self.uncompressed_size)?;
        state.serialize_field("SHA256", &self.sha256)?;
        state.serialize_field("MD5", &self.md5)?;
        state.serialize_field("remote_urls", &self.remote_urls)?;
        state.serialize_field("files", &self.files)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_roundtrip() {
        let manifest = UpdateInfo {
            displayname: "Test Release".into(),
            version: PackageVersion::parse("2.1.0.0"),
            release_time: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            release_type: "Beta".into(),
            compressed_size: 1234,
            uncompressed_size: 5678,
            sha256: Some("c2hhMjU2".into()),
            md5: Some("bWQ1".into()),
            remote_urls: Some(vec!["https://example.com/stable/package.zip".into()]),
            files: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: UpdateInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn missing_fields_default() {
        let back: UpdateInfo = serde_json::from_str(r#"{"version": "1.0"}"#).unwrap();
        assert_eq!(back.version, PackageVersion::parse("1.0"));
        assert_eq!(back.release_time, OffsetDateTime::UNIX_EPOCH);
        assert!(back.files.is_none());
        assert!(back.remote_urls.is_none());
    }

    #[test]
    fn unparsable_version_degrades() {
        let back: UpdateInfo = serde_json::from_str(r#"{"version": "one.two"}"#).unwrap();
        assert_eq!(back.version, PackageVersion::zero());
    }

    #[test]
    fn file_entry_roundtrip() {
        let entry = FileEntry {
            path: "bin/app".into(),
            ignore: false,
            last_write_time: OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap(),
            sha256: Some("AAAA".into()),
            md5: Some("BBBB".into()),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: FileEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
