// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Package building: the inverse of the installer. Produces a signed
//! `package.zip` and the signed remote manifest describing it.

use std::{
    fs,
    io::{Cursor, Read, Write},
    path::Path,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use md5::Md5;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    signed, verify::digests_of_file, FileEntry, Result, UpdateInfo, MANIFEST_NAME, PACKAGE_NAME,
};

/// Builds a signed update package from the files under `input_dir`.
///
/// `base_manifest` provides the release metadata (display name, version,
/// release type, download URLs) and, through its entries flagged `ignore`,
/// the paths excluded from packaging. Writes `package.zip` and a signed
/// `autoupdate.manifest` into `output_dir` and returns the remote manifest.
pub fn build_package(
    input_dir: &Path,
    output_dir: &Path,
    base_manifest: &UpdateInfo,
    key: &RsaPrivateKey,
) -> Result<UpdateInfo> {
    let mut manifest = base_manifest.clone();
    if manifest.release_time == OffsetDateTime::UNIX_EPOCH {
        manifest.release_time = OffsetDateTime::now_utc();
    }

    let ignore_entries: Vec<FileEntry> = manifest
        .files
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.ignore)
        .collect();
    let ignore_paths: Vec<String> = ignore_entries.iter().map(|e| e.path.clone()).collect();

    fs::create_dir_all(output_dir)?;
    let package_path = output_dir.join(PACKAGE_NAME);
    let mut zip = ZipWriter::new(fs::File::create(&package_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = Vec::new();
    let mut uncompressed_size = 0u64;

    for entry in WalkDir::new(input_dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel_path = match entry.path().strip_prefix(input_dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let rel = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if rel == MANIFEST_NAME || is_ignored(&rel, &ignore_paths) {
            continue;
        }

        let last_write_time = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        if entry.file_type().is_dir() {
            let dir_path = format!("{rel}/");
            zip.add_directory(dir_path.as_str(), options)?;
            files.push(FileEntry {
                path: dir_path,
                ignore: false,
                last_write_time,
                sha256: None,
                md5: None,
            });
            continue;
        }

        zip.start_file(rel.as_str(), options)?;
        let (sha256, md5, size) = copy_hashed(entry.path(), &mut zip)?;
        uncompressed_size += size;
        files.push(FileEntry {
            path: rel,
            ignore: false,
            last_write_time,
            sha256: Some(sha256),
            md5: Some(md5),
        });
    }

    files.extend(ignore_entries);

    // the embedded manifest carries the file table and no remote data
    let mut local = manifest.clone();
    local.files = Some(files);
    local.uncompressed_size = uncompressed_size;
    local.remote_urls = None;
    local.compressed_size = 0;
    local.sha256 = None;
    local.md5 = None;

    let local_json = serde_json::to_vec(&local)?;
    let mut signed_manifest = Vec::new();
    signed::create_signed(Cursor::new(&local_json), &mut signed_manifest, key)?;
    zip.start_file(MANIFEST_NAME, options)?;
    zip.write_all(&signed_manifest)?;
    zip.finish()?;

    // the remote manifest describes the finished archive
    let (sha256, md5, compressed_size) = digests_of_file(&package_path)?;
    let mut remote = manifest;
    remote.files = None;
    remote.uncompressed_size = 0;
    remote.compressed_size = compressed_size;
    remote.sha256 = Some(sha256);
    remote.md5 = Some(md5);

    let remote_json = serde_json::to_vec(&remote)?;
    let manifest_out = fs::File::create(output_dir.join(MANIFEST_NAME))?;
    signed::create_signed(Cursor::new(&remote_json), manifest_out, key)?;

    Ok(remote)
}

fn is_ignored(rel: &str, ignore_paths: &[String]) -> bool {
    ignore_paths.iter().any(|p| {
        let trimmed = p.trim_end_matches('/');
        rel == trimmed || rel.starts_with(&format!("{trimmed}/"))
    })
}

/// Streams a file into the zip while hashing it.
fn copy_hashed<W: Write>(path: &Path, mut output: W) -> Result<(String, String, u64)> {
    let mut input = fs::File::open(path)?;
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        md5.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        size += n as u64;
    }
    Ok((
        STANDARD.encode(sha256.finalize()),
        STANDARD.encode(md5.finalize()),
        size,
    ))
}
