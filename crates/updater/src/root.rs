// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Resolution of the writable update root.
//!
//! Candidates are probed in three tiers: explicit per-user overrides that
//! must already exist, legacy locations kept for installs migrated from
//! older layouts, and locations the updater is allowed to create. The first
//! candidate that proves writable wins. An environment variable bypasses the
//! whole ladder.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use rand::RngCore;
use time::OffsetDateTime;

use crate::{env_name, non_empty_env, Config, Error, Result};

const README_NAME: &str = "README.txt";
const INSTALLATION_NAME: &str = "installation.txt";

pub(crate) fn resolve_install_root(config: &Config, base_dir: &Path) -> Result<PathBuf> {
    if let Some(raw) = non_empty_env(&env_name(&config.app_name, "UPDATE_ROOT")) {
        let root = PathBuf::from(expand_env_vars(&raw));
        if let Err(e) = fs::create_dir_all(&root) {
            log::warn!("could not create update root {}: {e}", root.display());
        }
        return Ok(root);
    }

    let per_user = per_user_candidates(&config.app_name);

    let mut overrides = vec![base_dir.join("updates")];
    overrides.extend(per_user.iter().cloned());
    for candidate in &overrides {
        if candidate.is_dir() && writable_probe(candidate) {
            return Ok(candidate.clone());
        }
    }

    for candidate in legacy_candidates(&config.app_name) {
        if candidate.is_dir() && dir_has_files(&candidate) && writable_probe(&candidate) {
            return Ok(candidate);
        }
    }

    let mut attempts = Vec::new();
    let program_files = non_empty_env("ProgramFiles").map(PathBuf::from);
    let under_program_files = program_files
        .as_deref()
        .map(|pf| base_dir.starts_with(pf))
        .unwrap_or(false);
    if !under_program_files {
        attempts.push(base_dir.join("updates"));
    }
    if let Some(system) = system_wide_candidate(&config.app_name) {
        attempts.push(system);
    }
    attempts.extend(per_user);
    for candidate in attempts {
        if !candidate.exists() && fs::create_dir_all(&candidate).is_err() {
            continue;
        }
        if writable_probe(&candidate) {
            return Ok(candidate);
        }
    }

    Err(Error::NoInstallRoot)
}

fn per_user_candidates(app_name: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if cfg!(windows) {
        if let Some(local) = dirs::data_local_dir() {
            out.push(local.join(app_name).join("updates"));
        }
        if let Some(roaming) = dirs::data_dir() {
            out.push(roaming.join(app_name).join("updates"));
        }
    } else if cfg!(target_os = "macos") {
        if let Some(support) = dirs::data_dir() {
            out.push(support.join(app_name).join("updates"));
        }
        if let Some(home) = dirs::home_dir() {
            out.push(home.join(".config").join(app_name).join("updates"));
        }
    } else if let Some(config) = dirs::config_dir() {
        out.push(config.join(app_name).join("updates"));
    }
    out
}

fn legacy_candidates(app_name: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(pf) = non_empty_env("ProgramFiles") {
        out.push(PathBuf::from(pf).join(app_name).join("updates"));
    }
    if let Some(local) = dirs::data_local_dir() {
        out.push(local.join(app_name).join("updates"));
    }
    out
}

fn system_wide_candidate(app_name: &str) -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        Some(
            PathBuf::from("/Library/Application Support")
                .join(app_name)
                .join("updates"),
        )
    } else if cfg!(windows) {
        non_empty_env("ProgramData").map(|d| PathBuf::from(d).join(app_name).join("updates"))
    } else {
        Some(PathBuf::from("/usr/share").join(app_name).join("updates"))
    }
}

fn dir_has_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.any(|e| e.map(|e| e.path().is_file()).unwrap_or(false)))
        .unwrap_or(false)
}

/// Writability test: create and delete a uniquely named probe directory.
fn writable_probe(dir: &Path) -> bool {
    let probe = dir.join(format!(
        "test-{}",
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    match fs::create_dir(&probe) {
        Ok(()) => {
            let _ = fs::remove_dir(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Expands `%NAME%` and `${NAME}` references against the process environment.
/// Unknown references are kept literally.
pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(['%', '$']) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let (reference, name) = if let Some(stripped) = tail.strip_prefix('%') {
            match stripped.find('%') {
                Some(end) => (&tail[..end + 2], &stripped[..end]),
                None => {
                    out.push_str(tail);
                    return out;
                }
            }
        } else if let Some(stripped) = tail.strip_prefix("${") {
            match stripped.find('}') {
                Some(end) => (&tail[..end + 3], &stripped[..end]),
                None => {
                    out.push_str(tail);
                    return out;
                }
            }
        } else {
            out.push('$');
            rest = &tail[1..];
            continue;
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(reference),
        }
        rest = &tail[reference.len()..];
    }
    out.push_str(rest);
    out
}

/// Writes `README.txt` and `installation.txt` on first use and returns the
/// installation id: the first non-blank line of `installation.txt`.
pub(crate) fn seed_install_root(root: &Path, config: &Config) -> Option<String> {
    let readme = root.join(README_NAME);
    if !readme.exists() {
        let text = format!(
            "This folder is managed by the automatic update facility of {}.\n\
             \n\
             It contains one subfolder per downloaded update version, each\n\
             holding a signed manifest and the application files. Removing a\n\
             subfolder reverts to an older version; removing the whole folder\n\
             reverts to the originally installed application.\n",
            config.display_name
        );
        if let Err(e) = fs::write(&readme, text) {
            log::warn!("could not write {}: {e}", readme.display());
        }
    }

    let installation = root.join(INSTALLATION_NAME);
    if !installation.exists() {
        if let Err(e) = write_installation_file(&installation) {
            log::warn!("could not write {}: {e}", installation.display());
        }
    }

    let contents = fs::read_to_string(&installation).ok()?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn write_installation_file(path: &Path) -> std::io::Result<()> {
    let mut id_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let id: String = id_bytes.iter().map(|b| format!("{b:02x}")).collect();

    let mut file = fs::File::create(path)?;
    writeln!(file, "{id}")?;
    writeln!(file)?;
    writeln!(
        file,
        "The first line of this file identifies this installation when"
    )?;
    writeln!(
        file,
        "checking for updates. Blank the file to opt out of sending it."
    )?;
    Ok(())
}
