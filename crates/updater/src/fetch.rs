// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Update checks against the configured manifest endpoints.

use std::io::Cursor;

use http::header::USER_AGENT;
use reqwest::{blocking::Client, header::HeaderValue};
use url::Url;

use crate::{signed, PackageVersion, ReleaseType, Result, UpdateInfo, Updater};

impl Updater {
    /// Check for an update on the given channel.
    ///
    /// Endpoints are tried in order; transport, signature and parse failures
    /// are reported to the error listener and the next endpoint is tried.
    /// Once a manifest has been fetched and verified, the release policy
    /// decides the final answer — `None` is the normal "no update" result.
    pub fn check_for_update(&self, channel: ReleaseType) -> Option<UpdateInfo> {
        let channel = if channel == ReleaseType::Unknown {
            self.config.channel
        } else {
            channel
        };

        for endpoint in &self.config.endpoints {
            match self.fetch_manifest(endpoint, channel) {
                Ok(update) => return self.apply_policy(update, channel),
                Err(e) => self.report_error(&e),
            }
        }
        None
    }

    fn fetch_manifest(&self, endpoint: &Url, channel: ReleaseType) -> Result<UpdateInfo> {
        let url = splice_channel(endpoint, channel);
        log::debug!("checking for updates at {url}");

        let mut headers = self.headers.clone();
        let mut agent = format!("{} v{}", self.config.app_name, self.current_version);
        if let Some(id) = &self.install_id {
            agent.push_str(&format!(" -{id}"));
            headers.insert(
                "x-install-id",
                HeaderValue::from_str(id).map_err(http::Error::from)?,
            );
        }
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&agent).map_err(http::Error::from)?,
        );

        let mut request = Client::new().get(url.clone()).headers(headers);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(crate::Error::Network(format!(
                "manifest request to {url} failed with status {}",
                response.status()
            )));
        }

        let body = response.bytes()?;
        let payload = signed::read_verified(Cursor::new(&body), &self.public_key)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    fn apply_policy(&self, update: UpdateInfo, channel: ReleaseType) -> Option<UpdateInfo> {
        if !policy_allows(
            &update,
            &self.current_version,
            &self.config.release_type,
            channel,
        ) {
            return None;
        }
        self.record_check(&update);
        Some(update)
    }
}

/// Release policy for a fetched manifest.
pub(crate) fn policy_allows(
    update: &UpdateInfo,
    current_version: &PackageVersion,
    self_release_type: &str,
    channel: ReleaseType,
) -> bool {
    if update.version <= *current_version {
        log::debug!(
            "ignoring manifest for {}, not newer than running {current_version}",
            update.version
        );
        return false;
    }

    // a Debug build only ever updates to another build of its own track
    if ReleaseType::parse(self_release_type) == ReleaseType::Debug
        && !update.release_type.eq_ignore_ascii_case(self_release_type)
    {
        log::debug!(
            "ignoring {} manifest while running a {self_release_type} build",
            update.release_type
        );
        return false;
    }

    let release_type = update.parsed_release_type();
    if release_type > channel {
        log::debug!("ignoring {release_type} manifest, channel is {channel}");
        return false;
    }

    true
}

/// Replaces a path segment naming a known release track with the requested
/// channel, so one endpoint template serves every track.
fn splice_channel(url: &Url, channel: ReleaseType) -> Url {
    let Some(segments) = url
        .path_segments()
        .map(|s| s.map(str::to_string).collect::<Vec<_>>())
    else {
        return url.clone();
    };

    let mut spliced = url.clone();
    let mut changed = false;
    let segments: Vec<String> = segments
        .into_iter()
        .map(|segment| {
            if !segment.is_empty() && ReleaseType::parse(&segment) != ReleaseType::Unknown {
                changed = true;
                channel.name().to_string()
            } else {
                segment
            }
        })
        .collect();

    if changed {
        if let Ok(mut path) = spliced.path_segments_mut() {
            path.clear();
            path.extend(segments);
        }
    }
    spliced
}
