//! qBittorrent Web API adapter (BitTorrent family)
//!
//! Authentication is a cookie handshake: `POST api/v2/auth/login` answers
//! `Ok.` and sets an `SID` cookie that must accompany every later call.
//! Progress is reported as a fraction, ETA in seconds with `8640000` meaning
//! "infinite".
//!
//! The torrent list also holds everything that finished and is now seeding.
//! A completed torrent is reported once and then left out, so it ages out of
//! the snapshot instead of staying there for as long as it seeds.

use super::{
    ClientAdapter, build_http_client, check_status, decode_json, endpoint, lenient_f64,
    parse_base_url,
};
use crate::config::{ClientConfig, Credentials};
use crate::error::ClientError;
use crate::types::{DownloadRecord, DownloadStatus, ProgressUnit, TimeLeft};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::{Mutex, RwLock};

/// ETA value qBittorrent uses for "no estimate"
const INFINITE_ETA: i64 = 8_640_000;

/// Map a qBittorrent torrent state onto the canonical status
///
/// Returns `None` for states we do not know, so the caller can keep the raw
/// string for diagnostics.
pub fn map_state(state: &str) -> Option<DownloadStatus> {
    let status = match state {
        "downloading" | "forcedDL" | "metaDL" | "forcedMetaDL" | "stalledDL" | "checkingDL"
        | "allocating" | "moving" => DownloadStatus::Downloading,
        "queuedDL" | "checkingResumeData" => DownloadStatus::Queued,
        "pausedDL" | "stoppedDL" => DownloadStatus::Paused,
        "uploading" | "stalledUP" | "forcedUP" | "queuedUP" | "pausedUP" | "stoppedUP"
        | "checkingUP" => DownloadStatus::Completed,
        "error" | "missingFiles" => DownloadStatus::Error,
        _ => return None,
    };
    Some(status)
}

/// One entry of `api/v2/torrents/info`
///
/// Every field except `hash` is optional: older versions omit some, and a
/// missing value must not be mistaken for real data.
#[derive(Debug, Deserialize)]
struct TorrentInfo {
    hash: String,
    /// Defaults to the hash when absent
    #[serde(default)]
    name: Option<String>,
    /// Fraction 0–1; defaults to 0
    #[serde(default, deserialize_with = "lenient_f64")]
    progress: Option<f64>,
    /// Seconds; absent, negative or infinite means unknown
    #[serde(default)]
    eta: Option<i64>,
    /// Absent state maps to Error with vendor status "missing"
    #[serde(default)]
    state: Option<String>,
}

impl TorrentInfo {
    fn into_record(self, source: &str) -> DownloadRecord {
        let name = self.name.unwrap_or_else(|| self.hash.clone());
        let mut record = DownloadRecord::new(source, self.hash, name);
        record.progress = ProgressUnit::Fraction.normalize(self.progress.unwrap_or(0.0));
        record.time_left = match self.eta {
            Some(eta) if (0..INFINITE_ETA).contains(&eta) => TimeLeft::from_secs(eta as u64),
            _ => TimeLeft::Unknown,
        };

        let state = self.state.unwrap_or_else(|| "missing".to_string());
        match map_state(&state) {
            Some(status) => record.status = status,
            None => {
                record.status = DownloadStatus::Error;
                record.vendor_status = Some(state);
            }
        }
        if record.status == DownloadStatus::Completed {
            record.time_left = TimeLeft::from_secs(0);
        }
        record.last_updated = Utc::now();
        record
    }
}

/// Outcome of one authenticated request
enum Authed {
    Ok(Vec<u8>),
    SessionRejected,
}

/// qBittorrent adapter
pub struct QbittorrentAdapter {
    name: String,
    base: url::Url,
    http: reqwest::Client,
    username: String,
    password: String,
    /// `SID=...` cookie pair; empty when the server bypasses auth
    session: RwLock<Option<String>>,
    /// Hashes already reported as completed
    finished: Mutex<HashSet<String>>,
}

impl QbittorrentAdapter {
    /// Backend type identifier
    pub const KIND: &'static str = "qbittorrent";

    /// Connect and perform the login handshake
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let name = config.instance_name();
        let (username, password) = match config.credentials() {
            Credentials::UserPassword { username, password } => (username, password),
            _ => {
                return Err(ClientError::InvalidConfig {
                    instance: name,
                    reason: "qBittorrent needs a username and password".to_string(),
                });
            }
        };

        let adapter = Self {
            base: parse_base_url(&config)?,
            http: build_http_client(&config)?,
            name,
            username,
            password,
            session: RwLock::new(None),
            finished: Mutex::new(HashSet::new()),
        };

        let cookie = adapter.login().await?;
        *adapter.session.write().await = Some(cookie);
        tracing::info!(instance = %adapter.name, "Logged in to qBittorrent");

        Ok(adapter)
    }

    /// Run the cookie handshake, returning the cookie pair to send back
    async fn login(&self) -> Result<String, ClientError> {
        let url = endpoint(&self.name, &self.base, "api/v2/auth/login")?;
        let response = self
            .http
            .post(url)
            // qBittorrent's CSRF check compares Referer against the host
            .header(reqwest::header::REFERER, self.base.as_str())
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ClientError::PermanentAuth {
                instance: self.name.clone(),
                reason: "login refused (too many failed attempts, IP banned)".to_string(),
            });
        }
        check_status(&self.name, response.status())?;

        let cookie = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .find(|pair| pair.trim_start().starts_with("SID="))
            .map(|pair| pair.trim().to_string());

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?;

        match body.trim() {
            "Ok." => Ok(cookie.unwrap_or_default()),
            "Fails." => Err(ClientError::PermanentAuth {
                instance: self.name.clone(),
                reason: "username or password rejected".to_string(),
            }),
            other => Err(ClientError::decode(
                &self.name,
                "unexpected login response",
                other.as_bytes(),
            )),
        }
    }

    /// GET an API path with the current session cookie
    async fn get_with_session(&self, path: &str) -> Result<Authed, ClientError> {
        let url = endpoint(&self.name, &self.base, path)?;
        let cookie = self.session.read().await.clone();

        let mut request = self.http.get(url);
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Ok(Authed::SessionRejected);
        }
        check_status(&self.name, response.status())?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?;
        Ok(Authed::Ok(body.to_vec()))
    }

    /// GET with one re-login if the session has expired
    async fn get_authed(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        if let Authed::Ok(body) = self.get_with_session(path).await? {
            return Ok(body);
        }

        tracing::debug!(instance = %self.name, "qBittorrent session expired, logging in again");
        let cookie = self.login().await?;
        *self.session.write().await = Some(cookie);

        match self.get_with_session(path).await? {
            Authed::Ok(body) => Ok(body),
            Authed::SessionRejected => Err(ClientError::PermanentAuth {
                instance: self.name.clone(),
                reason: "session rejected after fresh login".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ClientAdapter for QbittorrentAdapter {
    fn source(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn list_active(&self) -> Result<Vec<DownloadRecord>, ClientError> {
        let body = self.get_authed("api/v2/torrents/info").await?;
        let torrents: Vec<TorrentInfo> = decode_json(&self.name, &body)?;

        tracing::debug!(instance = %self.name, count = torrents.len(), "Fetched torrents");

        let mut finished = self.finished.lock().await;
        let mut listed = HashSet::with_capacity(torrents.len());
        let mut records = Vec::with_capacity(torrents.len());
        for record in torrents.into_iter().map(|t| t.into_record(&self.name)) {
            listed.insert(record.hash.clone());
            if record.status == DownloadStatus::Completed {
                if !finished.insert(record.hash.clone()) {
                    continue;
                }
            } else {
                // Re-checking or re-downloading; report completion again later
                finished.remove(&record.hash);
            }
            records.push(record);
        }
        finished.retain(|hash| listed.contains(hash));

        Ok(records)
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.get_authed("api/v2/app/version").await.map(|_| ())
    }
}
