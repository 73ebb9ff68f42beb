//! SABnzbd API adapter (Usenet family)
//!
//! Every call goes to `{base}/api` with `apikey` and `output=json` in the query
//! string. SABnzbd answers authentication failures with HTTP 200 and a
//! `{"status": false, "error": "..."}` body, so status codes alone are not
//! enough to classify errors.

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

/// Map a SABnzbd slot status onto the canonical status
pub fn map_status(status: &str) -> Option<DownloadStatus> {
    let status = match status {
        "Downloading" | "Fetching" | "Grabbing" | "Propagating" | "Checking" | "Verifying"
        | "Repairing" | "Extracting" | "Moving" | "Running" => DownloadStatus::Downloading,
        "Queued" => DownloadStatus::Queued,
        "Paused" => DownloadStatus::Paused,
        "Completed" => DownloadStatus::Completed,
        "Failed" => DownloadStatus::Error,
        _ => return None,
    };
    Some(status)
}

/// Error envelope SABnzbd uses for rejected calls
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    status: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    queue: Queue,
}

#[derive(Debug, Deserialize)]
struct Queue {
    /// Whole queue paused; slots keep their own status in that case
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    slots: Vec<Slot>,
}

/// One queue slot
#[derive(Debug, Deserialize)]
struct Slot {
    nzo_id: String,
    /// Defaults to the nzo_id when absent
    #[serde(default)]
    filename: Option<String>,
    /// Percentage, usually quoted ("45"); defaults to 0
    #[serde(default, deserialize_with = "lenient_f64")]
    percentage: Option<f64>,
    /// `H:MM:SS`; absent means unknown
    #[serde(default)]
    timeleft: Option<String>,
    /// Absent status maps to Error with vendor status "missing"
    #[serde(default)]
    status: Option<String>,
}

impl Slot {
    fn into_record(self, source: &str, queue_paused: bool) -> DownloadRecord {
        let filename = self.filename.unwrap_or_else(|| self.nzo_id.clone());
        let mut record = DownloadRecord::new(source, self.nzo_id, filename);
        record.progress = ProgressUnit::Percent.normalize(self.percentage.unwrap_or(0.0));

        let status = self.status.unwrap_or_else(|| "missing".to_string());
        match map_status(&status) {
            Some(DownloadStatus::Downloading) if queue_paused => {
                record.status = DownloadStatus::Paused;
            }
            Some(mapped) => record.status = mapped,
            None => {
                record.status = DownloadStatus::Error;
                record.vendor_status = Some(status);
            }
        }

        // SABnzbd reports 0:00:00 for anything not actively transferring
        record.time_left = match record.status {
            DownloadStatus::Downloading => self
                .timeleft
                .as_deref()
                .map(TimeLeft::parse_clock)
                .unwrap_or(TimeLeft::Unknown),
            DownloadStatus::Completed => TimeLeft::from_secs(0),
            _ => TimeLeft::Unknown,
        };
        record.last_updated = Utc::now();
        record
    }
}

/// SABnzbd adapter
pub struct SabnzbdAdapter {
    name: String,
    api: url::Url,
    http: reqwest::Client,
    api_key: String,
}

impl SabnzbdAdapter {
    /// Backend type identifier
    pub const KIND: &'static str = "sabnzbd";

    /// Connect and validate the API key with a minimal queue call
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let name = config.instance_name();
        let api_key = match config.credentials() {
            Credentials::ApiKey(key) => key,
            _ => {
                return Err(ClientError::InvalidConfig {
                    instance: name,
                    reason: "SABnzbd needs an api_key".to_string(),
                });
            }
        };

        let base = parse_base_url(&config)?;
        let adapter = Self {
            api: endpoint(&name, &base, "api")?,
            http: build_http_client(&config)?,
            name,
            api_key,
        };

        adapter.health_check().await?;
        tracing::info!(instance = %adapter.name, "Connected to SABnzbd");

        Ok(adapter)
    }

    /// Call the API with the given mode and extra parameters
    async fn call(&self, mode: &str, extra: &[(&str, &str)]) -> Result<Vec<u8>, ClientError> {
        let mut query: Vec<(&str, &str)> = vec![
            ("mode", mode),
            ("output", "json"),
            ("apikey", self.api_key.as_str()),
        ];
        query.extend_from_slice(extra);

        let response = self
            .http
            .get(self.api.clone())
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?;
        check_status(&self.name, response.status())?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::from_reqwest(&self.name, &e))?
            .to_vec();

        self.check_envelope(&body)?;
        Ok(body)
    }

    /// Surface `{"status": false}` envelopes as typed errors
    fn check_envelope(&self, body: &[u8]) -> Result<(), ClientError> {
        let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) else {
            return Ok(());
        };
        if envelope.status {
            return Ok(());
        }

        let message = envelope.error.unwrap_or_else(|| "unknown error".to_string());
        if message.contains("API Key") {
            Err(ClientError::PermanentAuth {
                instance: self.name.clone(),
                reason: message,
            })
        } else {
            Err(ClientError::TransientConnection {
                instance: self.name.clone(),
                reason: message,
            })
        }
    }
}

#[async_trait]
impl ClientAdapter for SabnzbdAdapter {
    fn source(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn list_active(&self) -> Result<Vec<DownloadRecord>, ClientError> {
        let body = self.call("queue", &[]).await?;
        let response: QueueResponse = decode_json(&self.name, &body)?;
        let paused = response.queue.paused;

        tracing::debug!(
            instance = %self.name,
            count = response.queue.slots.len(),
            paused,
            "Fetched queue"
        );

        Ok(response
            .queue
            .slots
            .into_iter()
            .map(|slot| slot.into_record(&self.name, paused))
            .collect())
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        let body = self.call("queue", &[("limit", "0")]).await?;
        decode_json::<QueueResponse>(&self.name, &body).map(|_| ())
    }
}
