//! Core types for download-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use utoipa::ToSchema;

/// Identity of a subscribing user, as supplied by the upstream auth layer
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new UserId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical download status, independent of the backend that reported it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting in the client's queue
    Queued,
    /// Actively transferring
    Downloading,
    /// Paused by the user or the client
    Paused,
    /// Finished downloading (seeding, post-processing done, or moved to history)
    Completed,
    /// Failed, or reported in a state we could not map
    Error,
}

impl DownloadStatus {
    /// Whether this status ends a download's life cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Error)
    }

    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining time reported by a backend
///
/// Serialized as `H:MM:SS`, or the literal string `"unknown"` when the backend
/// has no estimate (stalled, queued, infinite ETA).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeLeft {
    /// Backend supplied an estimate
    Known(Duration),
    /// No usable estimate
    #[default]
    Unknown,
}

impl TimeLeft {
    /// Wire representation of the "no estimate" case
    pub const UNKNOWN: &'static str = "unknown";

    /// Build from a number of seconds
    pub fn from_secs(secs: u64) -> Self {
        TimeLeft::Known(Duration::from_secs(secs))
    }

    /// Parse `H:MM:SS`, `MM:SS`, or `D:HH:MM:SS`; anything else is `Unknown`
    pub fn parse_clock(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(Self::UNKNOWN) {
            return TimeLeft::Unknown;
        }

        let parts: Option<Vec<u64>> = value.split(':').map(|p| p.parse().ok()).collect();
        let units: &[u64] = match parts.as_deref() {
            Some([_, _]) => &[60, 1],
            Some([_, _, _]) => &[3600, 60, 1],
            Some([_, _, _, _]) => &[86_400, 3600, 60, 1],
            _ => return TimeLeft::Unknown,
        };

        // Vendor strings can be arbitrarily large; overflow means no estimate
        let secs = parts
            .iter()
            .flatten()
            .zip(units)
            .try_fold(0u64, |total, (value, unit)| {
                value.checked_mul(*unit)?.checked_add(total)
            });
        secs.map_or(TimeLeft::Unknown, TimeLeft::from_secs)
    }
}

impl std::fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeLeft::Known(d) => {
                let total = d.as_secs();
                write!(f, "{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
            }
            TimeLeft::Unknown => f.write_str(Self::UNKNOWN),
        }
    }
}

impl Serialize for TimeLeft {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeLeft {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TimeLeft::parse_clock(&raw))
    }
}

/// How a vendor expresses progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressUnit {
    /// 0.0 – 1.0
    Fraction,
    /// 0 – 100
    Percent,
}

impl ProgressUnit {
    /// Convert a raw vendor value into a percentage in `[0, 100]`, rounded to
    /// two decimals. Non-finite input is treated as zero.
    pub fn normalize(&self, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        let percent = match self {
            ProgressUnit::Fraction => raw * 100.0,
            ProgressUnit::Percent => raw,
        };
        ((percent * 100.0).round() / 100.0).clamp(0.0, 100.0)
    }
}

/// Uniqueness key of a download across all configured backends
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Instance name the record came from
    pub source: String,
    /// Backend-native identifier (info hash, nzo_id)
    pub hash: String,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.hash)
    }
}

/// One download as seen by one backend instance, normalized
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    /// Stable identifier, `source:hash`
    pub id: String,
    /// Display title (release name with separators cleaned up)
    pub title: String,
    /// Raw release / torrent / job name as reported by the backend
    pub torrent_title: String,
    /// Backend instance name
    pub source: String,
    /// Backend-native identifier
    pub hash: String,
    /// Percentage complete, 0 – 100
    pub progress: f64,
    /// Remaining time, or "unknown"
    #[schema(value_type = String, example = "0:12:30")]
    pub time_left: TimeLeft,
    /// Canonical status
    pub status: DownloadStatus,
    /// When this record was observed
    pub last_updated: DateTime<Utc>,
    /// Original vendor status when it could not be mapped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_status: Option<String>,
}

impl DownloadRecord {
    /// Build a record, deriving `id` and `title` from the raw fields
    pub fn new(
        source: impl Into<String>,
        hash: impl Into<String>,
        torrent_title: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let hash = hash.into();
        let torrent_title = torrent_title.into();
        Self {
            id: format!("{}:{}", source, hash),
            title: display_title(&torrent_title),
            torrent_title,
            source,
            hash,
            progress: 0.0,
            time_left: TimeLeft::Unknown,
            status: DownloadStatus::Queued,
            last_updated: Utc::now(),
            vendor_status: None,
        }
    }

    /// Uniqueness key
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source: self.source.clone(),
            hash: self.hash.clone(),
        }
    }
}

/// Turn a release name like `Some.Show.S01E02.1080p` into `Some Show S01E02 1080p`
pub fn display_title(raw: &str) -> String {
    let stem = raw
        .strip_suffix(".nzb")
        .or_else(|| raw.strip_suffix(".torrent"))
        .unwrap_or(raw);
    stem.split(['.', '_'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Message pushed to subscriber connections
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A batch of changed downloads
    DownloadProgressBatch {
        /// Changed records
        downloads: Vec<DownloadRecord>,
    },
}

impl OutboundMessage {
    /// Wrap a batch of records
    pub fn progress_batch(downloads: Vec<DownloadRecord>) -> Self {
        OutboundMessage::DownloadProgressBatch { downloads }
    }

    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::DownloadProgressBatch { .. } => "download_progress_batch",
        }
    }

    /// Number of records carried
    pub fn len(&self) -> usize {
        match self {
            OutboundMessage::DownloadProgressBatch { downloads } => downloads.len(),
        }
    }

    /// Whether the message carries no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_progress_is_scaled_to_percent() {
        assert_eq!(ProgressUnit::Fraction.normalize(0.755), 75.5);
        assert_eq!(ProgressUnit::Fraction.normalize(1.0), 100.0);
    }

    #[test]
    fn percent_progress_passes_through() {
        assert_eq!(ProgressUnit::Percent.normalize(75.5), 75.5);
        assert_eq!(ProgressUnit::Percent.normalize(0.0), 0.0);
    }

    #[test]
    fn progress_is_clamped_and_nan_safe() {
        assert_eq!(ProgressUnit::Percent.normalize(104.0), 100.0);
        assert_eq!(ProgressUnit::Fraction.normalize(-0.2), 0.0);
        assert_eq!(ProgressUnit::Percent.normalize(f64::NAN), 0.0);
    }

    #[test]
    fn time_left_parses_clock_formats() {
        assert_eq!(TimeLeft::parse_clock("0:10:05"), TimeLeft::from_secs(605));
        assert_eq!(TimeLeft::parse_clock("10:05"), TimeLeft::from_secs(605));
        assert_eq!(
            TimeLeft::parse_clock("1:02:00:00"),
            TimeLeft::from_secs(93_600)
        );
        assert_eq!(TimeLeft::parse_clock("unknown"), TimeLeft::Unknown);
        assert_eq!(TimeLeft::parse_clock("soon"), TimeLeft::Unknown);
        assert_eq!(TimeLeft::parse_clock(""), TimeLeft::Unknown);
    }

    #[test]
    fn time_left_overflow_is_unknown() {
        assert_eq!(
            TimeLeft::parse_clock("18446744073709551615:00:00"),
            TimeLeft::Unknown
        );
        assert_eq!(
            TimeLeft::parse_clock("213503982334601:07:00:16"),
            TimeLeft::Unknown
        );
        assert_eq!(
            TimeLeft::parse_clock("5124095576030431:00:00"),
            TimeLeft::from_secs(5_124_095_576_030_431 * 3600)
        );
    }

    #[test]
    fn time_left_display() {
        assert_eq!(TimeLeft::from_secs(3725).to_string(), "1:02:05");
        assert_eq!(TimeLeft::Unknown.to_string(), "unknown");
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let mut record = DownloadRecord::new("qbittorrent@seedbox", "abc123", "Dune.Part.Two.2024");
        record.progress = 41.3;
        record.status = DownloadStatus::Downloading;
        record.time_left = TimeLeft::from_secs(90);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "qbittorrent@seedbox:abc123");
        assert_eq!(json["title"], "Dune Part Two 2024");
        assert_eq!(json["torrentTitle"], "Dune.Part.Two.2024");
        assert_eq!(json["progress"], 41.3);
        assert_eq!(json["timeLeft"], "0:01:30");
        assert_eq!(json["status"], "downloading");
        assert!(json["lastUpdated"].as_str().unwrap().contains('T'));
        assert!(json.get("vendorStatus").is_none());
    }

    #[test]
    fn batch_message_is_tagged() {
        let record = DownloadRecord::new("sab", "SABnzbd_nzo_1", "Some.Show.S01E01.nzb");
        let json = serde_json::to_value(OutboundMessage::progress_batch(vec![record])).unwrap();
        assert_eq!(json["type"], "download_progress_batch");
        assert_eq!(json["downloads"][0]["title"], "Some Show S01E01");
    }
}
