use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the playable URL of a channel is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamUrlMode {
    /// App deeplink built from call sign and resource id
    #[default]
    Deeplink,
    /// Primary HLS manifest from the playback probe
    Manifest,
    /// Fallback manifest from the playback probe
    Fallback,
    /// Manifest, then fallback, then deeplink
    Best,
}

impl std::str::FromStr for StreamUrlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deeplink" => Ok(Self::Deeplink),
            "manifest" => Ok(Self::Manifest),
            "fallback" => Ok(Self::Fallback),
            "best" => Ok(Self::Best),
            other => Err(format!("unknown stream url mode: {}", other)),
        }
    }
}

impl std::fmt::Display for StreamUrlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamUrlMode::Deeplink => write!(f, "deeplink"),
            StreamUrlMode::Manifest => write!(f, "manifest"),
            StreamUrlMode::Fallback => write!(f, "fallback"),
            StreamUrlMode::Best => write!(f, "best"),
        }
    }
}

/// Lineup row as normalized from the AllChannels payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChannel {
    pub ccid: String,
    /// Number as the provider sends it (e.g. "836.0")
    pub number: Option<String>,
    pub call_sign: Option<String>,
    pub name: Option<String>,
    pub logo_url: Option<String>,
    pub resource_id: Option<String>,
}

/// Schedule row as extracted from a schedule payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProgram {
    /// Provider resource id of the channel
    pub channel_id: String,
    pub schedule_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: Option<String>,
    pub sub_title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub tms_id: Option<String>,
    pub icon: Option<String>,
}

/// Result of the playback authorization probe for one ccid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub manifest_url: Option<String>,
    pub fallback_url: Option<String>,
    pub keyframe_url: Option<String>,
    pub playable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PlaybackInfo {
    pub fn unplayable(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Canonical channel, unique by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Provider resource id
    pub id: String,
    pub xmltv_id: String,
    pub ccid: String,
    /// Logical number after optional renumbering
    pub number: Option<u32>,
    /// Number as received from the provider
    pub source_number: Option<String>,
    pub name: String,
    pub call_sign: Option<String>,
    pub logo: String,
    pub stream_url: String,
    /// App deeplink; absent when the channel has no call sign
    pub deeplink: Option<String>,
    pub manifest_url: Option<String>,
    pub fallback_url: Option<String>,
    pub playable: bool,
}

/// Canonical programme; `end` is exclusive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub channel_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub sub_title: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub tms_id: Option<String>,
    pub icon: Option<String>,
}

/// Output of the model builder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub channels: Vec<Channel>,
    pub programs: Vec<Program>,
    /// Rows dropped while building, one message each
    pub warnings: Vec<String>,
}
