//! Shape-tolerant extraction from provider JSON payloads

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::models::{PlaybackInfo, RawChannel, RawProgram};

/// How deep to search for the channel list in the lineup payload
const MAX_LINEUP_DEPTH: usize = 6;

const FIS_BASE: &str = "https://dfwfis.prod.dtvcdn.com/catalog/image/imageserver/v1/service/sports";

type Object = Map<String, Value>;

fn looks_like_channel(obj: &Object) -> bool {
    obj.keys().any(|k| {
        matches!(
            k.to_ascii_lowercase().as_str(),
            "ccid" | "callsign" | "channelnumber" | "resourceid" | "logo" | "logourl"
        )
    })
}

/// Largest list of channel-like objects anywhere in `root`
pub fn find_channel_list(root: &Value) -> Vec<&Object> {
    fn walk<'a>(node: &'a Value, depth: usize, best: &mut (usize, Vec<&'a Object>)) {
        if depth > MAX_LINEUP_DEPTH {
            return;
        }
        match node {
            Value::Array(items) => {
                let objects: Vec<&Object> = items.iter().filter_map(|v| v.as_object()).collect();
                if !items.is_empty() && objects.len() == items.len() {
                    let score = objects.iter().filter(|o| looks_like_channel(o)).count();
                    if score > 0 && (score, objects.len()) > (best.0, best.1.len()) {
                        *best = (score, objects);
                    }
                }
                for item in items {
                    walk(item, depth + 1, best);
                }
            }
            Value::Object(map) => {
                for v in map.values() {
                    walk(v, depth + 1, best);
                }
            }
            _ => {}
        }
    }

    let mut best = (0, Vec::new());
    walk(root, 0, &mut best);
    best.1
}

/// First non-empty string (or number rendered as text) among `keys`
fn pick_str(obj: &Object, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn pick_u32(obj: &Object, keys: &[&str]) -> Option<u32> {
    pick_str(obj, keys).and_then(|s| s.parse::<u32>().ok())
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn extract_logo(obj: &Object) -> Option<String> {
    if let Some(url) = pick_str(obj, &["logoUrl", "logoURL", "logo_url"]) {
        return Some(url);
    }
    if let Some(logo) = obj.get("logo").and_then(|l| l.as_object()) {
        if let Some(url) = pick_str(logo, &["url", "href", "uri"]) {
            return Some(url);
        }
    }
    as_list(obj.get("images"))
        .into_iter()
        .filter_map(|v| v.as_object())
        .find_map(|img| pick_str(img, &["url", "href", "uri", "logoUrl"]))
}

pub fn normalize_channel(obj: &Object) -> RawChannel {
    RawChannel {
        ccid: pick_str(obj, &["ccid", "ccId", "channelId", "channelID", "channel_id", "id"])
            .unwrap_or_default(),
        number: pick_str(
            obj,
            &["channelNumber", "channel_number", "number", "chNum", "chNumber"],
        ),
        call_sign: pick_str(obj, &["callSign", "callsign", "call_sign"]),
        name: pick_str(obj, &["channelName", "name", "displayName", "title"]),
        logo_url: extract_logo(obj),
        resource_id: pick_str(obj, &["resourceId", "resourceID", "resource_id", "guid"]),
    }
}

/// Lineup rows from an AllChannels payload: rows without ccid are dropped,
/// the first row per ccid wins. `None` when no channel list was found.
pub fn parse_lineup(root: &Value) -> Option<Vec<RawChannel>> {
    let list = find_channel_list(root);
    if list.is_empty() {
        return None;
    }

    let mut seen = HashSet::new();
    Some(
        list.into_iter()
            .map(normalize_channel)
            .filter(|c| !c.ccid.is_empty())
            .filter(|c| seen.insert(c.ccid.clone()))
            .collect(),
    )
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    // Naive timestamps are UTC
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

fn program_icon(content: &Object) -> Option<String> {
    let images: Vec<&Object> = as_list(content.get("images"))
        .into_iter()
        .filter_map(|v| v.as_object())
        .collect();

    for wanted in ["iconic", "bg-fplayer"] {
        for img in &images {
            let kind = img.get("imageType").and_then(|t| t.as_str());
            let id = img.get("imageId").and_then(|t| t.as_str());
            if let (Some(kind), Some(id)) = (kind, id) {
                if kind == wanted && !id.is_empty() {
                    let (w, h) = if kind == "iconic" { (250, 144) } else { (640, 360) };
                    return Some(format!("{}/{}/{}/{}/{}", FIS_BASE, id, kind, w, h));
                }
            }
        }
    }
    None
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    as_list(value)
        .into_iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Programme rows of one schedule payload.
///
/// `default_channel` is used for schedule entries without a channel id, which
/// only makes sense for single-channel requests.
pub fn parse_schedule(payload: &Value, default_channel: Option<&str>) -> Vec<RawProgram> {
    let mut out = Vec::new();

    for sched in as_list(payload.get("schedules")) {
        let sched = match sched.as_object() {
            Some(s) => s,
            None => continue,
        };
        let channel_id = match pick_str(sched, &["channelId"]).or_else(|| default_channel.map(String::from)) {
            Some(id) => id,
            None => continue,
        };

        for content in as_list(sched.get("contents")) {
            let content = match content.as_object() {
                Some(c) => c,
                None => continue,
            };

            let title = pick_str(content, &["title", "displayTitle", "episodeTitle"]);
            let sub_title = pick_str(content, &["episodeTitle"]).or_else(|| {
                pick_str(content, &["displayTitle"]).filter(|d| Some(d) != title.as_ref())
            });
            let genres = string_list(content.get("genres"));
            let categories = if genres.is_empty() {
                string_list(content.get("categories"))
            } else {
                genres
            };

            for cons in as_list(content.get("consumables")) {
                let cons = match cons.as_object() {
                    Some(c) => c,
                    None => continue,
                };
                let start = cons.get("startTime").and_then(|v| v.as_str()).and_then(parse_time);
                let end = cons.get("endTime").and_then(|v| v.as_str()).and_then(parse_time);
                let (start, end) = match (start, end) {
                    (Some(s), Some(e)) => (s, e),
                    _ => continue,
                };

                out.push(RawProgram {
                    channel_id: channel_id.clone(),
                    schedule_id: pick_str(cons, &["scheduleId", "resourceId"])
                        .or_else(|| pick_str(content, &["apgId", "canonicalId"])),
                    start,
                    end,
                    title: title.clone(),
                    sub_title: sub_title.clone(),
                    description: pick_str(content, &["description"]),
                    categories: categories.clone(),
                    season: pick_u32(content, &["seasonNumber"]),
                    episode: pick_u32(content, &["episodeNumber"]),
                    tms_id: pick_str(content, &["tmsId"]),
                    icon: program_icon(content),
                });
            }
        }
    }

    out
}

/// Whether a multi-channel response covers enough of the requested channels.
///
/// A response whose ids don't overlap at all but has at least one schedule
/// per requested channel is accepted; the provider sometimes reports other
/// ids than the ones asked for.
pub fn covers_batch(payload: &Value, requested: &[String], min_ratio: f64) -> bool {
    if requested.is_empty() {
        return true;
    }
    let schedules = as_list(payload.get("schedules"));
    let got: HashSet<String> = schedules
        .iter()
        .filter_map(|s| s.as_object())
        .filter_map(|s| pick_str(s, &["channelId"]))
        .collect();

    let overlap = requested.iter().filter(|id| got.contains(*id)).count();
    if overlap == 0 && schedules.len() >= requested.len() {
        return true;
    }
    overlap as f64 / requested.len() as f64 >= min_ratio
}

/// Classify a playback authorization response
pub fn parse_playback(payload: &Value) -> PlaybackInfo {
    let pb = payload.get("playbackData").and_then(|p| p.as_object());
    let get = |keys: &[&str]| pb.and_then(|p| pick_str(p, keys));

    let manifest_url = get(&["streamURL", "streamUrl", "manifestUrl", "manifestURL"]);
    let fallback_url = get(&["fallbackStreamUrl", "fallbackStreamURL", "fallbackUrl"]);
    let keyframe_url = get(&["keyframeUrl", "keyframeURL"]);

    let reason = if manifest_url.is_some() {
        None
    } else {
        Some(format!("no_stream; {}", no_stream_reason(payload)))
    };

    PlaybackInfo {
        playable: manifest_url.is_some(),
        manifest_url,
        fallback_url,
        keyframe_url,
        reason,
    }
}

fn no_stream_reason(payload: &Value) -> String {
    if let Some(obj) = payload.as_object() {
        for key in ["error", "errorCode", "errorMessage", "message", "detail", "reason"] {
            if let Some(Value::String(s)) = obj.get(key) {
                if !s.trim().is_empty() {
                    let text: String = s.trim().chars().take(180).collect();
                    return format!("{}={}", key, text);
                }
            }
        }
    }
    format!(
        "authorized={} has_playbackData={}",
        payload.get("authorized").unwrap_or(&Value::Null),
        payload.get("playbackData").map_or(false, |p| p.is_object())
    )
}
