//! PrismCast enrichment: playlist pointing at PrismCast's HLS endpoints and
//! the channel registration file PrismCast imports.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::models::Channel;
use crate::services::output::m3u::{escape_title, push_attr};
use crate::services::session::browser::GUIDE_URL;

const PROFILE: &str = "directvStream";

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrismcastTarget {
    pub host: String,
    pub port: u16,
}

impl PrismcastTarget {
    pub fn stream_url(&self, key: &str) -> String {
        format!("http://{}:{}/hls/{}/stream.m3u8", self.host, self.port, key)
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("no channel produced a PrismCast key")]
    NoChannels,

    #[error("registration json: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lowercase name with non-alphanumeric runs collapsed to `-`
pub fn channel_key(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    NON_ALNUM.replace_all(&lower, "-").trim_matches('-').to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration<'a> {
    id: &'a str,
    key: &'a str,
    number: Option<u32>,
    name: &'a str,
    url: &'a str,
    profile: &'a str,
    channel_selector: &'a str,
}

/// Render `(prismcast_enriched.m3u, prismcast_channels.json)`.
///
/// Channels whose name yields an empty key are skipped. Duplicate keys get
/// the ccid appended.
pub fn render_enriched(
    channels: &[Channel],
    target: &PrismcastTarget,
    group_title: &str,
) -> Result<(Vec<u8>, Vec<u8>), EnrichError> {
    let mut seen = HashSet::new();
    let mut keyed: Vec<(String, &Channel)> = Vec::with_capacity(channels.len());
    let mut skipped = 0usize;

    for channel in channels {
        let base = channel_key(&channel.name);
        if base.is_empty() {
            skipped += 1;
            continue;
        }
        let mut key = base.clone();
        if seen.contains(&key) {
            key = format!("{}-{}", base, channel.ccid);
            let mut n = 2;
            while seen.contains(&key) {
                key = format!("{}-{}-{}", base, channel.ccid, n);
                n += 1;
            }
        }
        seen.insert(key.clone());
        keyed.push((key, channel));
    }

    if skipped > 0 {
        tracing::warn!(skipped, "Channels without a usable PrismCast key skipped");
    }
    if keyed.is_empty() {
        return Err(EnrichError::NoChannels);
    }

    let mut m3u = String::with_capacity(64 + keyed.len() * 350);
    m3u.push_str("#EXTM3U\n");
    for (key, channel) in &keyed {
        let number = channel.number.map(|n| n.to_string()).unwrap_or_default();

        let mut attrs = Vec::with_capacity(7);
        push_attr(&mut attrs, "tvg-id", &channel.xmltv_id);
        push_attr(&mut attrs, "tvg-name", &channel.name);
        push_attr(&mut attrs, "channel-id", key);
        push_attr(&mut attrs, "group-title", group_title);
        push_attr(&mut attrs, "channel-number", &number);
        push_attr(&mut attrs, "tvg-chno", &number);
        push_attr(&mut attrs, "tvg-logo", &channel.logo);

        m3u.push_str("#EXTINF:-1 ");
        m3u.push_str(&attrs.join(" "));
        m3u.push(',');
        m3u.push_str(&escape_title(&channel.name));
        m3u.push('\n');
        m3u.push_str(&target.stream_url(key));
        m3u.push_str("\n\n");
    }

    let registrations: Vec<Registration> = keyed
        .iter()
        .map(|(key, c)| Registration {
            id: &c.id,
            key,
            number: c.number,
            name: &c.name,
            url: GUIDE_URL,
            profile: PROFILE,
            channel_selector: &c.id,
        })
        .collect();
    let mut json = serde_json::to_vec_pretty(&registrations)?;
    json.push(b'\n');

    Ok((m3u.into_bytes(), json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn channel(id: &str, ccid: &str, name: &str, number: Option<u32>) -> Channel {
        Channel {
            id: id.to_string(),
            xmltv_id: format!("dtv-{}", id),
            ccid: ccid.to_string(),
            number,
            source_number: None,
            name: name.to_string(),
            call_sign: None,
            logo: String::new(),
            stream_url: "dtvnow://x".to_string(),
            deeplink: None,
            manifest_url: None,
            fallback_url: None,
            playable: false,
        }
    }

    fn target() -> PrismcastTarget {
        PrismcastTarget {
            host: "192.168.1.20".to_string(),
            port: 5589,
        }
    }

    #[test]
    fn test_channel_key() {
        assert_eq!(channel_key("ESPN 2 (HD)"), "espn-2-hd");
        assert_eq!(channel_key("  A&E  "), "a-e");
        assert_eq!(channel_key("---"), "");
    }

    #[test]
    fn test_duplicate_keys_get_ccid() {
        let channels = vec![
            channel("r1", "206", "ESPN", Some(206)),
            channel("r2", "207", "espn", None),
        ];
        let (m3u, json) = render_enriched(&channels, &target(), "DirecTV Stream").unwrap();
        let m3u = String::from_utf8(m3u).unwrap();

        assert!(m3u.contains("http://192.168.1.20:5589/hls/espn/stream.m3u8"));
        assert!(m3u.contains("http://192.168.1.20:5589/hls/espn-207/stream.m3u8"));
        assert!(m3u.contains(r#"channel-number="206" tvg-chno="206""#));

        let value: Value = serde_json::from_slice(&json).unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["key"], "espn-207");
        assert_eq!(entries[1]["channelSelector"], "r2");
        assert_eq!(entries[0]["profile"], "directvStream");
        assert_eq!(entries[0]["url"], GUIDE_URL);
        assert_eq!(entries[1]["number"], Value::Null);
    }

    #[test]
    fn test_skips_empty_keys_and_fails_when_nothing_left() {
        let channels = vec![channel("r1", "1", "***", None), channel("r2", "2", "Fox", None)];
        let (m3u, _) = render_enriched(&channels, &target(), "G").unwrap();
        let m3u = String::from_utf8(m3u).unwrap();
        assert_eq!(m3u.matches("#EXTINF").count(), 1);

        let none = render_enriched(&channels[..1], &target(), "G");
        assert!(matches!(none, Err(EnrichError::NoChannels)));
    }
}
