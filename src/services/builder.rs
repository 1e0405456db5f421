//! Canonical model builder
//!
//! Pure and deterministic: turns raw lineup, schedule and playback data into
//! the ordered channel and programme lists every output format renders.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::models::{
    Channel, Model, PlaybackInfo, Program, RawChannel, RawProgram, StreamUrlMode,
};

const LOGO_BASE: &str = "https://dfwfis.prod.dtvcdn.com/catalog/image/imageserver/v1/service/channel";
const DEEPLINK_BASE: &str = "dtvnow://deeplink.directvnow.com/play/channel";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub stream_url_mode: StreamUrlMode,
    /// 0 keeps provider numbers
    pub chno_start: u32,
    pub xmltv_id_prefix: String,
}

impl BuildOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_url_mode: config.stream_url_mode,
            chno_start: config.chno_start,
            xmltv_id_prefix: config.xmltv_id_prefix.clone(),
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            stream_url_mode: StreamUrlMode::Deeplink,
            chno_start: 0,
            xmltv_id_prefix: "dtv-".to_string(),
        }
    }
}

pub fn channel_logo_url(resource_id: &str) -> String {
    format!("{}/{}/chlogo-clb-guide/120/90", LOGO_BASE, resource_id)
}

pub fn deeplink_url(call_sign: &str, resource_id: &str) -> String {
    format!("{}/{}/{}", DEEPLINK_BASE, call_sign, resource_id)
}

/// Numeric value of a provider channel number such as "836.0"
pub fn parse_channel_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn select_stream(
    mode: StreamUrlMode,
    deeplink: Option<&str>,
    playback: Option<&PlaybackInfo>,
) -> Option<String> {
    let manifest = playback.and_then(|p| non_empty(&p.manifest_url));
    let fallback = playback.and_then(|p| non_empty(&p.fallback_url));
    let chosen = match mode {
        StreamUrlMode::Deeplink => deeplink,
        StreamUrlMode::Manifest => manifest,
        StreamUrlMode::Fallback => fallback,
        StreamUrlMode::Best => manifest.or(fallback).or(deeplink),
    };
    chosen.map(String::from)
}

/// Build the canonical model.
///
/// `excluded` holds resource ids whose guide could not be fetched; they are
/// removed from every output.
pub fn build(
    raw_channels: &[RawChannel],
    raw_programs: &[RawProgram],
    playback: &HashMap<String, PlaybackInfo>,
    excluded: &HashSet<String>,
    opts: &BuildOptions,
) -> Model {
    let mut warnings = Vec::new();

    let mut seen = HashSet::new();
    let mut missing_rid = 0usize;
    let mut no_stream = 0usize;
    let mut staged: Vec<(Option<f64>, Channel)> = Vec::with_capacity(raw_channels.len());

    for raw in raw_channels {
        let id = match non_empty(&raw.resource_id) {
            Some(id) => id.to_string(),
            None => {
                missing_rid += 1;
                continue;
            }
        };
        if !seen.insert(id.clone()) || excluded.contains(&id) {
            continue;
        }

        let call_sign = non_empty(&raw.call_sign).map(String::from);
        let name = non_empty(&raw.name)
            .map(String::from)
            .or_else(|| call_sign.clone())
            .or_else(|| (!raw.ccid.is_empty()).then(|| format!("DTV {}", raw.ccid)))
            .unwrap_or_else(|| id.clone());
        let logo = non_empty(&raw.logo_url)
            .map(String::from)
            .unwrap_or_else(|| channel_logo_url(&id));
        let deeplink = call_sign.as_deref().map(|cs| deeplink_url(cs, &id));

        let probe = playback.get(&raw.ccid);
        let stream_url = match select_stream(opts.stream_url_mode, deeplink.as_deref(), probe) {
            Some(url) => url,
            None => {
                no_stream += 1;
                continue;
            }
        };

        let source_number = non_empty(&raw.number).map(String::from);
        let numeric = source_number.as_deref().and_then(parse_channel_number);

        staged.push((
            numeric,
            Channel {
                xmltv_id: format!("{}{}", opts.xmltv_id_prefix, id),
                id,
                ccid: raw.ccid.clone(),
                number: numeric.map(|n| n.round() as u32),
                source_number,
                name,
                call_sign,
                logo,
                stream_url,
                deeplink,
                manifest_url: probe.and_then(|p| non_empty(&p.manifest_url)).map(String::from),
                fallback_url: probe.and_then(|p| non_empty(&p.fallback_url)).map(String::from),
                playable: probe.map_or(false, |p| p.playable),
            },
        ));
    }

    if missing_rid > 0 {
        warnings.push(format!("{} lineup rows without resource id dropped", missing_rid));
    }
    if no_stream > 0 {
        warnings.push(format!(
            "{} channels without a {} stream reference dropped",
            no_stream, opts.stream_url_mode
        ));
    }

    // Ascending number, ties by id, unnumbered last
    staged.sort_by(|(na, a), (nb, b)| {
        let by_number = match (na, nb) {
            (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_number.then_with(|| a.id.cmp(&b.id))
    });

    let mut channels: Vec<Channel> = staged.into_iter().map(|(_, c)| c).collect();
    if opts.chno_start > 0 {
        for (i, channel) in channels.iter_mut().enumerate() {
            channel.number = Some(opts.chno_start + i as u32);
        }
    }

    let programs = build_programs(&channels, raw_programs, &mut warnings);

    Model {
        channels,
        programs,
        warnings,
    }
}

fn build_programs(
    channels: &[Channel],
    raw_programs: &[RawProgram],
    warnings: &mut Vec<String>,
) -> Vec<Program> {
    let position: HashMap<&str, usize> = channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();

    let mut unknown = 0usize;
    let mut invalid = 0usize;
    let mut duplicate = 0usize;
    let mut seen_ids = HashSet::new();
    let mut staged: Vec<(usize, Program)> = Vec::with_capacity(raw_programs.len());

    for raw in raw_programs {
        let pos = match position.get(raw.channel_id.as_str()) {
            Some(p) => *p,
            None => {
                unknown += 1;
                continue;
            }
        };
        if raw.start >= raw.end {
            invalid += 1;
            continue;
        }
        if let Some(sid) = non_empty(&raw.schedule_id) {
            if !seen_ids.insert(sid.to_string()) {
                duplicate += 1;
                continue;
            }
        }

        let title = non_empty(&raw.title)
            .map(String::from)
            .unwrap_or_else(|| channels[pos].name.clone());

        staged.push((
            pos,
            Program {
                channel_id: raw.channel_id.clone(),
                start: raw.start,
                end: raw.end,
                title,
                sub_title: non_empty(&raw.sub_title).map(String::from),
                description: non_empty(&raw.description).map(String::from),
                categories: raw.categories.clone(),
                season: raw.season,
                episode: raw.episode,
                tms_id: non_empty(&raw.tms_id).map(String::from),
                icon: non_empty(&raw.icon).map(String::from),
            },
        ));
    }

    // Stable: equal (channel, start) keep fetch order, so the first seen wins
    staged.sort_by_key(|(pos, p)| (*pos, p.start));

    let mut trimmed = 0usize;
    let mut overlapped = 0usize;
    let mut out: Vec<Program> = Vec::with_capacity(staged.len());
    let mut last: Option<(usize, chrono::DateTime<chrono::Utc>)> = None;

    for (pos, mut program) in staged {
        if let Some((last_pos, last_end)) = last {
            if last_pos == pos && program.start < last_end {
                if program.end <= last_end {
                    overlapped += 1;
                    continue;
                }
                program.start = last_end;
                trimmed += 1;
            }
        }
        last = Some((pos, program.end));
        out.push(program);
    }

    if unknown > 0 {
        warnings.push(format!("{} programmes for unknown channels dropped", unknown));
    }
    if invalid > 0 {
        warnings.push(format!("{} programmes with start >= end dropped", invalid));
    }
    if duplicate > 0 {
        warnings.push(format!("{} duplicate programmes dropped", duplicate));
    }
    if overlapped > 0 || trimmed > 0 {
        warnings.push(format!(
            "{} overlapping programmes dropped, {} trimmed",
            overlapped, trimmed
        ));
    }

    out
}
