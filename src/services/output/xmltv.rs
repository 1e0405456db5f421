//! XMLTV guide rendering

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use quick_xml::escape::escape;

use crate::error::PipelineError;
use crate::models::{Channel, Program};
use crate::services::session::browser::GUIDE_URL;

const GENERATOR: &str = "dtv-guide-server";
const SOURCE_NAME: &str = "DirecTV Stream";
const MAX_CATEGORIES: usize = 6;

fn xmltv_time(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y%m%d%H%M%S %z").to_string()
}

/// Reject models that would produce an inconsistent guide
fn validate(channels: &[Channel], programs: &[Program]) -> Result<(), PipelineError> {
    let mut xmltv_ids = HashSet::with_capacity(channels.len());
    let mut by_id = HashMap::with_capacity(channels.len());
    for channel in channels {
        if !xmltv_ids.insert(channel.xmltv_id.as_str()) {
            return Err(PipelineError::Render(format!(
                "duplicate channel id {}",
                channel.xmltv_id
            )));
        }
        by_id.insert(channel.id.as_str(), channel.xmltv_id.as_str());
    }

    let mut last_end: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for program in programs {
        if !by_id.contains_key(program.channel_id.as_str()) {
            return Err(PipelineError::Render(format!(
                "programme references unknown channel {}",
                program.channel_id
            )));
        }
        if program.start >= program.end {
            return Err(PipelineError::Render(format!(
                "programme {:?} on {} has start >= end",
                program.title, program.channel_id
            )));
        }
        if let Some(end) = last_end.get(program.channel_id.as_str()) {
            if program.start < *end {
                return Err(PipelineError::Render(format!(
                    "overlapping programmes on {} at {}",
                    program.channel_id, program.start
                )));
            }
        }
        last_end.insert(program.channel_id.as_str(), program.end);
    }
    Ok(())
}

/// `{season-1}.{episode-1}.` with a missing side rendered as 0
fn xmltv_ns(season: Option<u32>, episode: Option<u32>) -> Option<String> {
    if season.is_none() && episode.is_none() {
        return None;
    }
    let s = season.map_or(0, |s| s.saturating_sub(1));
    let e = episode.map_or(0, |e| e.saturating_sub(1));
    Some(format!("{}.{}.", s, e))
}

/// Render the XMLTV document.
///
/// Programmes must be ordered by channel then start, as the model builder
/// emits them. Output contains no generation timestamp, so equal input
/// yields equal bytes.
pub fn render_xmltv(
    channels: &[Channel],
    programs: &[Program],
    tz: Tz,
) -> Result<Vec<u8>, PipelineError> {
    validate(channels, programs)?;

    let xmltv_ids: HashMap<&str, &str> = channels
        .iter()
        .map(|c| (c.id.as_str(), c.xmltv_id.as_str()))
        .collect();

    // Rough size: a channel block is ~300 bytes, a programme ~600
    let mut out = String::with_capacity(channels.len() * 300 + programs.len() * 600 + 256);
    render_document(&mut out, channels, programs, &xmltv_ids, tz)
        .map_err(|e| PipelineError::Render(e.to_string()))?;

    Ok(out.into_bytes())
}

fn render_document(
    out: &mut String,
    channels: &[Channel],
    programs: &[Program],
    xmltv_ids: &HashMap<&str, &str>,
    tz: Tz,
) -> std::fmt::Result {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<tv generator-info-name="{}" source-info-name="{}" source-info-url="{}">"#,
        GENERATOR,
        escape(SOURCE_NAME),
        escape(GUIDE_URL)
    )?;

    for channel in channels {
        writeln!(out, r#"  <channel id="{}">"#, escape(channel.xmltv_id.as_str()))?;
        writeln!(
            out,
            "    <display-name>{}</display-name>",
            escape(channel.name.as_str())
        )?;
        if let Some(number) = channel.number {
            writeln!(
                out,
                r#"    <display-name type="number">{}</display-name>"#,
                number
            )?;
        }
        if let Some(call_sign) = &channel.call_sign {
            writeln!(
                out,
                r#"    <display-name type="callsign">{}</display-name>"#,
                escape(call_sign.as_str())
            )?;
        }
        if !channel.logo.is_empty() {
            writeln!(out, r#"    <icon src="{}" />"#, escape(channel.logo.as_str()))?;
        }
        writeln!(out, "  </channel>")?;
    }

    for program in programs {
        // validate() guarantees the lookup succeeds
        let channel = xmltv_ids
            .get(program.channel_id.as_str())
            .copied()
            .unwrap_or_default();

        writeln!(
            out,
            r#"  <programme start="{}" stop="{}" channel="{}">"#,
            xmltv_time(program.start, tz),
            xmltv_time(program.end, tz),
            escape(channel)
        )?;
        writeln!(out, "    <title>{}</title>", escape(program.title.as_str()))?;
        if let Some(sub) = &program.sub_title {
            writeln!(out, "    <sub-title>{}</sub-title>", escape(sub.as_str()))?;
        }
        if let Some(desc) = &program.description {
            writeln!(out, "    <desc>{}</desc>", escape(desc.as_str()))?;
        }
        if let Some(icon) = &program.icon {
            writeln!(out, r#"    <icon src="{}" />"#, escape(icon.as_str()))?;
        }
        for category in program.categories.iter().take(MAX_CATEGORIES) {
            writeln!(out, "    <category>{}</category>", escape(category.as_str()))?;
        }
        if let Some(ns) = xmltv_ns(program.season, program.episode) {
            writeln!(out, r#"    <episode-num system="xmltv_ns">{}</episode-num>"#, ns)?;
        }
        if let Some(tms) = &program.tms_id {
            writeln!(
                out,
                r#"    <episode-num system="tms">{}</episode-num>"#,
                escape(tms.as_str())
            )?;
        }
        writeln!(out, "  </programme>")?;
    }

    writeln!(out, "</tv>")
}
