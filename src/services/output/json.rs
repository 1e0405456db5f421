use serde::Serialize;

use crate::error::PipelineError;
use crate::models::Channel;

/// One entry of dtv_channels.json
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelRecord<'a> {
    id: &'a str,
    xmltv_id: &'a str,
    number: Option<u32>,
    source_number: Option<&'a str>,
    name: &'a str,
    #[serde(rename = "callsign")]
    call_sign: Option<&'a str>,
    ccid: &'a str,
    logo: &'a str,
    stream_url: &'a str,
    deeplink: Option<&'a str>,
    manifest_url: Option<&'a str>,
    fallback_url: Option<&'a str>,
    playable: bool,
}

impl<'a> From<&'a Channel> for ChannelRecord<'a> {
    fn from(c: &'a Channel) -> Self {
        Self {
            id: &c.id,
            xmltv_id: &c.xmltv_id,
            number: c.number,
            source_number: c.source_number.as_deref(),
            name: &c.name,
            call_sign: c.call_sign.as_deref(),
            ccid: &c.ccid,
            logo: &c.logo,
            stream_url: &c.stream_url,
            deeplink: c.deeplink.as_deref(),
            manifest_url: c.manifest_url.as_deref(),
            fallback_url: c.fallback_url.as_deref(),
            playable: c.playable,
        }
    }
}

/// Pretty JSON array of every channel in order
pub fn render_json(channels: &[Channel]) -> Result<Vec<u8>, PipelineError> {
    let records: Vec<ChannelRecord> = channels.iter().map(ChannelRecord::from).collect();
    let mut bytes = serde_json::to_vec_pretty(&records)
        .map_err(|e| PipelineError::Render(format!("channels json: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}
