//! M3U playlist rendering

use crate::models::Channel;

/// Escape a value for a quoted EXTINF attribute
pub fn escape_attr(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n'], " ")
}

/// Display text after the comma; a newline would end the entry early
pub fn escape_title(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

pub(crate) fn push_attr(attrs: &mut Vec<String>, key: &str, value: &str) {
    if !value.is_empty() {
        attrs.push(format!(r#"{}="{}""#, key, escape_attr(value)));
    }
}

/// Render the playlist in channel order.
///
/// With `playable_only`, channels whose playback probe did not authorize
/// a stream are left out.
pub fn render_m3u(channels: &[Channel], group_title: &str, playable_only: bool) -> Vec<u8> {
    let mut out = String::with_capacity(64 + channels.len() * 400);
    out.push_str("#EXTM3U\n");

    for channel in channels.iter().filter(|c| !playable_only || c.playable) {
        let number = channel.number.map(|n| n.to_string()).unwrap_or_default();

        let mut attrs = Vec::with_capacity(10);
        push_attr(&mut attrs, "tvg-id", &channel.xmltv_id);
        push_attr(&mut attrs, "tvg-name", &channel.name);
        push_attr(&mut attrs, "tvg-logo", &channel.logo);
        push_attr(&mut attrs, "tvg-chno", &number);
        push_attr(&mut attrs, "group-title", group_title);
        push_attr(&mut attrs, "x-ccid", &channel.ccid);
        push_attr(&mut attrs, "x-resource-id", &channel.id);
        push_attr(&mut attrs, "x-callsign", channel.call_sign.as_deref().unwrap_or_default());
        push_attr(&mut attrs, "x-manifest-url", channel.manifest_url.as_deref().unwrap_or_default());
        push_attr(&mut attrs, "x-fallback-url", channel.fallback_url.as_deref().unwrap_or_default());

        out.push_str("#EXTINF:-1 ");
        out.push_str(&attrs.join(" "));
        out.push(',');
        out.push_str(&escape_title(&channel.name));
        out.push('\n');
        out.push_str(channel.stream_url.trim());
        out.push('\n');
    }

    out.into_bytes()
}
