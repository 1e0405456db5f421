//! Output generation: XMLTV, M3U, JSON and the PrismCast enrichment pair
//!
//! Every renderer is a pure function from the canonical model to bytes. The
//! orchestrator renders everything in memory, then hands the set to
//! [`publish::publish_all`].

pub mod enrich;
pub mod json;
pub mod m3u;
pub mod publish;
pub mod xmltv;

use chrono_tz::Tz;

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::Model;

pub use enrich::PrismcastTarget;
pub use publish::{publish_all, write_atomic, ArtifactWriter};

pub const XMLTV_FILE: &str = "dtv_epg.xml";
pub const M3U_FILE: &str = "dtv_channels.m3u";
pub const JSON_FILE: &str = "dtv_channels.json";
pub const PRISMCAST_M3U_FILE: &str = "prismcast_enriched.m3u";
pub const PRISMCAST_JSON_FILE: &str = "prismcast_channels.json";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub tz: Tz,
    pub group_title: String,
    pub playable_only: bool,
    pub prismcast: Option<PrismcastTarget>,
}

impl RenderOptions {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let tz = config
            .output_tz()
            .map_err(|e| PipelineError::Render(e.to_string()))?;
        let prismcast = config
            .prismcast_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|host| PrismcastTarget {
                host: host.to_string(),
                port: config.prismcast_port,
            });

        Ok(Self {
            tz,
            group_title: config.group_title.clone(),
            playable_only: config.m3u_playable_only,
            prismcast,
        })
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            group_title: "DirecTV Stream".to_string(),
            playable_only: false,
            prismcast: None,
        }
    }
}

/// Artifacts rendered for one cycle, in publish order
#[derive(Debug, Default)]
pub struct RenderedSet {
    pub artifacts: Vec<(String, Vec<u8>)>,
    /// Enrichment problems; they never block the primary artifacts
    pub enrichment_errors: Vec<String>,
}

/// Render every artifact for `model`.
///
/// Fails only when a primary artifact cannot be rendered.
pub fn render_all(model: &Model, opts: &RenderOptions) -> Result<RenderedSet, PipelineError> {
    let mut set = RenderedSet::default();

    let xml = xmltv::render_xmltv(&model.channels, &model.programs, opts.tz)?;
    set.artifacts.push((XMLTV_FILE.to_string(), xml));
    set.artifacts.push((
        M3U_FILE.to_string(),
        m3u::render_m3u(&model.channels, &opts.group_title, opts.playable_only),
    ));
    set.artifacts
        .push((JSON_FILE.to_string(), json::render_json(&model.channels)?));

    if let Some(target) = &opts.prismcast {
        match enrich::render_enriched(&model.channels, target, &opts.group_title) {
            Ok((m3u, json)) => {
                set.artifacts.push((PRISMCAST_M3U_FILE.to_string(), m3u));
                set.artifacts.push((PRISMCAST_JSON_FILE.to_string(), json));
            }
            Err(e) => {
                tracing::warn!(error = %e, "PrismCast enrichment failed");
                set.enrichment_errors.push(e.to_string());
            }
        }
    }

    Ok(set)
}
