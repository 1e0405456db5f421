//! Lineup, playback and guide fetching on top of the session manager

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::client::{Endpoint, ProviderApi};
use super::payload::{covers_batch, parse_lineup, parse_playback, parse_schedule};
use crate::config::Config;
use crate::error::{FetchError, PipelineError};
use crate::models::{PlaybackInfo, RawChannel, RawProgram, SessionArtifact};
use crate::services::session::SessionManager;

/// Guide fetch sizing
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub days: u32,
    pub window_hours: u32,
    pub max_channels: usize,
    pub min_ratio: f64,
    pub concurrency: usize,
}

impl FetchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            days: config.guide_days,
            window_hours: config.guide_window_hours,
            max_channels: config.guide_max_channels.max(1),
            min_ratio: config.guide_min_ratio,
            concurrency: config.fetch_concurrency.max(1),
        }
    }
}

/// Result of fetching the guide for a set of channels
#[derive(Debug, Default)]
pub struct GuideFetch {
    pub programs: Vec<RawProgram>,
    /// Channels whose schedule could not be fetched this cycle
    pub excluded: HashSet<String>,
    pub warnings: Vec<String>,
    pub requests: usize,
    pub fallbacks: usize,
}

struct ChunkJob {
    window: usize,
    batch: usize,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    channel_ids: Vec<String>,
}

struct ChunkResult {
    window: usize,
    batch: usize,
    programs: Vec<RawProgram>,
    failed: Vec<(String, String)>,
    requests: usize,
    fallback: bool,
}

pub struct GuideFetcher {
    api: Arc<dyn ProviderApi>,
    sessions: Arc<SessionManager>,
    opts: FetchOptions,
}

impl GuideFetcher {
    pub fn new(api: Arc<dyn ProviderApi>, sessions: Arc<SessionManager>, opts: FetchOptions) -> Self {
        Self { api, sessions, opts }
    }

    /// One authenticated call. A rejected session is reported, replaced, and
    /// the call retried exactly once.
    async fn call<F>(&self, endpoint: Endpoint, build_query: F) -> Result<Value, PipelineError>
    where
        F: Fn(&SessionArtifact) -> Vec<(String, String)>,
    {
        let session = self.sessions.ensure_session().await?;
        match self.api.get_json(&session, endpoint, &build_query(&session)).await {
            Ok(v) => return Ok(v),
            Err(FetchError::Unauthorized(status)) => {
                tracing::warn!(endpoint = endpoint.label(), status, "Session rejected, re-authenticating");
                self.sessions.report_unauthorized(&session).await;
            }
            Err(e) => return Err(e.into()),
        }

        let session = self.sessions.ensure_session().await?;
        match self.api.get_json(&session, endpoint, &build_query(&session)).await {
            Ok(v) => Ok(v),
            Err(FetchError::Unauthorized(status)) => {
                self.sessions.report_unauthorized(&session).await;
                Err(PipelineError::AuthorizationExpired(format!(
                    "{} rejected a fresh session (HTTP {})",
                    endpoint.label(),
                    status
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch and normalize the channel lineup. Empty is an error.
    pub async fn fetch_lineup(&self) -> Result<Vec<RawChannel>, PipelineError> {
        let payload = self
            .call(Endpoint::AllChannels, |s| {
                vec![
                    ("sort".to_string(), "OrdCh%3DASC".to_string()),
                    ("clientContext".to_string(), s.client_context.clone()),
                ]
            })
            .await?;

        let channels = parse_lineup(&payload).ok_or_else(|| {
            PipelineError::UpstreamData("no channel list found in lineup payload".to_string())
        })?;
        if channels.is_empty() {
            return Err(PipelineError::UpstreamData("lineup is empty".to_string()));
        }

        let with_rid = channels.iter().filter(|c| c.resource_id.is_some()).count();
        tracing::info!(channels = channels.len(), with_resource_id = with_rid, "Lineup fetched");
        Ok(channels)
    }

    /// Probe playback authorization per channel.
    ///
    /// Every failure, a rejected request included, only marks that channel
    /// unplayable: playback rights are per channel, so a 401/403 here is an
    /// entitlement answer and not proof of an expired session. Only failing to
    /// obtain a session at all is returned as an error.
    pub async fn fetch_playback(
        &self,
        channels: &[RawChannel],
    ) -> Result<HashMap<String, PlaybackInfo>, PipelineError> {
        let session = self.sessions.ensure_session().await?;
        let ccids: Vec<String> = channels.iter().map(|c| c.ccid.clone()).collect();

        let results: Vec<(String, Result<Value, FetchError>)> = stream::iter(ccids)
            .map(|ccid| {
                let session = session.clone();
                async move {
                    let query = vec![
                        ("ccid".to_string(), ccid.clone()),
                        ("clientContext".to_string(), session.client_context.clone()),
                    ];
                    let result = self.api.get_json(&session, Endpoint::Playback, &query).await;
                    (ccid, result)
                }
            })
            .buffer_unordered(self.opts.concurrency)
            .collect()
            .await;

        let mut map = HashMap::with_capacity(results.len());
        for (ccid, result) in results {
            let info = match result {
                Ok(payload) => parse_playback(&payload),
                Err(FetchError::Unauthorized(status)) => {
                    tracing::debug!(ccid = %ccid, status, "Playback not authorized");
                    PlaybackInfo::unplayable(format!("not_authorized; HTTP {}", status))
                }
                Err(e) => PlaybackInfo::unplayable(format!("request_failed; {}", e)),
            };
            map.insert(ccid, info);
        }

        let playable = map.values().filter(|p| p.playable).count();
        tracing::info!(probed = map.len(), playable, "Playback probe finished");
        Ok(map)
    }

    fn schedule_query(
        session: &SessionArtifact,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        channel_ids: &[String],
    ) -> Vec<(String, String)> {
        let mut query = vec![
            ("startTime".to_string(), start.timestamp_millis().to_string()),
            ("endTime".to_string(), end.timestamp_millis().to_string()),
            ("include4K".to_string(), "false".to_string()),
            ("is4KCompatible".to_string(), "false".to_string()),
            ("clientContext".to_string(), session.client_context.clone()),
        ];
        query.extend(channel_ids.iter().map(|id| ("channelIds".to_string(), id.clone())));
        if !session.fis_properties.is_empty() {
            query.push(("fisProperties".to_string(), session.fis_properties.clone()));
        }
        query
    }

    async fn fetch_schedule(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        channel_ids: &[String],
    ) -> Result<Value, PipelineError> {
        self.call(Endpoint::Schedule, |s| Self::schedule_query(s, start, end, channel_ids))
            .await
    }

    async fn fetch_chunk(&self, job: ChunkJob) -> Result<ChunkResult, PipelineError> {
        let mut result = ChunkResult {
            window: job.window,
            batch: job.batch,
            programs: Vec::new(),
            failed: Vec::new(),
            requests: 1,
            fallback: false,
        };
        let single = job.channel_ids.len() == 1;

        match self.fetch_schedule(job.start, job.end, &job.channel_ids).await {
            Ok(payload) if single || covers_batch(&payload, &job.channel_ids, self.opts.min_ratio) => {
                let default_channel = if single { job.channel_ids.first().map(String::as_str) } else { None };
                result.programs = parse_schedule(&payload, default_channel);
                return Ok(result);
            }
            Ok(_) => {
                tracing::debug!(window = job.window, batch = job.batch, "Partial batch response, falling back to per-channel");
            }
            Err(e) if e.is_auth() => return Err(e),
            Err(e) if single => {
                result.failed.push((job.channel_ids[0].clone(), e.to_string()));
                return Ok(result);
            }
            Err(e) => {
                tracing::debug!(window = job.window, batch = job.batch, "Batch request failed ({}), falling back to per-channel", e);
            }
        }

        result.fallback = true;
        for id in &job.channel_ids {
            result.requests += 1;
            match self.fetch_schedule(job.start, job.end, std::slice::from_ref(id)).await {
                Ok(payload) => result.programs.extend(parse_schedule(&payload, Some(id))),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => result.failed.push((id.clone(), e.to_string())),
            }
        }
        Ok(result)
    }

    /// Fetch `days` of schedule starting at `start` for `channel_ids`
    /// (provider resource ids).
    pub async fn fetch_guide(
        &self,
        channel_ids: &[String],
        start: DateTime<Utc>,
    ) -> Result<GuideFetch, PipelineError> {
        let end = start + ChronoDuration::days(self.opts.days as i64);
        let window = ChronoDuration::hours(self.opts.window_hours.max(1) as i64);

        let mut jobs = Vec::new();
        let mut window_start = start;
        let mut window_index = 0;
        while window_start < end {
            let window_end = (window_start + window).min(end);
            for (batch_index, batch) in channel_ids.chunks(self.opts.max_channels).enumerate() {
                jobs.push(ChunkJob {
                    window: window_index,
                    batch: batch_index,
                    start: window_start,
                    end: window_end,
                    channel_ids: batch.to_vec(),
                });
            }
            window_start = window_end;
            window_index += 1;
        }

        tracing::info!(
            channels = channel_ids.len(),
            windows = window_index,
            chunks = jobs.len(),
            "Fetching guide"
        );

        let results: Vec<Result<ChunkResult, PipelineError>> = stream::iter(jobs)
            .map(|job| self.fetch_chunk(job))
            .buffer_unordered(self.opts.concurrency)
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(results.len());
        for r in results {
            chunks.push(r?);
        }
        // Reassemble in (window, batch) order regardless of completion order
        chunks.sort_by_key(|c| (c.window, c.batch));

        let mut fetch = GuideFetch::default();
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        for chunk in chunks {
            fetch.requests += chunk.requests;
            if chunk.fallback {
                fetch.fallbacks += 1;
            }
            fetch.programs.extend(chunk.programs);
            for (id, err) in chunk.failed {
                failures.entry(id).or_insert(err);
            }
        }

        for (id, err) in failures {
            tracing::warn!(channel = %id, "Guide fetch failed, channel excluded: {}", err);
            fetch.warnings.push(format!("guide fetch failed for channel {}: {}", id, err));
            fetch.excluded.insert(id);
        }

        tracing::info!(
            programs = fetch.programs.len(),
            requests = fetch.requests,
            fallbacks = fetch.fallbacks,
            excluded = fetch.excluded.len(),
            "Guide fetched"
        );
        Ok(fetch)
    }
}
