//! Single-flight refresh orchestrator
//!
//! One cycle: ensure session, fetch lineup, playback and guide, build the
//! model, render every artifact in memory, then publish. A failure anywhere
//! before publishing leaves the previous artifacts in place.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, DurationRound, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{
    RefreshOutcome, RefreshPhase, RefreshRecord, RefreshStatus, TriggerOutcome, TriggerSource,
};
use crate::services::builder::{self, BuildOptions};
use crate::services::history::RefreshHistory;
use crate::services::metrics;
use crate::services::output::{self, RenderOptions};
use crate::services::provider::GuideFetcher;
use crate::services::session::SessionManager;

/// Per-cycle settings derived from configuration
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub out_dir: PathBuf,
    pub build: BuildOptions,
    pub render: RenderOptions,
    pub playback_probe: bool,
    pub timeout: Duration,
}

impl RefreshSettings {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        Ok(Self {
            out_dir: config.out_dir.clone(),
            build: BuildOptions::from_config(config),
            render: RenderOptions::from_config(config)?,
            playback_probe: config.playback_probe,
            timeout: Duration::from_secs(config.refresh_timeout_secs.max(1)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RunningInfo {
    since: DateTime<Utc>,
    trigger: TriggerSource,
}

/// Holds the running flag for one cycle; dropping it returns to idle
struct RunGuard {
    orchestrator: Arc<RefreshOrchestrator>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut current) = self.orchestrator.current.write() {
            *current = None;
        }
        self.orchestrator.running.store(false, Ordering::Release);
    }
}

/// Successful cycle summary
struct CycleReport {
    channels: usize,
    programs: usize,
    warnings: Vec<String>,
    artifacts: Vec<String>,
    enrichment_failed: bool,
}

pub struct RefreshOrchestrator {
    sessions: Arc<SessionManager>,
    fetcher: GuideFetcher,
    history: RefreshHistory,
    settings: RefreshSettings,
    running: AtomicBool,
    current: RwLock<Option<RunningInfo>>,
}

impl RefreshOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        fetcher: GuideFetcher,
        history: RefreshHistory,
        settings: RefreshSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            fetcher,
            history,
            settings,
            running: AtomicBool::new(false),
            current: RwLock::new(None),
        })
    }

    fn try_begin(self: &Arc<Self>, trigger: TriggerSource) -> Option<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if let Ok(mut current) = self.current.write() {
            *current = Some(RunningInfo {
                since: Utc::now(),
                trigger,
            });
        }
        Some(RunGuard {
            orchestrator: self.clone(),
        })
    }

    /// Start a cycle in the background. Never queues: a trigger while a
    /// cycle runs is reported and dropped.
    pub fn trigger(self: &Arc<Self>, source: TriggerSource) -> TriggerOutcome {
        match self.try_begin(source) {
            Some(guard) => {
                self.spawn_cycle(guard, source);
                TriggerOutcome::Started
            }
            None => {
                tracing::info!(trigger = %source, "Refresh already running, trigger ignored");
                TriggerOutcome::AlreadyRunning
            }
        }
    }

    /// Drop the current session and start a cycle that logs in again.
    ///
    /// The run slot is claimed before the session is touched, so a cycle
    /// that is already running keeps its session.
    pub async fn reauthenticate(self: &Arc<Self>) -> Result<TriggerOutcome, PipelineError> {
        let source = TriggerSource::Reauthenticate;
        let guard = match self.try_begin(source) {
            Some(guard) => guard,
            None => {
                tracing::info!(trigger = %source, "Refresh already running, re-authentication ignored");
                return Ok(TriggerOutcome::AlreadyRunning);
            }
        };

        self.sessions.invalidate().await?;
        self.spawn_cycle(guard, source);
        Ok(TriggerOutcome::Started)
    }

    fn spawn_cycle(self: &Arc<Self>, guard: RunGuard, source: TriggerSource) {
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(guard, source).await;
        });
    }

    /// Run a cycle and wait for its record
    pub async fn run(self: &Arc<Self>, source: TriggerSource) -> Result<RefreshRecord, PipelineError> {
        let guard = self.try_begin(source).ok_or(PipelineError::AlreadyRunning)?;
        Ok(self.execute(guard, source).await)
    }

    pub async fn status(&self) -> RefreshStatus {
        let current = self.current.read().ok().and_then(|c| *c);
        let phase = if self.running.load(Ordering::Acquire) {
            RefreshPhase::Running
        } else {
            RefreshPhase::Idle
        };

        RefreshStatus {
            phase,
            running_since: current.map(|c| c.since),
            running_trigger: current.map(|c| c.trigger),
            last: self.history.last().await,
            last_success: self.history.last_success().await,
        }
    }

    /// Newest first
    pub async fn history(&self, limit: usize) -> Vec<RefreshRecord> {
        self.history.recent(limit).await
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn execute(&self, guard: RunGuard, trigger: TriggerSource) -> RefreshRecord {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(refresh_id = %id, trigger = %trigger, "Refresh started");

        let result = match tokio::time::timeout(self.settings.timeout, self.cycle()).await {
            Ok(r) => r,
            Err(_) => Err(PipelineError::Timeout(self.settings.timeout.as_secs())),
        };

        let elapsed = clock.elapsed();
        let mut record = RefreshRecord {
            id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            outcome: RefreshOutcome::Failed,
            error_kind: None,
            error: None,
            channels: 0,
            programs: 0,
            warnings: Vec::new(),
            artifacts: Vec::new(),
        };

        match result {
            Ok(report) => {
                record.outcome = if report.enrichment_failed {
                    RefreshOutcome::Partial
                } else {
                    RefreshOutcome::Succeeded
                };
                record.channels = report.channels;
                record.programs = report.programs;
                record.warnings = report.warnings;
                record.artifacts = report.artifacts;

                metrics::PUBLISHED_CHANNELS.set(record.channels as i64);
                metrics::PUBLISHED_PROGRAMS.set(record.programs as i64);
                tracing::info!(
                    refresh_id = %id,
                    outcome = %record.outcome,
                    channels = record.channels,
                    programs = record.programs,
                    warnings = record.warnings.len(),
                    duration_ms = record.duration_ms,
                    "Refresh finished"
                );
            }
            Err(e) => {
                record.error_kind = Some(e.kind().to_string());
                record.error = Some(e.to_string());
                tracing::error!(
                    refresh_id = %id,
                    error_kind = e.kind(),
                    duration_ms = record.duration_ms,
                    "Refresh failed: {}",
                    e
                );
            }
        }

        metrics::REFRESHES_TOTAL
            .with_label_values(&[record.outcome.to_string().as_str()])
            .inc();
        metrics::REFRESH_DURATION.observe(elapsed.as_secs_f64());

        self.history.push(record.clone()).await;
        drop(guard);
        record
    }

    async fn cycle(&self) -> Result<CycleReport, PipelineError> {
        self.sessions.ensure_session().await?;

        let lineup = self.fetcher.fetch_lineup().await?;

        let playback = if self.settings.playback_probe {
            self.fetcher.fetch_playback(&lineup).await?
        } else {
            Default::default()
        };

        let mut seen = HashSet::new();
        let resource_ids: Vec<String> = lineup
            .iter()
            .filter_map(|c| c.resource_id.clone())
            .filter(|rid| seen.insert(rid.clone()))
            .collect();

        // Start at the top of the hour so programmes airing now are included
        let now = Utc::now();
        let start = now
            .duration_trunc(chrono::Duration::hours(1))
            .unwrap_or(now);
        let guide = self.fetcher.fetch_guide(&resource_ids, start).await?;

        let model = builder::build(
            &lineup,
            &guide.programs,
            &playback,
            &guide.excluded,
            &self.settings.build,
        );
        if model.channels.is_empty() {
            return Err(PipelineError::UpstreamData(
                "no usable channels after building the model".to_string(),
            ));
        }

        // Everything is rendered before the first file is replaced
        let rendered = output::render_all(&model, &self.settings.render)?;

        let artifacts = output::publish_all(&self.settings.out_dir, &rendered.artifacts)
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))?;

        let mut warnings = guide.warnings;
        warnings.extend(model.warnings);
        warnings.extend(
            rendered
                .enrichment_errors
                .iter()
                .map(|e| format!("enrichment: {}", e)),
        );

        Ok(CycleReport {
            channels: model.channels.len(),
            programs: model.programs.len(),
            warnings,
            artifacts,
            enrichment_failed: !rendered.enrichment_errors.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::StreamUrlMode;
    use crate::services::output::PrismcastTarget;
    use crate::services::provider::fetcher::tests::{channel_ids, schedule_for, FakeApi};
    use crate::services::provider::{Endpoint, FetchOptions};
    use crate::services::session::tests::{manager, FakeDriver};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    fn lineup(names: [&str; 2]) -> serde_json::Value {
        json!({"channels": [
            {"ccid": "1", "channelNumber": "5", "callSign": "AAA", "channelName": names[0], "resourceId": "r1"},
            {"ccid": "2", "channelNumber": "4", "callSign": "BBB", "channelName": names[1], "resourceId": "r2"}
        ]})
    }

    fn settings(out_dir: &Path) -> RefreshSettings {
        RefreshSettings {
            out_dir: out_dir.to_path_buf(),
            build: BuildOptions {
                stream_url_mode: StreamUrlMode::Deeplink,
                ..BuildOptions::default()
            },
            render: RenderOptions::default(),
            playback_probe: true,
            timeout: Duration::from_secs(10),
        }
    }

    fn fetch_opts() -> FetchOptions {
        FetchOptions {
            days: 1,
            window_hours: 12,
            max_channels: 10,
            min_ratio: 0.75,
            concurrency: 2,
        }
    }

    async fn orchestrator_with(
        dir: &Path,
        driver: Arc<FakeDriver>,
        api: FakeApi,
        settings: RefreshSettings,
    ) -> Arc<RefreshOrchestrator> {
        let sessions = Arc::new(manager(dir, driver));
        let fetcher = GuideFetcher::new(Arc::new(api), sessions.clone(), fetch_opts());
        RefreshOrchestrator::new(
            sessions,
            fetcher,
            RefreshHistory::load(dir.join("history.ndjson"), 10).await,
            settings,
        )
    }

    /// Orchestrator over a fake provider; `fail_lineup` flips the lineup
    /// endpoint to a server error
    async fn orchestrator(
        dir: &Path,
        driver: FakeDriver,
        names: [&'static str; 2],
        fail_lineup: Arc<AtomicBool>,
        settings: RefreshSettings,
    ) -> Arc<RefreshOrchestrator> {
        let api = FakeApi::new(move |_, endpoint, query| match endpoint {
            Endpoint::AllChannels if fail_lineup.load(Ordering::SeqCst) => Err(FetchError::Http {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Endpoint::AllChannels => Ok(lineup(names)),
            Endpoint::Playback => Ok(json!({"playbackData": {"streamURL": "https://cdn/x.m3u8"}})),
            Endpoint::Schedule => Ok(schedule_for(query)),
        });
        orchestrator_with(dir, Arc::new(driver), api, settings).await
    }

    async fn wait_idle(orch: &Arc<RefreshOrchestrator>) {
        for _ in 0..200 {
            if orch.status().await.phase == RefreshPhase::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh did not finish");
    }

    #[tokio::test]
    async fn test_cycle_publishes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let orch = orchestrator(
            dir.path(),
            FakeDriver::new(),
            ["Alpha", "Beta"],
            Arc::new(AtomicBool::new(false)),
            settings(&out),
        ).await;

        let record = orch.run(TriggerSource::Manual).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Succeeded);
        assert_eq!(record.channels, 2);
        // Two windows of one programme per channel
        assert_eq!(record.programs, 4);
        assert_eq!(
            record.artifacts,
            vec!["dtv_epg.xml", "dtv_channels.m3u", "dtv_channels.json"]
        );

        let m3u = tokio::fs::read_to_string(out.join("dtv_channels.m3u")).await.unwrap();
        // Channel 4 sorts before channel 5
        let first = m3u.lines().nth(1).unwrap();
        assert!(first.contains(r#"tvg-id="dtv-r2""#));

        let status = orch.status().await;
        assert_eq!(status.phase, RefreshPhase::Idle);
        assert_eq!(status.last.unwrap().id, record.id);
        assert_eq!(orch.history(5).await.len(), 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver {
            delay: Duration::from_millis(200),
            ..FakeDriver::new()
        };
        let orch = orchestrator(
            dir.path(),
            driver,
            ["Alpha", "Beta"],
            Arc::new(AtomicBool::new(false)),
            settings(&dir.path().join("out")),
        ).await;

        assert_eq!(orch.trigger(TriggerSource::Scheduled), TriggerOutcome::Started);
        assert_eq!(orch.trigger(TriggerSource::Manual), TriggerOutcome::AlreadyRunning);
        assert!(matches!(
            orch.run(TriggerSource::Manual).await,
            Err(PipelineError::AlreadyRunning)
        ));

        let status = orch.status().await;
        assert_eq!(status.phase, RefreshPhase::Running);
        assert_eq!(status.running_trigger, Some(TriggerSource::Scheduled));

        wait_idle(&orch).await;
        let history = orch.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, TriggerSource::Scheduled);

        // Free again once the cycle ended
        assert_eq!(orch.trigger(TriggerSource::Manual), TriggerOutcome::Started);
        wait_idle(&orch).await;
    }

    #[tokio::test]
    async fn test_failure_leaves_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let fail = Arc::new(AtomicBool::new(false));
        let orch = orchestrator(dir.path(), FakeDriver::new(), ["Alpha", "Beta"], fail.clone(), settings(&out)).await;

        orch.run(TriggerSource::Manual).await.unwrap();
        let before = tokio::fs::read(out.join("dtv_epg.xml")).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let record = orch.run(TriggerSource::Manual).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("transient_network"));

        assert_eq!(tokio::fs::read(out.join("dtv_epg.xml")).await.unwrap(), before);
        let mut entries = tokio::fs::read_dir(&out).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
        }

        let status = orch.status().await;
        assert_eq!(status.last.unwrap().outcome, RefreshOutcome::Failed);
        assert_eq!(status.last_success.unwrap().outcome, RefreshOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_enrichment_failure_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut s = settings(&out);
        s.render.prismcast = Some(PrismcastTarget {
            host: "127.0.0.1".to_string(),
            port: 5589,
        });
        let orch = orchestrator(
            dir.path(),
            FakeDriver::new(),
            ["***", "+++"],
            Arc::new(AtomicBool::new(false)),
            s,
        ).await;

        let record = orch.run(TriggerSource::Manual).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Partial);
        assert!(record.warnings.iter().any(|w| w.starts_with("enrichment:")));
        assert!(out.join("dtv_channels.json").exists());
        assert!(!out.join("prismcast_enriched.m3u").exists());
    }

    #[tokio::test]
    async fn test_cycle_timeout_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver {
            delay: Duration::from_millis(500),
            ..FakeDriver::new()
        };
        let mut s = settings(&dir.path().join("out"));
        s.timeout = Duration::from_millis(50);
        let orch = orchestrator(dir.path(), driver, ["Alpha", "Beta"], Arc::new(AtomicBool::new(false)), s).await;

        let record = orch.run(TriggerSource::Startup).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("timeout"));
        assert_eq!(orch.status().await.phase, RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_one_channel_guide_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let api = FakeApi::new(|_, endpoint, query| match endpoint {
            Endpoint::AllChannels => Ok(lineup(["Alpha", "Beta"])),
            Endpoint::Playback => Ok(json!({"playbackData": {"streamURL": "https://cdn/x.m3u8"}})),
            Endpoint::Schedule if channel_ids(query).iter().any(|id| id == "r2") => Err(FetchError::Http {
                status: 500,
                body: "schedule unavailable".to_string(),
            }),
            Endpoint::Schedule => Ok(schedule_for(query)),
        });
        let orch = orchestrator_with(dir.path(), Arc::new(FakeDriver::new()), api, settings(&out)).await;

        let record = orch.run(TriggerSource::Manual).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Succeeded);
        assert_eq!(record.channels, 1);
        assert!(record.warnings.iter().any(|w| w.contains("r2")));

        let m3u = tokio::fs::read_to_string(out.join("dtv_channels.m3u")).await.unwrap();
        assert!(m3u.contains(r#"tvg-id="dtv-r1""#));
        assert!(!m3u.contains("dtv-r2"));
        let xml = tokio::fs::read_to_string(out.join("dtv_epg.xml")).await.unwrap();
        assert!(xml.contains(r#"channel="dtv-r1""#));
        assert!(!xml.contains("dtv-r2"));
    }

    #[tokio::test]
    async fn test_playback_rejection_does_not_fail_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let driver = Arc::new(FakeDriver::new());
        let api = FakeApi::new(|_, endpoint, query| match endpoint {
            Endpoint::AllChannels => Ok(lineup(["Alpha", "Beta"])),
            Endpoint::Playback if query.iter().any(|(k, v)| k == "ccid" && v == "2") => {
                Err(FetchError::Unauthorized(403))
            }
            Endpoint::Playback => Ok(json!({"playbackData": {"streamURL": "https://cdn/x.m3u8"}})),
            Endpoint::Schedule => Ok(schedule_for(query)),
        });
        let orch = orchestrator_with(dir.path(), driver.clone(), api, settings(&out)).await;

        let record = orch.run(TriggerSource::Manual).await.unwrap();
        assert_eq!(record.outcome, RefreshOutcome::Succeeded);
        assert_eq!(record.channels, 2);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reauthenticate_claims_run_before_invalidating() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver {
            delay: Duration::from_millis(200),
            ..FakeDriver::new()
        };
        let orch = orchestrator(
            dir.path(),
            driver,
            ["Alpha", "Beta"],
            Arc::new(AtomicBool::new(false)),
            settings(&dir.path().join("out")),
        ).await;

        orch.run(TriggerSource::Manual).await.unwrap();
        let before = orch.sessions().ensure_session().await.unwrap();

        assert_eq!(orch.trigger(TriggerSource::Scheduled), TriggerOutcome::Started);
        assert_eq!(orch.reauthenticate().await.unwrap(), TriggerOutcome::AlreadyRunning);
        // The running cycle keeps its session
        assert!(dir.path().join("session.json").exists());
        wait_idle(&orch).await;
        let still = orch.sessions().ensure_session().await.unwrap();
        assert_eq!(still.session_id, before.session_id);

        assert_eq!(orch.reauthenticate().await.unwrap(), TriggerOutcome::Started);
        wait_idle(&orch).await;
        let fresh = orch.sessions().ensure_session().await.unwrap();
        assert_ne!(fresh.session_id, before.session_id);
        assert_eq!(orch.history(1).await[0].trigger, TriggerSource::Reauthenticate);
    }
}
