//! Prometheus counters for the session engine.

use anyhow::{Context, Result};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::sessions::SessionStatus;

/// Frame outcomes counted by `streamkeep_frames_total`.
pub mod outcome {
    pub const APPLIED: &str = "applied";
    pub const IGNORED: &str = "ignored";
    pub const MALFORMED: &str = "malformed";
    pub const UNKNOWN: &str = "unknown";
    pub const STALE: &str = "stale";
    pub const REJECTED_TERMINAL: &str = "rejected_terminal";
    pub const RESOLUTION_FAILED: &str = "resolution_failed";
}

pub struct EngineMetrics {
    registry: Registry,
    frames: IntCounterVec,
    finished: IntCounterVec,
    open_handles: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames = IntCounterVec::new(
            Opts::new("streamkeep_frames_total", "Inbound frames by pipeline outcome"),
            &["outcome"],
        )?;
        let finished = IntCounterVec::new(
            Opts::new(
                "streamkeep_sessions_finished_total",
                "Sessions that reached a terminal status",
            ),
            &["status"],
        )?;
        let open_handles = IntGauge::new("streamkeep_open_handles", "Currently open stream handles")?;

        registry
            .register(Box::new(frames.clone()))
            .context("failed to register frames counter")?;
        registry
            .register(Box::new(finished.clone()))
            .context("failed to register finished counter")?;
        registry
            .register(Box::new(open_handles.clone()))
            .context("failed to register open handles gauge")?;

        Ok(Self {
            registry,
            frames,
            finished,
            open_handles,
        })
    }

    pub fn frame(&self, outcome: &str) {
        self.frames.with_label_values(&[outcome]).inc();
    }

    pub fn session_finished(&self, status: SessionStatus) {
        self.finished.with_label_values(&[status.as_str()]).inc();
    }

    pub fn set_open_handles(&self, count: usize) {
        self.open_handles
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn frames_total(&self, outcome: &str) -> u64 {
        self.frames.with_label_values(&[outcome]).get()
    }

    pub fn finished_total(&self, status: SessionStatus) -> u64 {
        self.finished.with_label_values(&[status.as_str()]).get()
    }

    pub fn open_handles(&self) -> i64 {
        self.open_handles.get()
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .context("failed to encode metrics")
    }
}
