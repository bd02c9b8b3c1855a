//! In-process counters and gauges, reported by `/healthz`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::channel::ChannelKind;

#[derive(Default)]
struct ChannelGauges {
    open: AtomicI64,
    total: AtomicU64,
    buffered_bytes: AtomicI64,
    /// Sockets currently held above the high watermark.
    paused: AtomicI64,
    pauses: AtomicU64,
}

/// Daemon-wide metrics registry.
#[derive(Default)]
pub struct Metrics {
    control: ChannelGauges,
    terminal: ChannelGauges,
    desktop: ChannelGauges,
    auth_failures: AtomicU64,
    sessions_spawned: AtomicU64,
    sessions_exited: AtomicU64,
}

/// Point-in-time copy of one channel's gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub open: i64,
    pub total: u64,
    pub buffered_bytes: i64,
    pub paused: i64,
    pub pauses: u64,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub control: ChannelSnapshot,
    pub terminal: ChannelSnapshot,
    pub desktop: ChannelSnapshot,
    pub auth_failures: u64,
    pub sessions_spawned: u64,
    pub sessions_exited: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn gauges(&self, kind: ChannelKind) -> &ChannelGauges {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Terminal => &self.terminal,
            ChannelKind::Desktop => &self.desktop,
        }
    }

    pub fn connection_opened(&self, kind: ChannelKind) {
        let gauges = self.gauges(kind);
        gauges.open.fetch_add(1, Ordering::Relaxed);
        gauges.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, kind: ChannelKind) {
        self.gauges(kind).open.fetch_sub(1, Ordering::Relaxed);
    }

    /// Adjusts the buffered-bytes gauge by `delta`.
    pub fn buffered(&self, kind: ChannelKind, delta: i64) {
        self.gauges(kind)
            .buffered_bytes
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// A socket crossed its high watermark and stopped reading its source.
    pub fn flow_paused(&self, kind: ChannelKind) {
        let gauges = self.gauges(kind);
        gauges.paused.fetch_add(1, Ordering::Relaxed);
        gauges.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_resumed(&self, kind: ChannelKind) {
        self.gauges(kind).paused.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_spawned(&self) {
        self.sessions_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_exited(&self) {
        self.sessions_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let channel = |g: &ChannelGauges| ChannelSnapshot {
            open: g.open.load(Ordering::Relaxed),
            total: g.total.load(Ordering::Relaxed),
            buffered_bytes: g.buffered_bytes.load(Ordering::Relaxed),
            paused: g.paused.load(Ordering::Relaxed),
            pauses: g.pauses.load(Ordering::Relaxed),
        };
        MetricsSnapshot {
            control: channel(&self.control),
            terminal: channel(&self.terminal),
            desktop: channel(&self.desktop),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            sessions_spawned: self.sessions_spawned.load(Ordering::Relaxed),
            sessions_exited: self.sessions_exited.load(Ordering::Relaxed),
        }
    }
}
