//! Telemetry as message-passing rather than shared mutable fields (§5,
//! §9): each stage publishes small, immutable snapshots to the Status
//! Reporter over a dedicated channel, which sidesteps the torn-string
//! hazard the design notes call out entirely instead of relying on
//! careful atomics.

use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, Sender};

/// Overall Worker status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Draining,
    Finished,
    Broken,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Draining => "DRAINING",
            WorkerStatus::Finished => "FINISHED",
            WorkerStatus::Broken => "BROKEN",
        }
    }
}

/// Which of the three pipeline stages a telemetry event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Send,
    Transcode,
    Fetch,
}

/// A stage's own status (§3): idle, actively working on one filename, or
/// finished for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Idle,
    Active(String),
    Finished,
}

impl StageStatus {
    pub fn label(&self, kind: StageKind) -> &'static str {
        match (kind, self) {
            (StageKind::Send, StageStatus::Idle) => "IDLE",
            (StageKind::Send, StageStatus::Active(_)) => "SENDING",
            (StageKind::Send, StageStatus::Finished) => "FINISHED",
            (StageKind::Transcode, StageStatus::Idle) => "IDLE",
            (StageKind::Transcode, StageStatus::Active(_)) => "TRANSCODING",
            (StageKind::Transcode, StageStatus::Finished) => "FINISHED",
            (StageKind::Fetch, StageStatus::Idle) => "IDLE",
            (StageKind::Fetch, StageStatus::Active(_)) => "DOWNLOADING",
            (StageKind::Fetch, StageStatus::Finished) => "FINISHED",
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            StageStatus::Active(name) => Some(name),
            _ => None,
        }
    }
}

/// One update published by a Worker or one of its stages.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    WorkerStatus(WorkerStatus),
    StageStatus { stage: StageKind, status: StageStatus },
    TranscodeProgress { fps: f64, time_code: String, at: Instant },
    CopyProgress { percent: u32, eta: String },
    Processed,
    Retry,
    Produced(std::path::PathBuf),
}

/// A `(host, event)` message on the shared telemetry channel.
pub type TelemetryMessage = (String, TelemetryEvent);

/// Publishing half owned by one Worker and cloned into its stage threads.
#[derive(Clone)]
pub struct TelemetrySender {
    host: String,
    tx: Sender<TelemetryMessage>,
}

impl TelemetrySender {
    /// Binds a clone of the Dispatcher-owned channel sender to one host,
    /// so every stage thread of that Worker can publish through its own
    /// handle without re-stating the host each time.
    pub fn new(host: impl Into<String>, tx: Sender<TelemetryMessage>) -> Self {
        TelemetrySender { host: host.into(), tx }
    }

    pub fn send(&self, event: TelemetryEvent) {
        // The Status Reporter outliving every Worker is the only way this
        // send can fail, and a dropped telemetry sample is not worth
        // crashing a pipeline stage over.
        let _ = self.tx.send((self.host.clone(), event));
    }
}

/// Creates the single telemetry channel shared by every Worker of a run;
/// the Dispatcher holds the sender half to mint per-host
/// [`TelemetrySender`]s and the Status Reporter owns the receiver half.
pub fn channel() -> (Sender<TelemetryMessage>, Receiver<TelemetryMessage>) {
    unbounded()
}
