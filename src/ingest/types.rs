use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::watch;

use super::error::IngestError;
use crate::config::ChannelConfig;
use crate::telemetry::{Measurement, RawFrame};
use crate::window::LiveWindow;

/// Ordered copy of the live window, newest last.
pub type Snapshot = Vec<Measurement>;

#[derive(Debug, Clone, PartialEq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum IngestMode {
    Idle,
    Running {
        port: String,
        baud: u32,
        started: NaiveDateTime,
    },
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestStatus {
    pub mode: IngestMode,
    pub last_measurement: Option<Measurement>,
    pub frames_received: u64,
    pub measurements_accepted: u64,
    pub frames_rejected: u64,
    pub storage_failures: u64,
    /// Why the previous session ended, when it was not a graceful stop.
    pub last_error: Option<String>,
}

impl Default for IngestStatus {
    fn default() -> Self {
        Self {
            mode: IngestMode::Idle,
            last_measurement: None,
            frames_received: 0,
            measurements_accepted: 0,
            frames_rejected: 0,
            storage_failures: 0,
            last_error: None,
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        port: String,
        baud: u32,
        replayed: usize,
    },
    /// Graceful end after `stop()`.
    Stopped,
    /// The byte stream failed; the service is back to idle.
    LinkLost { error: String },
    /// The measurement reached the live window but not the log.
    StorageWriteFailed {
        measurement: Measurement,
        error: String,
    },
}

/// Receiving ends handed to consumers when the service is built.
///
/// The ingestion loop never waits on a consumer:
/// - `frames` is bounded; a full queue drops the newest frame.
/// - `snapshots` holds only the latest window. A slow consumer skips straight
///   to the newest snapshot instead of draining stale ones.
/// - `events` is bounded with one extra slot per session held back for its
///   `Stopped` or `LinkLost`, so the end of a session is always delivered.
///   Other events are dropped when the queue is full.
pub struct Outputs {
    pub frames: mpsc::Receiver<RawFrame>,
    pub snapshots: watch::Receiver<Snapshot>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Queue slot reserved for the event that ends a session.
pub(crate) type EndSlot = Option<OwnedPermit<SessionEvent>>;

#[derive(Clone)]
pub(crate) struct Publishers {
    frames: mpsc::Sender<RawFrame>,
    snapshots: Arc<watch::Sender<Snapshot>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Publishers {
    pub(crate) fn channels(config: &ChannelConfig) -> (Self, Outputs) {
        let (frames_tx, frames_rx) = mpsc::channel(config.frames);
        let (snapshots_tx, snapshots_rx) = watch::channel(Snapshot::new());
        let (events_tx, events_rx) = mpsc::channel(config.events + 1);
        (
            Self {
                frames: frames_tx,
                snapshots: Arc::new(snapshots_tx),
                events: events_tx,
            },
            Outputs {
                frames: frames_rx,
                snapshots: snapshots_rx,
                events: events_rx,
            },
        )
    }

    pub(crate) fn frame(&self, frame: RawFrame) {
        if let Err(TrySendError::Full(frame)) = self.frames.try_send(frame) {
            debug!("Frame consumer lagging, dropped: {}", frame.text);
        }
    }

    /// Replaces the published snapshot. The window is only copied while
    /// someone is subscribed.
    pub(crate) fn snapshot(&self, window: &LiveWindow) {
        if !self.snapshots.is_closed() {
            self.snapshots.send_replace(window.snapshot());
        }
    }

    pub(crate) fn event(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("Event consumer lagging, dropped: {:?}", event);
        }
    }

    /// Holds back one queue slot for the end of a session. `Ok(None)` means
    /// nobody is listening for events.
    pub(crate) fn reserve_end(&self) -> Result<EndSlot, IngestError> {
        match self.events.clone().try_reserve_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(TrySendError::Closed(_)) => Ok(None),
            Err(TrySendError::Full(_)) => Err(IngestError::EventBacklog),
        }
    }

    pub(crate) fn end(slot: EndSlot, event: SessionEvent) {
        match slot {
            Some(permit) => {
                permit.send(event);
            }
            None => debug!("No event consumer for {:?}", event),
        }
    }
}
