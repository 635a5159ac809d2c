//! One connection attempt: state, queue, counters and the event channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use castwire_codec::{MediaFrame, MediaKind, StreamInfo};
use castwire_ipc::{ClientEvent, ConnectionState, FailureReason, InvalidTransition, TransportStatistics};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::mux::MuxedPacket;
use crate::queue::{PushOutcome, QueueItem, SendQueue};

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    video_frames_sent: AtomicU64,
    audio_frames_sent: AtomicU64,
    dropped_video_frames: AtomicU64,
    dropped_audio_frames: AtomicU64,
    timestamp_anomalies: AtomicU64,
}

pub(crate) struct Session {
    url: String,
    state: RwLock<ConnectionState>,
    events: Sender<ClientEvent>,
    queue: SendQueue,
    counters: Counters,
    keyframe_wanted: AtomicBool,
    shutdown: watch::Sender<bool>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(url: String, queue_capacity: usize, events: Sender<ClientEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            url,
            state: RwLock::new(ConnectionState::Idle),
            events,
            queue: SendQueue::new(queue_capacity),
            counters: Counters::default(),
            keyframe_wanted: AtomicBool::new(false),
            shutdown,
            sender: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Move to `next` and report it.
    pub fn transition(&self, next: ConnectionState) -> Result<(), InvalidTransition> {
        let previous = {
            let mut state = self.state.write();
            if !state.can_transition_to(&next) {
                return Err(InvalidTransition {
                    from: state.name(),
                    to: next.name(),
                });
            }
            std::mem::replace(&mut *state, next.clone())
        };
        debug!(from = previous.name(), to = next.name(), "State changed");

        let lifecycle = match &next {
            ConnectionState::Connecting => Some(ClientEvent::ConnectionStarted {
                url: self.url.clone(),
            }),
            ConnectionState::Ready => Some(ClientEvent::ConnectionSuccess),
            ConnectionState::Failed { reason } => Some(ClientEvent::ConnectionFailed {
                reason: reason.clone(),
            }),
            ConnectionState::Closed => Some(ClientEvent::Disconnected),
            _ => None,
        };
        self.emit(ClientEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(next),
        });
        if let Some(event) = lifecycle {
            self.emit(event);
        }
        Ok(())
    }

    /// Fail the session once; later calls and calls after close do nothing.
    pub fn fail(&self, reason: FailureReason) -> bool {
        let message = reason.message();
        match self.transition(ConnectionState::Failed { reason }) {
            Ok(()) => {
                error!(url = %self.url, reason = %message, "Session failed");
                self.signal_shutdown();
                true
            }
            Err(_) => {
                debug!(reason = %message, "Ignoring failure after session ended");
                false
            }
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => match event {
                ClientEvent::NewTimestamp { .. } | ClientEvent::NewBitrate { .. } => {
                    trace!("Event channel full, dropping progress event")
                }
                other => warn!(event = ?other, "Event channel full, dropping event"),
            },
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn enqueue(&self, frame: MediaFrame) {
        let kind = frame.kind;
        let keyframe = frame.is_keyframe;
        match self.queue.push(QueueItem::Frame(frame)) {
            PushOutcome::Queued => {
                if kind == MediaKind::Video && keyframe {
                    self.keyframe_wanted.store(false, Ordering::Relaxed);
                }
            }
            PushOutcome::Evicted(evicted) => {
                warn!(
                    kind = ?evicted.kind,
                    keyframe = evicted.keyframe,
                    capacity = self.queue.capacity(),
                    "Send queue full, evicted frame"
                );
                self.record_dropped(evicted.kind);
                if evicted.kind == MediaKind::Video {
                    self.request_keyframe();
                }
                if kind == MediaKind::Video && keyframe {
                    self.keyframe_wanted.store(false, Ordering::Relaxed);
                }
            }
            PushOutcome::Rejected => {
                warn!(?kind, "Send queue holds only reconfigurations, dropped frame");
                self.record_dropped(kind);
                if kind == MediaKind::Video {
                    self.request_keyframe();
                }
            }
            PushOutcome::Superseded => {}
            PushOutcome::Closed => self.record_dropped(kind),
        }
    }

    /// Emits `KeyframeRequested` on the first video drop since the last keyframe.
    fn request_keyframe(&self) {
        if !self.keyframe_wanted.swap(true, Ordering::Relaxed) {
            self.emit(ClientEvent::KeyframeRequested);
        }
    }

    pub fn enqueue_reconfigure(&self, kind: MediaKind, info: Arc<StreamInfo>) {
        if self.queue.push(QueueItem::Reconfigure { kind, info }) == PushOutcome::Superseded {
            debug!(?kind, "Replaced pending reconfiguration");
        }
    }

    pub fn record_written(&self, packet: &MuxedPacket, bytes: usize) {
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if packet.is_config() {
            return;
        }
        match packet.media_kind() {
            Some(MediaKind::Video) => self.counters.video_frames_sent.fetch_add(1, Ordering::Relaxed),
            Some(MediaKind::Audio) => self.counters.audio_frames_sent.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
    }

    pub fn record_control_bytes(&self, bytes: usize) {
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, kind: MediaKind) {
        self.record_dropped_many(kind, 1);
    }

    pub fn record_dropped_many(&self, kind: MediaKind, count: u64) {
        let counter = match kind {
            MediaKind::Video => &self.counters.dropped_video_frames,
            MediaKind::Audio => &self.counters.dropped_audio_frames,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_timestamp_anomalies(&self, count: u64) {
        self.counters
            .timestamp_anomalies
            .store(count, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> TransportStatistics {
        let c = &self.counters;
        TransportStatistics {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            video_frames_sent: c.video_frames_sent.load(Ordering::Relaxed),
            audio_frames_sent: c.audio_frames_sent.load(Ordering::Relaxed),
            dropped_video_frames: c.dropped_video_frames.load(Ordering::Relaxed),
            dropped_audio_frames: c.dropped_audio_frames.load(Ordering::Relaxed),
            timestamp_anomalies: c.timestamp_anomalies.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn set_sender(&self, handle: JoinHandle<()>) {
        *self.sender.lock() = Some(handle);
    }

    pub fn take_sender(&self) -> Option<JoinHandle<()>> {
        self.sender.lock().take()
    }

    /// Drop whatever is still queued and count it.
    pub fn discard_queue(&self) {
        let (video, audio) = self.queue.discard();
        if video + audio > 0 {
            warn!(video, audio, "Discarded queued frames on close");
        }
        self.record_dropped_many(MediaKind::Video, video);
        self.record_dropped_many(MediaKind::Audio, audio);
    }
}
