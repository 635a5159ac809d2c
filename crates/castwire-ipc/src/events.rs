//! Events sent from a streaming client to the application.

use serde::{Deserialize, Serialize};

use crate::state::{ConnectionState, FailureReason};

/// Events a client emits over its event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// connect() began.
    ConnectionStarted {
        /// Destination URL with credentials removed.
        url: String,
    },

    /// Publishing was accepted.
    ConnectionSuccess,

    /// The session failed. Emitted once per session.
    ConnectionFailed { reason: FailureReason },

    /// The session closed after disconnect().
    Disconnected,

    /// A frame was written with this timestamp.
    NewTimestamp { timestamp_us: u64 },

    /// The server accepted our credentials.
    AuthSuccess,

    /// The server rejected our credentials.
    AuthError,

    /// Outgoing bitrate over the last second.
    NewBitrate { bits_per_second: u64 },

    /// A video frame was dropped; the encoder should emit a keyframe.
    KeyframeRequested,

    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<ConnectionState>,

        /// Current state.
        current: Box<ConnectionState>,
    },
}

impl ClientEvent {
    /// Forward this event to the matching observer callback.
    pub fn dispatch(&self, observer: &dyn ConnectionObserver) {
        match self {
            Self::ConnectionStarted { url } => observer.on_connection_started(url),
            Self::ConnectionSuccess => observer.on_connection_success(),
            Self::ConnectionFailed { reason } => observer.on_connection_failed(reason),
            Self::Disconnected => observer.on_disconnected(),
            Self::NewTimestamp { timestamp_us } => observer.on_new_timestamp(*timestamp_us),
            Self::AuthSuccess => observer.on_auth_success(),
            Self::AuthError => observer.on_auth_error(),
            Self::NewBitrate { bits_per_second } => observer.on_new_bitrate(*bits_per_second),
            Self::KeyframeRequested => observer.on_keyframe_requested(),
            Self::StateChanged { .. } => {}
        }
    }
}

/// Callback view of [`ClientEvent`]s.
///
/// All methods default to doing nothing so observers only implement what
/// they care about. Callbacks run on whichever thread drains the channel.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_started(&self, _url: &str) {}
    fn on_connection_success(&self) {}
    fn on_connection_failed(&self, _reason: &FailureReason) {}
    fn on_disconnected(&self) {}
    fn on_new_timestamp(&self, _timestamp_us: u64) {}
    fn on_auth_success(&self) {}
    fn on_auth_error(&self) {}
    fn on_new_bitrate(&self, _bits_per_second: u64) {}
    fn on_keyframe_requested(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connection_started(&self, url: &str) {
            self.calls.lock().unwrap().push(format!("started {url}"));
        }

        fn on_connection_failed(&self, reason: &FailureReason) {
            self.calls.lock().unwrap().push(reason.message());
        }

        fn on_new_timestamp(&self, timestamp_us: u64) {
            self.calls.lock().unwrap().push(format!("ts {timestamp_us}"));
        }
    }

    #[test]
    fn test_dispatch_to_observer() {
        let recorder = Recorder::default();
        let events = [
            ClientEvent::ConnectionStarted {
                url: "rtmp://example.com/live/key".into(),
            },
            ClientEvent::ConnectionSuccess,
            ClientEvent::NewTimestamp { timestamp_us: 42 },
            ClientEvent::ConnectionFailed {
                reason: FailureReason::Timeout {
                    stage: "auth".into(),
                },
            },
        ];
        for event in &events {
            event.dispatch(&recorder);
        }

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![
                "started rtmp://example.com/live/key".to_string(),
                "ts 42".to_string(),
                "Timed out during auth".to_string(),
            ]
        );
    }

    #[test]
    fn test_event_serializes() {
        let event = ClientEvent::NewBitrate {
            bits_per_second: 2_500_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"NewBitrate":{"bits_per_second":2500000}}"#);
        let back: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
