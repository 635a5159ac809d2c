//! Client configuration and reconnection policy.

use std::time::Duration;

use castwire_ipc::{FailureReason, EVENT_CHANNEL_CAPACITY};
use serde::{Deserialize, Serialize};

use crate::{BASE_RECONNECT_DELAY_MS, MAX_RECONNECT_ATTEMPTS};

/// Default send queue capacity, in entries.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// Smallest queue that can hold a reconfiguration marker of each kind plus frames.
pub const MIN_QUEUE_CAPACITY: usize = 4;

/// Default handshake timeout in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default timeout for each authentication round trip in milliseconds.
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5000;

/// Default time disconnect() waits for the queue to drain, in milliseconds.
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 2000;

/// Default outgoing RTMP chunk size.
pub const DEFAULT_RTMP_CHUNK_SIZE: u32 = 4096;

/// Default flashVer sent in the RTMP connect command.
pub const DEFAULT_FLASH_VERSION: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

/// Default SRT latency in milliseconds.
pub const DEFAULT_SRT_LATENCY_MS: u16 = 120;

/// Seven MPEG-TS packets per SRT datagram.
pub const DEFAULT_SRT_PAYLOAD_SIZE: usize = 1316;

/// Default number of sent SRT packets kept for retransmission.
pub const DEFAULT_SRT_RETRANSMIT_BUFFER: usize = 1024;

/// Streaming client configuration.
///
/// Durations serialize as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Send queue capacity in entries.
    pub queue_capacity: usize,

    /// Time allowed for transport setup and protocol handshake.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Time allowed for each authentication round trip.
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,

    /// Time disconnect() lets the queue drain before discarding it.
    #[serde(with = "duration_ms")]
    pub drain_grace: Duration,

    /// Outgoing RTMP chunk size announced after the handshake.
    pub rtmp_chunk_size: u32,

    /// flashVer sent in the RTMP connect command.
    pub flash_version: String,

    /// Re-send FLV sequence headers before every video keyframe.
    pub flv_resend_config_on_keyframe: bool,

    /// SRT latency announced in the handshake, unless the URL overrides it.
    pub srt_latency_ms: u16,

    /// Maximum SRT data payload in bytes.
    pub srt_payload_size: usize,

    /// Number of sent SRT packets kept for retransmission.
    pub srt_retransmit_buffer: usize,

    /// Event channel capacity.
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
            rtmp_chunk_size: DEFAULT_RTMP_CHUNK_SIZE,
            flash_version: DEFAULT_FLASH_VERSION.to_string(),
            flv_resend_config_on_keyframe: false,
            srt_latency_ms: DEFAULT_SRT_LATENCY_MS,
            srt_payload_size: DEFAULT_SRT_PAYLOAD_SIZE,
            srt_retransmit_buffer: DEFAULT_SRT_RETRANSMIT_BUFFER,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Queue capacity clamped to the supported minimum.
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.max(MIN_QUEUE_CAPACITY)
    }

    /// SRT payload size rounded down to whole MPEG-TS packets.
    pub fn effective_srt_payload_size(&self) -> usize {
        let packets = (self.srt_payload_size / crate::mux::TS_PACKET_SIZE).clamp(1, 7);
        packets * crate::mux::TS_PACKET_SIZE
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Reconnection policy for applications that want to retry after a failure.
///
/// The client never reconnects on its own; callers consult this after a
/// `ConnectionFailed` event and call `connect()` again.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts.
    pub max_attempts: u32,

    /// Base delay between attempts (exponential backoff applied).
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_RECONNECT_DELAY_MS),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Check if more attempts are allowed after this failure.
    pub fn should_retry(&self, attempt: u32, reason: &FailureReason) -> bool {
        attempt < self.max_attempts && reason.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.queue_capacity, 200);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.rtmp_chunk_size, 4096);
        assert_eq!(config.srt_payload_size, 1316);
        assert_eq!(config.effective_srt_payload_size(), 1316);
        assert!(!config.flv_resend_config_on_keyframe);
    }

    #[test]
    fn test_config_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"queue_capacity": 2, "drain_grace": 250}"#).unwrap();
        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.effective_queue_capacity(), MIN_QUEUE_CAPACITY);
        assert_eq!(config.drain_grace, Duration::from_millis(250));
        assert_eq!(config.auth_timeout, Duration::from_secs(5));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["drain_grace"], 250);
    }

    #[test]
    fn test_reconnect_policy_delays() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn test_reconnect_policy_should_retry() {
        let policy = ReconnectPolicy::default();
        let lost = FailureReason::ConnectionLost {
            message: "reset".into(),
        };
        let auth = FailureReason::AuthenticationFailed {
            message: "bad password".into(),
        };

        assert!(policy.should_retry(0, &lost));
        assert!(policy.should_retry(2, &lost));
        assert!(!policy.should_retry(3, &lost));
        assert!(!policy.should_retry(0, &auth));
    }
}
