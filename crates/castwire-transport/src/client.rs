//! Public streaming clients.
//!
//! A [`StreamClient`] owns at most one live session at a time. Each
//! `connect()` builds a fresh session; events from every session go out on
//! the same channel, so an application subscribes once with
//! [`StreamClient::events`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use castwire_codec::{
    AudioCodec, AudioInfo, FormatError, MediaFrame, MediaKind, StreamInfo, VideoCodec, VideoInfo,
};
use castwire_ipc::{
    event_channel_with_capacity, ClientEvent, ConnectionState, TransportStatistics,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::auth::{Credentials, NonceSource, RandomNonce};
use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, RtmpEndpoint, SrtEndpoint};
use crate::error::{ConnectError, TransportError};
use crate::mux::{FlvMuxer, Muxer, TsMuxer};
use crate::pipeline::{run_sender, PacketSink};
use crate::session::Session;
use crate::{rtmp, srt, TransportResult};

/// Time the sender gets to send the goodbye after the drain grace ran out.
const GOODBYE_GRACE: Duration = Duration::from_millis(500);

type Established = (Box<dyn PacketSink>, Box<dyn Muxer>);

/// A streaming client for one destination URL.
pub enum StreamClient {
    Rtmp(RtmpClient),
    Srt(SrtClient),
}

impl StreamClient {
    /// Create a client, picking the protocol from the URL scheme.
    pub fn new(url: &str, config: ClientConfig) -> TransportResult<Self> {
        Ok(match Endpoint::parse(url)? {
            Endpoint::Rtmp(endpoint) => Self::Rtmp(RtmpClient::with_endpoint(endpoint, config)),
            Endpoint::Srt(endpoint) => Self::Srt(SrtClient::with_endpoint(endpoint, config)),
        })
    }

    fn core(&self) -> &ClientCore {
        match self {
            Self::Rtmp(client) => &client.core,
            Self::Srt(client) => &client.core,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Rtmp(_) => "rtmp",
            Self::Srt(_) => "srt",
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        match self {
            Self::Rtmp(client) => client.connect().await,
            Self::Srt(client) => client.connect().await,
        }
    }

    pub async fn disconnect(&self) -> TransportResult<()> {
        self.core().disconnect().await
    }

    pub fn set_video_info(&self, codec: VideoCodec, parameter_sets: &[Bytes]) -> Result<(), FormatError> {
        self.core().set_video_info(codec, parameter_sets)
    }

    pub fn set_audio_info(&self, codec: AudioCodec, sample_rate: u32, channels: u8) -> Result<(), FormatError> {
        self.core().set_audio_info(codec, sample_rate, channels)
    }

    pub fn send_video(&self, frame: MediaFrame) {
        self.core().send(MediaKind::Video, frame)
    }

    pub fn send_audio(&self, frame: MediaFrame) {
        self.core().send(MediaKind::Audio, frame)
    }

    /// Credentials for servers that challenge; overrides those in the URL.
    pub fn set_authorization(&self, user: &str, password: &str) {
        self.core().set_authorization(user, password)
    }

    pub fn state(&self) -> ConnectionState {
        self.core().state()
    }

    pub fn statistics(&self) -> TransportStatistics {
        self.core().statistics()
    }

    /// Receiver for this client's events.
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.core().events()
    }
}

/// Publishes FLV over RTMP.
pub struct RtmpClient {
    endpoint: RtmpEndpoint,
    core: ClientCore,
    nonces: RwLock<Arc<dyn NonceSource>>,
}

impl RtmpClient {
    pub fn new(url: &str, config: ClientConfig) -> TransportResult<Self> {
        match Endpoint::parse(url)? {
            Endpoint::Rtmp(endpoint) => Ok(Self::with_endpoint(endpoint, config)),
            Endpoint::Srt(_) => Err(TransportError::InvalidUrl(
                "Expected an rtmp:// URL".to_string(),
            )),
        }
    }

    fn with_endpoint(endpoint: RtmpEndpoint, config: ClientConfig) -> Self {
        let core = ClientCore::new(endpoint.display_url(), config);
        Self {
            endpoint,
            core,
            nonces: RwLock::new(Arc::new(RandomNonce)),
        }
    }

    /// Replace the client nonce generator used for authentication.
    pub fn set_nonce_source(&self, nonces: Arc<dyn NonceSource>) {
        *self.nonces.write() = nonces;
    }

    #[instrument(name = "rtmp_connect", skip(self), fields(url = %self.core.url))]
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let credentials = self
            .core
            .credentials()
            .or_else(|| self.endpoint.credentials.clone());
        let nonces = Arc::clone(&*self.nonces.read());
        let config = &self.core.config;

        self.core
            .connect(|session| async move {
                let sink =
                    rtmp::establish(&self.endpoint, config, credentials, nonces, &session).await?;
                let muxer = FlvMuxer::new(config.flv_resend_config_on_keyframe);
                Ok((Box::new(sink) as Box<dyn PacketSink>, Box::new(muxer) as Box<dyn Muxer>))
            })
            .await
    }

    pub async fn disconnect(&self) -> TransportResult<()> {
        self.core.disconnect().await
    }
}

/// Sends MPEG-TS over SRT.
pub struct SrtClient {
    endpoint: SrtEndpoint,
    core: ClientCore,
}

impl SrtClient {
    pub fn new(url: &str, config: ClientConfig) -> TransportResult<Self> {
        match Endpoint::parse(url)? {
            Endpoint::Srt(endpoint) => Ok(Self::with_endpoint(endpoint, config)),
            Endpoint::Rtmp(_) => Err(TransportError::InvalidUrl(
                "Expected an srt:// URL".to_string(),
            )),
        }
    }

    fn with_endpoint(endpoint: SrtEndpoint, config: ClientConfig) -> Self {
        let core = ClientCore::new(endpoint.display_url(), config);
        Self { endpoint, core }
    }

    #[instrument(name = "srt_connect", skip(self), fields(url = %self.core.url))]
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let config = &self.core.config;
        let latency_ms = self.endpoint.latency_ms.unwrap_or(config.srt_latency_ms);

        self.core
            .connect(|session| async move {
                let (socket, peer) = timeout(config.handshake_timeout, srt::open(&self.endpoint))
                    .await
                    .map_err(|_| TransportError::Timeout("connect".to_string()))??;
                session
                    .transition(ConnectionState::Handshaking)
                    .map_err(|_| TransportError::Cancelled)?;
                let connection = timeout(
                    config.handshake_timeout,
                    srt::handshake(socket, peer, &self.endpoint, latency_ms),
                )
                .await
                .map_err(|_| TransportError::Timeout("handshake".to_string()))??;

                let sink = srt::SrtSink::start(
                    connection,
                    config.effective_srt_payload_size(),
                    config.srt_retransmit_buffer,
                );
                Ok((Box::new(sink) as Box<dyn PacketSink>, Box::new(TsMuxer::new()) as Box<dyn Muxer>))
            })
            .await
    }

    pub async fn disconnect(&self) -> TransportResult<()> {
        self.core.disconnect().await
    }
}

#[derive(Debug, Default)]
struct IdleDrops {
    video: AtomicU64,
    audio: AtomicU64,
}

/// State shared by both protocol clients.
struct ClientCore {
    url: String,
    config: ClientConfig,
    info: RwLock<Arc<StreamInfo>>,
    session: Mutex<Option<Arc<Session>>>,
    credentials: Mutex<Option<Credentials>>,
    events_tx: Sender<ClientEvent>,
    events_rx: Receiver<ClientEvent>,
    idle_drops: IdleDrops,
}

impl ClientCore {
    fn new(url: String, config: ClientConfig) -> Self {
        let (events_tx, events_rx) = event_channel_with_capacity(config.event_channel_capacity);
        Self {
            url,
            config,
            info: RwLock::new(Arc::new(StreamInfo::default())),
            session: Mutex::new(None),
            credentials: Mutex::new(None),
            events_tx,
            events_rx,
            idle_drops: IdleDrops::default(),
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    async fn connect<F, Fut>(&self, establish: F) -> Result<(), ConnectError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = TransportResult<Established>>,
    {
        let session = {
            let mut slot = self.session.lock();
            if let Some(existing) = slot.as_ref() {
                if !existing.state().is_terminal() {
                    return Err(ConnectError::AlreadyConnected);
                }
            }
            let session = Arc::new(Session::new(
                self.url.clone(),
                self.config.effective_queue_capacity(),
                self.events_tx.clone(),
            ));
            *slot = Some(Arc::clone(&session));
            session
        };

        info!(url = %self.url, "Connecting");
        session
            .transition(ConnectionState::Connecting)
            .map_err(|_| ConnectError::Cancelled)?;

        let mut shutdown = session.shutdown_signal();
        let cancelled = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        let established = tokio::select! {
            result = establish(Arc::clone(&session)) => result,
            _ = cancelled => Err(TransportError::Cancelled),
        };

        let (sink, mut muxer) = match established {
            Ok(parts) => parts,
            Err(e) => {
                let error = ConnectError::from(e);
                if error != ConnectError::Cancelled {
                    warn!(error = %error, "Connect failed");
                    session.fail(error.failure_reason());
                }
                return Err(error);
            }
        };

        let info = self.stream_info();
        let opening = match muxer.begin_stream(&info) {
            Ok(packets) => packets,
            Err(e) => {
                let error = ConnectError::Protocol(e.to_string());
                session.fail(error.failure_reason());
                return Err(error);
            }
        };

        session
            .transition(ConnectionState::Ready)
            .map_err(|_| ConnectError::Cancelled)?;
        info!(url = %self.url, muxer = muxer.name(), "Ready to stream");

        let handle = tokio::spawn(run_sender(Arc::clone(&session), sink, muxer, opening));
        session.set_sender(handle);
        Ok(())
    }

    #[instrument(name = "disconnect", skip(self), fields(url = %self.url))]
    async fn disconnect(&self) -> TransportResult<()> {
        let Some(session) = self.current_session() else {
            debug!("Disconnect with no session");
            return Ok(());
        };
        let state = session.state();
        if state.is_terminal() || state == ConnectionState::Closing {
            return Ok(());
        }

        if session.transition(ConnectionState::Closing).is_err() {
            // failed concurrently
            return Ok(());
        }
        session.queue().close();

        if state.is_connected() {
            if let Some(mut handle) = session.take_sender() {
                if timeout(self.config.drain_grace, &mut handle).await.is_err() {
                    warn!(
                        queued = session.queue().len(),
                        "Drain grace expired, discarding queued frames"
                    );
                    session.discard_queue();
                    session.signal_shutdown();
                    if timeout(GOODBYE_GRACE, &mut handle).await.is_err() {
                        handle.abort();
                    }
                }
            }
        }

        session.signal_shutdown();
        session.discard_queue();
        let _ = session.transition(ConnectionState::Closed);
        info!("Disconnected");
        Ok(())
    }

    fn stream_info(&self) -> Arc<StreamInfo> {
        Arc::clone(&*self.info.read())
    }

    /// Swap in a new snapshot with one half replaced, and tell a live session.
    fn update_info(&self, kind: MediaKind, apply: impl FnOnce(&mut StreamInfo)) {
        let snapshot = {
            let mut guard = self.info.write();
            let mut next = StreamInfo::clone(&guard);
            apply(&mut next);
            *guard = Arc::new(next);
            Arc::clone(&*guard)
        };
        if let Some(session) = self.current_session() {
            if session.state().accepts_frames() {
                session.enqueue_reconfigure(kind, snapshot);
            }
        }
    }

    fn set_video_info(&self, codec: VideoCodec, parameter_sets: &[Bytes]) -> Result<(), FormatError> {
        let video = VideoInfo::new(codec, parameter_sets)?;
        let (width, height) = video.dimensions();
        info!(?codec, width, height, "Video configured");
        self.update_info(MediaKind::Video, |info| info.video = Some(video));
        Ok(())
    }

    fn set_audio_info(&self, codec: AudioCodec, sample_rate: u32, channels: u8) -> Result<(), FormatError> {
        let audio = AudioInfo::new(codec, sample_rate, channels)?;
        info!(?codec, sample_rate, channels, "Audio configured");
        self.update_info(MediaKind::Audio, |info| info.audio = Some(audio));
        Ok(())
    }

    fn send(&self, expected: MediaKind, frame: MediaFrame) {
        if frame.kind != expected {
            warn!(expected = ?expected, actual = ?frame.kind, "Frame sent on the wrong track, dropping");
            self.record_idle_drop(frame.kind);
            return;
        }
        match self.current_session() {
            Some(session) if session.state().accepts_frames() => session.enqueue(frame),
            _ => {
                trace!(kind = ?frame.kind, "Not connected, dropping frame");
                self.record_idle_drop(frame.kind);
            }
        }
    }

    fn record_idle_drop(&self, kind: MediaKind) {
        let counter = match kind {
            MediaKind::Video => &self.idle_drops.video,
            MediaKind::Audio => &self.idle_drops.audio,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn set_authorization(&self, user: &str, password: &str) {
        debug!(user, "Credentials set");
        *self.credentials.lock() = Some(Credentials::new(user, password));
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }

    fn state(&self) -> ConnectionState {
        self.current_session()
            .map(|session| session.state())
            .unwrap_or_default()
    }

    fn statistics(&self) -> TransportStatistics {
        let mut stats = self
            .current_session()
            .map(|session| session.statistics())
            .unwrap_or_default();
        stats.dropped_video_frames += self.idle_drops.video.load(Ordering::Relaxed);
        stats.dropped_audio_frames += self.idle_drops.audio.load(Ordering::Relaxed);
        stats
    }

    fn events(&self) -> Receiver<ClientEvent> {
        self.events_rx.clone()
    }
}
