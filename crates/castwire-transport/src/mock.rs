//! In-process RTMP and SRT servers for client tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::auth::{adobe_response, Credentials};
use crate::srt::packet::{
    handshake_type, seq_add, Control, ControlPacket, Handshake as SrtHandshake,
    HandshakeExtension, Packet, SRT_LIBRARY_VERSION, SRT_MAGIC, SRT_VERSION,
};

pub const SALT: &str = "c2FsdA==";
pub const CHALLENGE: &str = "Y2hhbGxlbmdl";
pub const OPAQUE: &str = "b3BhcXVl";

/// Route client logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const NEED_AUTH: &str = "[ AccessManager.Reject ] : [ code=403 need auth; authmod=adobe ] : ";

/// How the mock RTMP server treats a publisher.
#[derive(Debug, Clone)]
pub enum RtmpBehavior {
    Accept,
    /// Wait before answering `connect`.
    SlowConnect(Duration),
    /// Demand Adobe authentication with these credentials.
    AdobeAuth(Credentials),
    /// Answer the handshake with an unsupported version.
    BadVersion,
    RejectPublish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Metadata,
    Video,
    Audio,
}

/// One published message as the server session decoded it.
#[derive(Debug, Clone)]
pub struct MockMedia {
    pub kind: MediaKind,
    pub timestamp: u32,
    pub data: Bytes,
}

/// Everything the mock RTMP server saw.
#[derive(Debug, Default)]
pub struct RtmpLog {
    pub connections: usize,
    pub apps: Vec<String>,
    /// Session requests in arrival order: `connect`, `publish`, `finished`.
    pub commands: Vec<String>,
    pub stream_keys: Vec<String>,
    pub metadata: Vec<StreamMetadata>,
    /// Metadata, video and audio in arrival order.
    pub media: Vec<MockMedia>,
    pub closed: usize,
}

impl RtmpLog {
    pub fn media_of(&self, kind: MediaKind) -> Vec<MockMedia> {
        self.media
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

pub struct MockRtmpServer {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<RtmpLog>>,
    task: JoinHandle<()>,
}

impl MockRtmpServer {
    pub async fn start(behavior: RtmpBehavior) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(RtmpLog::default()));

        let task = tokio::spawn({
            let log = Arc::clone(&log);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    log.lock().connections += 1;
                    tokio::spawn(serve_rtmp(stream, behavior.clone(), Arc::clone(&log)));
                }
            }
        });

        Self { addr, log, task }
    }

    pub fn url(&self, app: &str, stream: &str) -> String {
        format!("rtmp://{}/{}/{}", self.addr, app, stream)
    }
}

impl Drop for MockRtmpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_rtmp(mut stream: TcpStream, behavior: RtmpBehavior, log: Arc<Mutex<RtmpLog>>) {
    if let RtmpBehavior::BadVersion = behavior {
        let mut c0_c1 = vec![0u8; 1537];
        if stream.read_exact(&mut c0_c1).await.is_ok() {
            let mut s0_s1 = vec![0u8; 1537];
            s0_s1[0] = 6;
            let _ = stream.write_all(&s0_s1).await;
        }
        return;
    }

    let mut buf = vec![0u8; 8192];
    let mut handshake = Handshake::new(PeerType::Server);
    let remaining = loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if stream.write_all(&response_bytes).await.is_err() {
                    return;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if stream.write_all(&response_bytes).await.is_err() {
                    return;
                }
                break remaining_bytes;
            }
            Err(_) => return,
        }
    };

    let Ok((mut session, initial)) = ServerSession::new(ServerSessionConfig::new()) else {
        return;
    };
    let mut pending = initial;
    let mut input = remaining;
    loop {
        if !input.is_empty() {
            match session.handle_input(&input) {
                Ok(results) => pending.extend(results),
                Err(_) => return,
            }
        }

        let mut hang_up = false;
        while !pending.is_empty() {
            let mut out = Vec::new();
            for result in std::mem::take(&mut pending) {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => out.extend(packet.bytes),
                    ServerSessionResult::RaisedEvent(event) => {
                        let reply = answer(&mut session, event, &behavior, &log).await;
                        hang_up |= reply.hang_up;
                        pending.extend(reply.results);
                    }
                    ServerSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
        if hang_up {
            return;
        }

        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {
                log.lock().closed += 1;
                return;
            }
            Ok(n) => input = buf[..n].to_vec(),
        }
    }
}

struct Reply {
    results: Vec<ServerSessionResult>,
    hang_up: bool,
}

impl Reply {
    fn none() -> Self {
        Self {
            results: Vec::new(),
            hang_up: false,
        }
    }

    fn accept(session: &mut ServerSession, request_id: u32) -> Self {
        Self {
            results: session.accept_request(request_id).unwrap_or_default(),
            hang_up: false,
        }
    }

    fn reject(session: &mut ServerSession, request_id: u32, code: &str, description: &str) -> Self {
        Self {
            results: session
                .reject_request(request_id, code, description)
                .unwrap_or_default(),
            hang_up: true,
        }
    }
}

async fn answer(
    session: &mut ServerSession,
    event: ServerSessionEvent,
    behavior: &RtmpBehavior,
    log: &Mutex<RtmpLog>,
) -> Reply {
    match event {
        ServerSessionEvent::ConnectionRequested {
            request_id,
            app_name,
            ..
        } => {
            {
                let mut log = log.lock();
                log.commands.push("connect".to_string());
                log.apps.push(app_name.clone());
            }
            match behavior {
                RtmpBehavior::SlowConnect(delay) => tokio::time::sleep(*delay).await,
                RtmpBehavior::AdobeAuth(credentials) => {
                    if let Some(rejection) = check_adobe(&app_name, credentials) {
                        return Reply::reject(
                            session,
                            request_id,
                            "NetConnection.Connect.Rejected",
                            &rejection,
                        );
                    }
                }
                _ => {}
            }
            Reply::accept(session, request_id)
        }
        ServerSessionEvent::PublishStreamRequested {
            request_id,
            stream_key,
            ..
        } => {
            {
                let mut log = log.lock();
                log.commands.push("publish".to_string());
                log.stream_keys.push(stream_key);
            }
            match behavior {
                RtmpBehavior::RejectPublish => Reply::reject(
                    session,
                    request_id,
                    "NetStream.Publish.BadName",
                    "Stream name in use.",
                ),
                _ => Reply::accept(session, request_id),
            }
        }
        ServerSessionEvent::PublishStreamFinished { .. } => {
            log.lock().commands.push("finished".to_string());
            Reply::none()
        }
        ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
            let mut log = log.lock();
            log.media.push(MockMedia {
                kind: MediaKind::Metadata,
                timestamp: 0,
                data: Bytes::new(),
            });
            log.metadata.push(metadata);
            Reply::none()
        }
        ServerSessionEvent::VideoDataReceived {
            data, timestamp, ..
        } => {
            log.lock().media.push(MockMedia {
                kind: MediaKind::Video,
                timestamp: timestamp.value,
                data,
            });
            Reply::none()
        }
        ServerSessionEvent::AudioDataReceived {
            data, timestamp, ..
        } => {
            log.lock().media.push(MockMedia {
                kind: MediaKind::Audio,
                timestamp: timestamp.value,
                data,
            });
            Reply::none()
        }
        _ => Reply::none(),
    }
}

/// Rejection description for this connect attempt, or `None` to accept it.
fn check_adobe(app: &str, credentials: &Credentials) -> Option<String> {
    let Some((_, query)) = app.split_once('?') else {
        return Some(NEED_AUTH.to_string());
    };
    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let Some(client_challenge) = params.get("challenge") else {
        return Some(format!(
            "[ AccessManager.Reject ] : [ authmod=adobe ] : ?reason=needauth&user={}&salt={}&challenge={}&opaque={}",
            params.get("user").copied().unwrap_or_default(),
            SALT,
            CHALLENGE,
            OPAQUE
        ));
    };

    let expected = adobe_response(credentials, SALT, CHALLENGE, Some(OPAQUE), client_challenge);
    if expected.trim_start_matches('?') == query {
        None
    } else {
        Some("[ AccessManager.Reject ] : [ authmod=adobe ] : ?reason=authfailed&opaque=b3BhcXVl".to_string())
    }
}

pub const SRT_SERVER_SOCKET_ID: u32 = 0x0BAD_CAFE;
const SRT_COOKIE: u32 = 0x1234_5678;

/// Everything the mock SRT listener saw.
#[derive(Debug, Default)]
pub struct SrtLog {
    pub stream_id: Option<String>,
    pub latency_ms: Option<u16>,
    /// Data payloads in arrival order.
    pub payloads: Vec<Bytes>,
    pub ackacks: usize,
    pub shutdown: bool,
}

pub struct MockSrtServer {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<SrtLog>>,
    task: JoinHandle<()>,
}

impl MockSrtServer {
    /// A listener that rejects conclusions with `reject` when set.
    pub async fn start(reject: Option<u32>) -> Self {
        init_tracing();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(Mutex::new(SrtLog::default()));
        let task = tokio::spawn(serve_srt(socket, reject, Arc::clone(&log)));
        Self { addr, log, task }
    }

    pub fn url(&self, query: &str) -> String {
        format!("srt://{}{}", self.addr, query)
    }
}

impl Drop for MockSrtServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_srt(socket: UdpSocket, reject: Option<u32>, log: Arc<Mutex<SrtLog>>) {
    let mut buf = vec![0u8; 1500];
    let mut acks = 0u32;
    let mut caller = 0u32;
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(packet) = Packet::decode(Bytes::copy_from_slice(&buf[..n])) else {
            continue;
        };
        let reply = match packet {
            Packet::Data(data) => {
                log.lock().payloads.push(data.payload);
                acks += 1;
                Some(ControlPacket::new(
                    Control::Ack {
                        ack_number: acks,
                        last_acknowledged: seq_add(data.sequence, 1),
                    },
                    0,
                    caller,
                ))
            }
            Packet::Control(control) => match control.body {
                Control::Handshake(request) => {
                    caller = request.socket_id;
                    Some(answer_handshake(request, reject, &log))
                }
                Control::AckAck(_) => {
                    log.lock().ackacks += 1;
                    None
                }
                Control::Shutdown => {
                    log.lock().shutdown = true;
                    None
                }
                _ => None,
            },
        };
        if let Some(reply) = reply {
            let _ = socket.send_to(&Packet::Control(reply).encode(), from).await;
        }
    }
}

fn answer_handshake(request: SrtHandshake, reject: Option<u32>, log: &Mutex<SrtLog>) -> ControlPacket {
    let caller = request.socket_id;
    let response = if request.handshake_type == handshake_type::INDUCTION {
        SrtHandshake {
            version: SRT_VERSION,
            extension_field: SRT_MAGIC,
            socket_id: SRT_SERVER_SOCKET_ID,
            cookie: SRT_COOKIE,
            ..request
        }
    } else {
        {
            let mut log = log.lock();
            log.stream_id = request.stream_id().map(str::to_string);
            log.latency_ms = request.extensions.iter().find_map(|ext| match ext {
                HandshakeExtension::Srt {
                    receive_latency_ms, ..
                } => Some(*receive_latency_ms),
                _ => None,
            });
        }
        let handshake_type = match reject {
            Some(code) => code,
            None if request.cookie == SRT_COOKIE => handshake_type::CONCLUSION,
            None => handshake_type::REJECTION_BASE + 4,
        };
        SrtHandshake {
            handshake_type,
            socket_id: SRT_SERVER_SOCKET_ID,
            extension_field: 1,
            extensions: vec![HandshakeExtension::Srt {
                response: true,
                version: SRT_LIBRARY_VERSION,
                flags: 0x3B,
                receive_latency_ms: 120,
                send_latency_ms: 120,
            }],
            ..request
        }
    };
    ControlPacket::new(Control::Handshake(response), 0, caller)
}
