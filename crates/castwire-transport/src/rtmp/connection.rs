//! A handshaken RTMP connection driven by an rml client session.

use std::collections::VecDeque;
use std::fmt::Debug;

use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::handshake;
use super::status::error_status;
use crate::config::ClientConfig;
use crate::error::{ProtocolError, TransportError};
use crate::TransportResult;

/// Wrap an rml session error.
pub(crate) fn session_error(error: impl Debug) -> TransportError {
    ProtocolError::Malformed(format!("RTMP session: {:?}", error)).into()
}

pub(crate) struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
    events: VecDeque<ClientSessionEvent>,
    read_buf: Vec<u8>,
}

impl RtmpConnection {
    /// Connect over TCP, run the handshake and start a client session.
    ///
    /// `tc_url` goes into the `connect` command, auth query included.
    pub async fn open(host: &str, port: u16, config: &ClientConfig, tc_url: String) -> TransportResult<Self> {
        let addr = format!("{}:{}", host, port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "TCP connection established, starting handshake");

        let leftover = handshake::perform(&mut stream).await?;

        let mut session_config = ClientSessionConfig::new();
        session_config.flash_version = config.flash_version.clone();
        session_config.chunk_size = config.rtmp_chunk_size;
        session_config.tc_url = Some(tc_url);
        let (session, initial) = ClientSession::new(session_config).map_err(session_error)?;

        let mut connection = Self {
            stream,
            session,
            events: VecDeque::new(),
            read_buf: vec![0u8; 8192],
        };
        connection.apply(initial).await?;
        if !leftover.is_empty() {
            let results = connection
                .session
                .handle_input(&leftover)
                .map_err(session_error)?;
            connection.apply(results).await?;
        }
        Ok(connection)
    }

    /// Write outbound packets and keep raised events for [`next_event`](Self::next_event).
    async fn apply(&mut self, results: Vec<ClientSessionResult>) -> TransportResult<()> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream.write_all(&packet.bytes).await?;
                    trace!(bytes = packet.bytes.len(), "Sent RTMP packet");
                }
                ClientSessionResult::RaisedEvent(event) => self.events.push_back(event),
                ClientSessionResult::UnhandleableMessageReceived(_) => {
                    trace!("Ignoring unhandled RTMP message");
                }
            }
        }
        Ok(())
    }

    /// Next session event, reading from the server as needed.
    pub async fn next_event(&mut self) -> TransportResult<ClientSessionEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionLost(
                    "Server closed the connection".to_string(),
                ));
            }
            let results = self
                .session
                .handle_input(&self.read_buf[..n])
                .map_err(session_error)?;
            self.apply(results).await?;
        }
    }

    /// Send `connect` for `app`. `Ok(Err(description))` carries a rejection.
    pub async fn request_connection(&mut self, app: String) -> TransportResult<Result<(), String>> {
        debug!(app = %app, "Requesting RTMP connection");
        let request = self.session.request_connection(app).map_err(session_error)?;
        self.apply(vec![request]).await?;

        loop {
            match self.next_event().await? {
                ClientSessionEvent::ConnectionRequestAccepted => return Ok(Ok(())),
                ClientSessionEvent::ConnectionRequestRejected { description } => {
                    return Ok(Err(description))
                }
                other => trace!("Event while connecting: {:?}", other),
            }
        }
    }

    /// Create a stream and publish `stream_key` live.
    pub async fn request_publishing(&mut self, stream_key: &str) -> TransportResult<()> {
        debug!(stream_key = %stream_key, "Requesting publish");
        let request = self
            .session
            .request_publishing(stream_key.to_string(), PublishRequestType::Live)
            .map_err(session_error)?;
        self.apply(vec![request]).await?;

        loop {
            let event = match self.next_event().await {
                Ok(event) => event,
                Err(TransportError::ConnectionLost(reason)) => {
                    return Err(ProtocolError::Rejected(format!("publish refused: {}", reason)).into())
                }
                Err(TransportError::Io(e)) => {
                    return Err(ProtocolError::Rejected(format!("publish refused: {}", e)).into())
                }
                Err(e) => return Err(e),
            };
            match event {
                ClientSessionEvent::PublishRequestAccepted => return Ok(()),
                ClientSessionEvent::UnhandleableAmf0Command {
                    command_name,
                    additional_values,
                    ..
                } => {
                    if let Some(code) = error_status(&command_name, &additional_values) {
                        return Err(ProtocolError::Rejected(code).into());
                    }
                    debug!(command = %command_name, "Server command while publishing");
                }
                other => trace!("Event while publishing: {:?}", other),
            }
        }
    }

    pub(crate) fn into_parts(self) -> (TcpStream, ClientSession) {
        (self.stream, self.session)
    }
}
