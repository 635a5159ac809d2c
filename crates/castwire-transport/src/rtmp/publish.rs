//! RTMP connect, authentication and publish sequence.

use std::sync::Arc;

use castwire_ipc::{ClientEvent, ConnectionState};
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use super::connection::RtmpConnection;
use super::sink::RtmpSink;
use crate::auth::{AuthNegotiator, Credentials, NonceSource};
use crate::config::ClientConfig;
use crate::endpoint::RtmpEndpoint;
use crate::error::{ProtocolError, TransportError};
use crate::session::Session;
use crate::TransportResult;

/// Connect, authenticate if challenged and start publishing.
///
/// Every authentication round trip runs on a fresh TCP connection with the
/// computed query appended to `app` and `tcUrl`.
#[instrument(name = "rtmp_establish", skip_all, fields(host = %endpoint.host, port = endpoint.port, app = %endpoint.app))]
pub(crate) async fn establish(
    endpoint: &RtmpEndpoint,
    config: &ClientConfig,
    credentials: Option<Credentials>,
    nonces: Arc<dyn NonceSource>,
    session: &Session,
) -> TransportResult<RtmpSink> {
    let mut negotiator = AuthNegotiator::new(credentials, nonces);
    let mut auth_query = String::new();

    let mut connection = loop {
        let tc_url = format!("{}{}", endpoint.tc_url(), auth_query);
        let mut connection = timeout(
            config.handshake_timeout,
            RtmpConnection::open(&endpoint.host, endpoint.port, config, tc_url),
        )
        .await
        .map_err(|_| TransportError::Timeout("handshake".to_string()))??;
        if auth_query.is_empty() {
            advance(session, ConnectionState::Handshaking)?;
        }

        let (stage, limit) = if auth_query.is_empty() {
            ("connect", config.handshake_timeout)
        } else {
            ("authentication", config.auth_timeout)
        };
        let app = format!("{}{}", endpoint.app, auth_query);
        let reply = timeout(limit, connection.request_connection(app))
            .await
            .map_err(|_| TransportError::Timeout(stage.to_string()))??;

        let description = match reply {
            Ok(()) => break connection,
            Err(description) => description,
        };
        debug!(description = %description, "connect rejected");

        match negotiator.next_query(&endpoint.app, &description) {
            Ok(Some(query)) => {
                advance(session, ConnectionState::Authenticating)?;
                info!("Server requested authentication, reconnecting");
                auth_query = query;
            }
            Ok(None) if negotiator.responded() => {
                session.emit(ClientEvent::AuthError);
                return Err(ProtocolError::AuthenticationFailed(description).into());
            }
            Ok(None) => return Err(ProtocolError::Rejected(description).into()),
            Err(e) => {
                session.emit(ClientEvent::AuthError);
                return Err(e.into());
            }
        }
    };

    if negotiator.responded() {
        info!("Authenticated");
        session.emit(ClientEvent::AuthSuccess);
    }

    timeout(
        config.handshake_timeout,
        connection.request_publishing(&endpoint.stream_name),
    )
    .await
    .map_err(|_| TransportError::Timeout("publish".to_string()))??;

    info!(stream = %endpoint.stream_name, "Publishing");
    Ok(RtmpSink::start(connection, endpoint.stream_name.clone()))
}

/// Step the session forward unless it is already there.
fn advance(session: &Session, next: ConnectionState) -> TransportResult<()> {
    if session.state() == next {
        return Ok(());
    }
    session
        .transition(next)
        .map_err(|_| TransportError::Cancelled)
}
