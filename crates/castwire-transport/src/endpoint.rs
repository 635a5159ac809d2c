//! Destination URL parsing.

use url::Url;

use crate::auth::Credentials;
use crate::error::TransportError;
use crate::{TransportResult, DEFAULT_RTMP_PORT};

/// A parsed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Rtmp(RtmpEndpoint),
    Srt(SrtEndpoint),
}

impl Endpoint {
    /// Parse a destination URL, choosing the protocol from its scheme.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "rtmp" => RtmpEndpoint::from_url(&parsed).map(Self::Rtmp),
            "srt" => SrtEndpoint::from_url(&parsed).map(Self::Srt),
            "rtmps" => Err(TransportError::InvalidUrl(
                "rtmps:// (RTMP over TLS) is not supported".to_string(),
            )),
            other => Err(TransportError::InvalidUrl(format!(
                "Unsupported scheme: {}",
                other
            ))),
        }
    }
}

/// An RTMP publishing destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpEndpoint {
    pub host: String,
    pub port: u16,
    /// Application path, possibly with an instance (`live/inst`).
    pub app: String,
    /// Stream name, with any URL query kept attached.
    pub stream_name: String,
    /// Credentials embedded in the URL.
    pub credentials: Option<Credentials>,
}

impl RtmpEndpoint {
    fn from_url(url: &Url) -> TransportResult<Self> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("Missing host".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_RTMP_PORT);

        let segments: Vec<&str> = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let (stream, app) = match segments.split_last() {
            Some((stream, app)) if !app.is_empty() => (*stream, app.join("/")),
            _ => {
                return Err(TransportError::InvalidUrl(
                    "URL must contain an application and a stream name".to_string(),
                ))
            }
        };

        let stream_name = match url.query() {
            Some(query) if !query.is_empty() => format!("{}?{}", stream, query),
            _ => stream.to_string(),
        };

        Ok(Self {
            host,
            port,
            app,
            stream_name,
            credentials: credentials_from_url(url),
        })
    }

    /// The tcUrl sent in the connect command.
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }

    /// URL without credentials, safe to log and report.
    pub fn display_url(&self) -> String {
        format!("{}/{}", self.tc_url(), self.stream_name)
    }
}

/// An SRT caller destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtEndpoint {
    pub host: String,
    pub port: u16,
    /// Stream id sent in the handshake SID extension.
    pub stream_id: Option<String>,
    /// Latency override from the URL.
    pub latency_ms: Option<u16>,
}

impl SrtEndpoint {
    fn from_url(url: &Url) -> TransportResult<Self> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("Missing host".to_string()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| TransportError::InvalidUrl("SRT URL requires a port".to_string()))?;

        let mut stream_id = None;
        let mut latency_ms = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "streamid" => stream_id = Some(value.into_owned()),
                "latency" => {
                    let latency = value.parse::<u16>().map_err(|_| {
                        TransportError::InvalidUrl(format!("Invalid latency: {}", value))
                    })?;
                    latency_ms = Some(latency);
                }
                "passphrase" | "pbkeylen" => {
                    return Err(TransportError::InvalidUrl(
                        "SRT encryption is not supported".to_string(),
                    ))
                }
                _ => {}
            }
        }

        if stream_id.is_none() {
            let path = url.path().trim_matches('/');
            if !path.is_empty() {
                stream_id = Some(path.to_string());
            }
        }

        Ok(Self {
            host,
            port,
            stream_id,
            latency_ms,
        })
    }

    /// URL safe to log and report.
    pub fn display_url(&self) -> String {
        match &self.stream_id {
            Some(id) => format!("srt://{}:{}?streamid={}", self.host, self.port, id),
            None => format!("srt://{}:{}", self.host, self.port),
        }
    }
}

fn credentials_from_url(url: &Url) -> Option<Credentials> {
    let user = percent_decode(url.username());
    if user.is_empty() {
        return None;
    }
    let password = url.password().map(percent_decode).unwrap_or_default();
    Some(Credentials::new(user, password))
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", value.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}
