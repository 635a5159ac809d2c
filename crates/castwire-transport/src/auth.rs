//! RTMP publish authentication.
//!
//! Servers that require credentials reject the first `connect` with an
//! `_error` whose description names the scheme (`authmod=adobe` or
//! `authmod=llnw`). The client reconnects with the user name, receives a
//! challenge, and reconnects once more with the computed response appended
//! to the application name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use castwire_codec::primitives::{md5_base64, md5_hex};
use tracing::debug;

use crate::error::ProtocolError;

/// User name and password for RTMP publishing.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Source of client nonces.
pub trait NonceSource: Send + Sync {
    fn next_nonce(&self) -> u32;
}

/// Nonces from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNonce;

impl NonceSource for RandomNonce {
    fn next_nonce(&self) -> u32 {
        rand::random()
    }
}

/// Always returns the same nonce.
#[derive(Debug, Clone, Copy)]
pub struct FixedNonce(pub u32);

impl NonceSource for FixedNonce {
    fn next_nonce(&self) -> u32 {
        self.0
    }
}

/// Authentication scheme announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Adobe,
    Llnw,
}

impl AuthScheme {
    fn name(self) -> &'static str {
        match self {
            Self::Adobe => "adobe",
            Self::Llnw => "llnw",
        }
    }
}

/// What a rejection description asks of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerChallenge {
    /// First stage: the server wants to know who is connecting.
    NeedUser(AuthScheme),

    /// Adobe challenge.
    Adobe {
        salt: String,
        challenge: String,
        opaque: Option<String>,
    },

    /// Limelight challenge.
    Llnw { nonce: String },

    /// The server refused the user or the response.
    Refused { reason: String },
}

/// Interpret an `_error` description. Returns `None` when it is not about authentication.
pub fn parse_challenge(description: &str) -> Option<ServerChallenge> {
    let scheme = if description.contains("authmod=adobe") {
        AuthScheme::Adobe
    } else if description.contains("authmod=llnw") {
        AuthScheme::Llnw
    } else {
        return None;
    };

    let params = match description.split_once('?') {
        Some((_, query)) => parse_query(query),
        None => return Some(ServerChallenge::NeedUser(scheme)),
    };

    let challenge = match params.get("reason").map(String::as_str) {
        None => ServerChallenge::NeedUser(scheme),
        Some("needauth") => match scheme {
            AuthScheme::Adobe => match (params.get("salt"), params.get("challenge")) {
                (Some(salt), Some(challenge)) => ServerChallenge::Adobe {
                    salt: salt.clone(),
                    challenge: challenge.clone(),
                    opaque: params.get("opaque").filter(|o| !o.is_empty()).cloned(),
                },
                _ => ServerChallenge::Refused {
                    reason: "challenge without salt".to_string(),
                },
            },
            AuthScheme::Llnw => match params.get("nonce") {
                Some(nonce) => ServerChallenge::Llnw {
                    nonce: nonce.clone(),
                },
                None => ServerChallenge::Refused {
                    reason: "challenge without nonce".to_string(),
                },
            },
        },
        Some(reason) => ServerChallenge::Refused {
            reason: reason.to_string(),
        },
    };
    Some(challenge)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// App query answering an Adobe challenge.
pub fn adobe_response(
    credentials: &Credentials,
    salt: &str,
    challenge: &str,
    opaque: Option<&str>,
    client_challenge: &str,
) -> String {
    let hash = md5_base64(format!("{}{}{}", credentials.user, salt, credentials.password).as_bytes());
    let server_part = opaque.unwrap_or(challenge);
    let response = md5_base64(format!("{}{}{}", hash, server_part, client_challenge).as_bytes());

    let mut query = format!(
        "?authmod=adobe&user={}&challenge={}&response={}",
        credentials.user, client_challenge, response
    );
    if let Some(opaque) = opaque {
        query.push_str("&opaque=");
        query.push_str(opaque);
    }
    query
}

/// App query answering a Limelight challenge.
pub fn llnw_response(credentials: &Credentials, app: &str, nonce: &str, cnonce: &str) -> String {
    const REALM: &str = "live";
    const METHOD: &str = "publish";
    const QOP: &str = "auth";
    const NC: &str = "00000001";

    let mut path = app.split('?').next().unwrap_or(app).to_string();
    if !path.contains('/') {
        path.push_str("/_definst_");
    }

    let ha1 = md5_hex(format!("{}:{}:{}", credentials.user, REALM, credentials.password).as_bytes());
    let ha2 = md5_hex(format!("{}:/{}", METHOD, path).as_bytes());
    let response =
        md5_hex(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, NC, cnonce, QOP, ha2).as_bytes());

    format!(
        "?authmod=llnw&user={}&nonce={}&cnonce={}&nc={}&response={}",
        credentials.user, nonce, cnonce, NC, response
    )
}

/// Walks one connect attempt through the challenge stages.
pub struct AuthNegotiator {
    credentials: Option<Credentials>,
    nonces: Arc<dyn NonceSource>,
    user_sent: bool,
    responded: bool,
}

impl AuthNegotiator {
    pub fn new(credentials: Option<Credentials>, nonces: Arc<dyn NonceSource>) -> Self {
        Self {
            credentials,
            nonces,
            user_sent: false,
            responded: false,
        }
    }

    /// Whether a computed response has been sent.
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Query to append to the app for the next connect attempt.
    ///
    /// Returns `Ok(None)` when the description is not an auth challenge.
    pub fn next_query(
        &mut self,
        app: &str,
        description: &str,
    ) -> Result<Option<String>, ProtocolError> {
        let Some(challenge) = parse_challenge(description) else {
            return Ok(None);
        };
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ProtocolError::AuthenticationFailed("server requires credentials".to_string())
        })?;

        match challenge {
            ServerChallenge::Refused { reason } => Err(ProtocolError::AuthenticationFailed(reason)),
            _ if self.responded => Err(ProtocolError::AuthenticationFailed(
                "credentials rejected".to_string(),
            )),
            ServerChallenge::NeedUser(scheme) => {
                if self.user_sent {
                    return Err(ProtocolError::AuthenticationFailed(
                        "server repeated the user request".to_string(),
                    ));
                }
                self.user_sent = true;
                debug!(scheme = scheme.name(), "Server requested authentication");
                Ok(Some(format!(
                    "?authmod={}&user={}",
                    scheme.name(),
                    credentials.user
                )))
            }
            ServerChallenge::Adobe {
                salt,
                challenge,
                opaque,
            } => {
                self.responded = true;
                let client_challenge = format!("{:08x}", self.nonces.next_nonce());
                Ok(Some(adobe_response(
                    credentials,
                    &salt,
                    &challenge,
                    opaque.as_deref(),
                    &client_challenge,
                )))
            }
            ServerChallenge::Llnw { nonce } => {
                self.responded = true;
                let cnonce = format!("{:08x}", self.nonces.next_nonce());
                Ok(Some(llnw_response(credentials, app, &nonce, &cnonce)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NEED_AUTH: &str = "[ AccessManager.Reject ] : [ code=403 need auth; authmod=adobe ] : ";
    const ADOBE_CHALLENGE: &str = "[ AccessManager.Reject ] : [ authmod=adobe ] : \
        ?reason=needauth&user=user&salt=c2FsdA==&challenge=Y2hhbGxlbmdl&opaque=b3BhcXVl";

    fn credentials() -> Credentials {
        Credentials::new("user", "secret")
    }

    #[test]
    fn test_adobe_response_vectors() {
        assert_eq!(
            adobe_response(
                &credentials(),
                "c2FsdA==",
                "Y2hhbGxlbmdl",
                Some("b3BhcXVl"),
                "0000002a"
            ),
            "?authmod=adobe&user=user&challenge=0000002a&response=A16G82acIcZSzEcEtAjPfQ==&opaque=b3BhcXVl"
        );
        assert_eq!(
            adobe_response(&credentials(), "c2FsdA==", "Y2hhbGxlbmdl", None, "0000002a"),
            "?authmod=adobe&user=user&challenge=0000002a&response=C3zHCcHwQ91EjZxc1dKR9g=="
        );
    }

    #[test]
    fn test_llnw_response_vectors() {
        assert_eq!(
            llnw_response(&credentials(), "live", "NDM2OTk4NTc=", "0000002a"),
            "?authmod=llnw&user=user&nonce=NDM2OTk4NTc=&cnonce=0000002a&nc=00000001\
             &response=839072031cca27a175174fac9217dfc1"
        );
        assert!(llnw_response(&credentials(), "live/inst", "NDM2OTk4NTc=", "0000002a")
            .ends_with("response=b9b2bac474f5b18eaf6417e059800303"));
    }

    #[test]
    fn test_parse_challenge() {
        assert_eq!(
            parse_challenge(NEED_AUTH),
            Some(ServerChallenge::NeedUser(AuthScheme::Adobe))
        );
        assert_eq!(
            parse_challenge(ADOBE_CHALLENGE),
            Some(ServerChallenge::Adobe {
                salt: "c2FsdA==".into(),
                challenge: "Y2hhbGxlbmdl".into(),
                opaque: Some("b3BhcXVl".into()),
            })
        );
        assert_eq!(
            parse_challenge("[ AccessManager.Reject ] : [ authmod=llnw ] : ?reason=needauth&user=&nonce=abc"),
            Some(ServerChallenge::Llnw {
                nonce: "abc".into()
            })
        );
        assert_eq!(
            parse_challenge("[ AccessManager.Reject ] : [ authmod=adobe ] : ?reason=authfailed"),
            Some(ServerChallenge::Refused {
                reason: "authfailed".into()
            })
        );
        assert_eq!(parse_challenge("NetConnection.Connect.Rejected"), None);
    }

    #[test]
    fn test_negotiator_adobe_flow() {
        let mut negotiator = AuthNegotiator::new(Some(credentials()), Arc::new(FixedNonce(42)));

        assert_eq!(
            negotiator.next_query("live", NEED_AUTH).unwrap().as_deref(),
            Some("?authmod=adobe&user=user")
        );
        let query = negotiator
            .next_query("live", ADOBE_CHALLENGE)
            .unwrap()
            .unwrap();
        assert!(query.contains("response=A16G82acIcZSzEcEtAjPfQ=="));
        assert!(negotiator.responded());

        // one credentialed attempt only
        assert!(matches!(
            negotiator.next_query("live", ADOBE_CHALLENGE),
            Err(ProtocolError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_negotiator_without_credentials() {
        let mut negotiator = AuthNegotiator::new(None, Arc::new(RandomNonce));
        assert!(matches!(
            negotiator.next_query("live", NEED_AUTH),
            Err(ProtocolError::AuthenticationFailed(_))
        ));
        assert_eq!(negotiator.next_query("live", "Rejected").unwrap(), None);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let printed = format!("{:?}", credentials());
        assert!(printed.contains("user"));
        assert!(!printed.contains("secret"));
    }
}
