//! Credential source selection.
//!
//! The gateway accepts a flat bag of knobs (file path, TURN endpoint and
//! secrets, web service coordinates); which one actually supplies
//! credentials is decided exactly once at startup, here, by precedence:
//! readable static file, then HMAC shared secret, then legacy static
//! credentials, then the credential web service.

use std::fs;
use std::path::PathBuf;

use crate::descriptor::{self, RtcCredentials, TurnProtocol};
use crate::error::CredentialError;
use crate::rest::RestCredentialClient;

/// Relay endpoint generated descriptors point at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: TurnProtocol,
    pub tls: bool,
}

/// Everything the operator may configure about credentials, before
/// selection. All fields are optional in spirit; empty strings mean unset.
#[derive(Debug, Clone, Default)]
pub struct CredentialSettings {
    /// Descriptor JSON watched and re-read when rewritten in place.
    pub descriptor_path: PathBuf,
    pub turn_host: String,
    pub turn_port: Option<u16>,
    pub turn_protocol: TurnProtocol,
    pub turn_tls: bool,
    /// Shared secret for locally generated ephemeral credentials.
    pub turn_shared_secret: String,
    /// Legacy static relay credentials.
    pub turn_username: String,
    pub turn_password: String,
    /// Credential web service base URI.
    pub web_uri: String,
    /// Username presented to the web service, and the identity baked into
    /// generated ephemeral usernames.
    pub web_username: String,
    /// Header the web service reads the username from.
    pub auth_header_name: String,
}

impl CredentialSettings {
    pub fn turn_endpoint(&self) -> Option<TurnEndpoint> {
        if self.turn_host.is_empty() {
            return None;
        }
        Some(TurnEndpoint {
            host: self.turn_host.clone(),
            port: self.turn_port?,
            protocol: self.turn_protocol,
            tls: self.turn_tls,
        })
    }
}

/// The one source that supplies descriptors for this process lifetime.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    StaticFile {
        path: PathBuf,
    },
    Hmac {
        endpoint: TurnEndpoint,
        shared_secret: String,
        username: String,
    },
    LegacyStatic {
        endpoint: TurnEndpoint,
        username: String,
        password: String,
    },
    Rest {
        uri: String,
        username: String,
        auth_header_name: String,
    },
}

impl CredentialSource {
    /// Resolves the configured source by precedence. HMAC and legacy
    /// credentials without a TURN host+port are a configuration error.
    pub fn resolve(settings: &CredentialSettings) -> Result<Self, CredentialError> {
        if !settings.descriptor_path.as_os_str().is_empty() && settings.descriptor_path.exists() {
            tracing::info!(
                target: "credentials",
                path = %settings.descriptor_path.display(),
                "using descriptor file for RTC credentials"
            );
            return Ok(CredentialSource::StaticFile {
                path: settings.descriptor_path.clone(),
            });
        }
        if !settings.turn_shared_secret.is_empty() {
            let endpoint = settings.turn_endpoint().ok_or_else(|| {
                CredentialError::SourceConfig(
                    "TURN shared secret requires a TURN host and port".into(),
                )
            })?;
            return Ok(CredentialSource::Hmac {
                endpoint,
                shared_secret: settings.turn_shared_secret.clone(),
                username: settings.web_username.clone(),
            });
        }
        if !settings.turn_username.is_empty() && !settings.turn_password.is_empty() {
            let endpoint = settings.turn_endpoint().ok_or_else(|| {
                CredentialError::SourceConfig(
                    "static TURN credentials require a TURN host and port".into(),
                )
            })?;
            tracing::warn!(target: "credentials", "using legacy non-HMAC TURN credentials");
            return Ok(CredentialSource::LegacyStatic {
                endpoint,
                username: settings.turn_username.clone(),
                password: settings.turn_password.clone(),
            });
        }
        Ok(CredentialSource::Rest {
            uri: settings.web_uri.clone(),
            username: settings.web_username.clone(),
            auth_header_name: settings.auth_header_name.clone(),
        })
    }

    /// Synchronous startup fetch. For the REST source this performs blocking
    /// I/O; call it off the negotiation loop.
    pub fn initial_credentials(&self) -> Result<RtcCredentials, CredentialError> {
        match self {
            CredentialSource::StaticFile { path } => {
                let raw = fs::read_to_string(path)?;
                descriptor::decode(&raw)
            }
            CredentialSource::Hmac {
                endpoint,
                shared_secret,
                username,
            } => {
                let username =
                    descriptor::ephemeral_username(username, descriptor::EPHEMERAL_TTL);
                let raw = descriptor::encode_hmac(
                    &endpoint.host,
                    endpoint.port,
                    shared_secret,
                    &username,
                    endpoint.protocol,
                    endpoint.tls,
                )?;
                descriptor::decode(&raw)
            }
            CredentialSource::LegacyStatic {
                endpoint,
                username,
                password,
            } => {
                let raw = descriptor::encode_static(
                    &endpoint.host,
                    endpoint.port,
                    username,
                    password,
                    endpoint.protocol,
                    endpoint.tls,
                );
                descriptor::decode(&raw)
            }
            CredentialSource::Rest {
                uri,
                username,
                auth_header_name,
            } => RestCredentialClient::new(uri, username, auth_header_name)?.fetch(),
        }
    }
}
