//! Client for a credential web service that mints relay credentials per
//! caller, keyed by a username header.

use std::time::Duration;

use crate::descriptor::{self, RtcCredentials};
use crate::error::CredentialError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking client; adapters run it on their own worker thread, never on the
/// negotiation loop.
pub struct RestCredentialClient {
    client: reqwest::blocking::Client,
    uri: String,
    username: String,
    auth_header_name: String,
}

impl RestCredentialClient {
    pub fn new(
        uri: impl Into<String>,
        username: impl Into<String>,
        auth_header_name: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            uri: uri.into(),
            username: username.into(),
            auth_header_name: auth_header_name.into(),
        })
    }

    /// One GET carrying `{auth_header_name: username}`. Status >= 400 and
    /// empty bodies are fetch errors preserving what the service said;
    /// anything else is decoded as a descriptor document.
    pub fn fetch(&self) -> Result<RtcCredentials, CredentialError> {
        let response = self
            .client
            .get(&self.uri)
            .header(self.auth_header_name.as_str(), self.username.as_str())
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if status.as_u16() >= 400 {
            return Err(CredentialError::FetchStatus {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
                body,
            });
        }
        if body.is_empty() {
            return Err(CredentialError::FetchEmpty);
        }
        descriptor::decode(&body)
    }
}
