//! NAT-traversal credential plumbing for the farcast gateway.
//!
//! Covers the full life of an ICE-server descriptor: parsing and generating
//! the JSON documents viewers receive, selecting the one credential source a
//! process runs with, and keeping credentials fresh in the background while
//! the negotiation loop stays unblocked.

pub mod descriptor;
pub mod error;
pub mod monitor;
pub mod rest;
pub mod source;

pub use descriptor::{
    DEFAULT_DESCRIPTOR, EPHEMERAL_TTL, IceServerDescriptor, IceServerEntry, PUBLIC_STUN_URL,
    RtcCredentials, StunUri, TurnProtocol, TurnUri, decode, encode_hmac, encode_static,
    ephemeral_credential, ephemeral_username,
};
pub use error::CredentialError;
pub use monitor::{
    CredentialMonitor, FileWatchAdapter, HmacPoller, PollerHandle, RestPoller, WatchHandle,
};
pub use rest::RestCredentialClient;
pub use source::{CredentialSettings, CredentialSource, TurnEndpoint};
