use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::TokenCipher;

/// Remote-desktop protocols guacd can drive on our behalf.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Rdp,
    Vnc,
    Ssh,
    Telnet,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Rdp => "rdp",
            ProtocolKind::Vnc => "vnc",
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::Telnet => "telnet",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rdp" => Some(ProtocolKind::Rdp),
            "vnc" => Some(ProtocolKind::Vnc),
            "ssh" => Some(ProtocolKind::Ssh),
            "telnet" => Some(ProtocolKind::Telnet),
            _ => None,
        }
    }
}

/// Client-preferred handshake parameters carried inside the token.
///
/// These feed the `size`/`audio`/`video`/`image`/`timezone` instructions sent
/// to guacd between `args` and `connect`. Everything is optional; the
/// handshake falls back to protocol defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HandshakeOverrides {
    #[serde(rename = "GUAC_WIDTH", default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(rename = "GUAC_HEIGHT", default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(rename = "GUAC_DPI", default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    #[serde(rename = "GUAC_AUDIO", default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<String>,
    #[serde(rename = "GUAC_VIDEO", default, skip_serializing_if = "Vec::is_empty")]
    pub video: Vec<String>,
    #[serde(rename = "GUAC_IMAGE", default, skip_serializing_if = "Vec::is_empty")]
    pub image: Vec<String>,
    #[serde(rename = "GUAC_TIMEZONE", default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl HandshakeOverrides {
    pub fn is_empty(&self) -> bool {
        *self == HandshakeOverrides::default()
    }
}

/// The `connection` object of the decrypted token payload.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    #[serde(rename = "type")]
    pub kind: ProtocolKind,
    pub settings: HashMap<String, String>,
    /// Identifier of an existing guacd session to join instead of opening a
    /// fresh one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    #[serde(skip_serializing_if = "HandshakeOverrides::is_empty")]
    pub guac: HandshakeOverrides,
}

/// Everything the token authorizes for one session.
///
/// Unknown top-level payload fields end up in `extra` and survive an
/// encrypt/decrypt round-trip untouched; the session hook may inspect them.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub connection: ConnectionDescriptor,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionSettings {
    pub fn new(kind: ProtocolKind, settings: HashMap<String, String>) -> Self {
        Self {
            connection: ConnectionDescriptor {
                kind,
                settings,
                join: None,
                guac: HandshakeOverrides::default(),
            },
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CryptOptions {
    pub cypher: String,
    pub key: [u8; 32],
}

/// Per-server knobs for the browser-facing side.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub crypt: CryptOptions,
    pub max_inactivity: Duration,
}

/// Per-server knobs for the guacd-facing side.
#[derive(Debug, Clone)]
pub struct GuacdOptions {
    pub host: String,
    pub port: u16,
    pub connection_timeout: Duration,
}

impl GuacdOptions {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the upgrade request looked like, for the settings hook.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
}

#[derive(Debug, Error)]
#[error("connection refused: {reason}")]
pub struct ConnectionRefused {
    pub reason: String,
}

/// Authorization extension point, invoked once per session after token
/// decryption and before the guacd dial. Implementations may rewrite the
/// connection settings but must keep the connection type intact.
pub trait ProcessConnectionSettings: Send + Sync {
    fn decide(
        &self,
        settings: ConnectionSettings,
        request: &ConnectionRequest,
    ) -> Result<ConnectionSettings, ConnectionRefused>;
}

/// Default hook: every decrypted token is accepted as-is.
pub struct AcceptAll;

impl ProcessConnectionSettings for AcceptAll {
    fn decide(
        &self,
        settings: ConnectionSettings,
        _request: &ConnectionRequest,
    ) -> Result<ConnectionSettings, ConnectionRefused> {
        Ok(settings)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cipher: Arc<TokenCipher>,
    pub client: Arc<ClientOptions>,
    pub guacd: Arc<GuacdOptions>,
    pub hook: Arc<dyn ProcessConnectionSettings>,
}
