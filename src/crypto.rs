use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::prelude::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    ConnectionDescriptor, ConnectionSettings, CryptOptions, HandshakeOverrides, ProtocolKind,
};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const CIPHER_NAME: &str = "AES-256-CBC";

const BLOCK_SIZE: usize = 16;

/// Token validation failures, one variant per rung of the ladder.
///
/// Display strings double as WebSocket close reasons, so they name the kind
/// of failure and nothing else; underlying cipher or serde messages stay out.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    MalformedToken,
    #[error("invalid iv")]
    InvalidIV,
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("decrypt failed")]
    DecryptFailed,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("malformed payload")]
    MalformedPayload,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
}

/// On-the-wire shape of a token: a fresh IV and the AES-256-CBC ciphertext
/// of the JSON payload, both base64. The outer container is itself JSON,
/// URL-safe base64 encoded for transport in the upgrade URL.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenEnvelope {
    iv: String,
    value: String,
}

/// Stateless token encrypt/decrypt under the configured key. Cheap to share
/// across sessions; holds nothing but the key.
#[derive(Debug)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    pub fn new(crypt: &CryptOptions) -> Result<Self, TokenError> {
        if crypt.cypher != CIPHER_NAME {
            return Err(TokenError::UnsupportedCipher(crypt.cypher.clone()));
        }
        Ok(Self { key: crypt.key })
    }

    /// Decrypt and validate a connection token from the upgrade URL.
    pub fn decrypt(&self, token_text: &str) -> Result<ConnectionSettings, TokenError> {
        let outer = BASE64_URL_SAFE
            .decode(token_text)
            .map_err(|_| TokenError::MalformedToken)?;
        if outer.is_empty() {
            return Err(TokenError::MalformedToken);
        }

        let envelope: TokenEnvelope =
            serde_json::from_slice(&outer).map_err(|_| TokenError::MalformedToken)?;
        let iv = BASE64_STANDARD
            .decode(&envelope.iv)
            .map_err(|_| TokenError::MalformedToken)?;
        let value = BASE64_STANDARD
            .decode(&envelope.value)
            .map_err(|_| TokenError::MalformedToken)?;

        if iv.len() != BLOCK_SIZE {
            return Err(TokenError::InvalidIV);
        }
        if value.is_empty() || value.len() % BLOCK_SIZE != 0 {
            return Err(TokenError::InvalidCiphertext);
        }

        let plain = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|_| TokenError::DecryptFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>(&value)
            .map_err(|_| TokenError::InvalidPadding)?;

        let payload: Value =
            serde_json::from_slice(&plain).map_err(|_| TokenError::MalformedPayload)?;
        settings_from_payload(payload)
    }

    /// Inverse of [`decrypt`](Self::decrypt), for token-issuing tooling.
    pub fn encrypt(&self, settings: &ConnectionSettings) -> Result<String, TokenError> {
        let plain = serde_json::to_vec(settings).map_err(|_| TokenError::MalformedPayload)?;

        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let value = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|_| TokenError::DecryptFailed)?
            .encrypt_padded_vec_mut::<Pkcs7>(&plain);

        let envelope = TokenEnvelope {
            iv: BASE64_STANDARD.encode(iv),
            value: BASE64_STANDARD.encode(value),
        };
        let outer = serde_json::to_vec(&envelope).map_err(|_| TokenError::MalformedPayload)?;
        Ok(BASE64_URL_SAFE.encode(outer))
    }
}

/// Field-by-field validation of the decrypted payload. Serde could derive
/// this, but each field violation must name the offending field instead of
/// surfacing an aggregated parse message.
fn settings_from_payload(payload: Value) -> Result<ConnectionSettings, TokenError> {
    let Value::Object(mut top) = payload else {
        return Err(TokenError::InvalidSettings("payload".into()));
    };

    let Some(Value::Object(conn)) = top.remove("connection") else {
        return Err(TokenError::InvalidSettings("connection".into()));
    };

    let kind = conn
        .get("type")
        .and_then(Value::as_str)
        .and_then(ProtocolKind::from_name)
        .ok_or_else(|| TokenError::InvalidSettings("connection.type".into()))?;

    let Some(Value::Object(raw_settings)) = conn.get("settings") else {
        return Err(TokenError::InvalidSettings("connection.settings".into()));
    };
    let mut settings = std::collections::HashMap::with_capacity(raw_settings.len());
    for (name, value) in raw_settings {
        let Value::String(value) = value else {
            return Err(TokenError::InvalidSettings(format!(
                "connection.settings.{name}"
            )));
        };
        settings.insert(name.clone(), value.clone());
    }

    let join = match conn.get("join") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => return Err(TokenError::InvalidSettings("connection.join".into())),
    };

    let guac = match conn.get("guac") {
        None => HandshakeOverrides::default(),
        Some(overrides) => serde_json::from_value(overrides.clone())
            .map_err(|_| TokenError::InvalidSettings("connection.guac".into()))?,
    };

    Ok(ConnectionSettings {
        connection: ConnectionDescriptor {
            kind,
            settings,
            join,
            guac,
        },
        // Whatever else the issuer put at the top level rides along untouched.
        extra: top,
    })
}
