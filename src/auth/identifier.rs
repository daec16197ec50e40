//! Public key and bunker URL validation
//!
//! Checks here are shape checks only. An `npub` is accepted on length and
//! prefix; the bech32 checksum is left to whoever decodes it (the backend,
//! or `to_public_key` when a real key is needed locally).

use std::fmt;

use nostr::prelude::*;
use ::url::Url;

use super::error::{AuthError, AuthResult};

const HEX_KEY_LEN: usize = 64;
const NPUB_LEN: usize = 63;

fn is_hex_key(input: &str) -> bool {
    input.len() == HEX_KEY_LEN && input.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_npub(input: &str) -> bool {
    input.starts_with("npub") && input.len() == NPUB_LEN
}

/// True iff `input` looks like a 64-char hex key or a 63-char `npub`
pub fn validate_public_key(input: &str) -> bool {
    is_hex_key(input) || is_npub(input)
}

/// A user-supplied public key, kept in the form it was entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyIdentifier {
    /// Lowercase 64-char hex
    Hex(String),
    /// bech32 `npub1...`, checksum not yet verified
    Npub(String),
}

impl PublicKeyIdentifier {
    pub fn parse(input: &str) -> AuthResult<Self> {
        let input = input.trim();
        if is_hex_key(input) {
            Ok(Self::Hex(input.to_ascii_lowercase()))
        } else if is_npub(input) {
            Ok(Self::Npub(input.to_string()))
        } else {
            Err(AuthError::invalid(
                "public key must be 64 hex characters or an npub",
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Hex(s) | Self::Npub(s) => s,
        }
    }

    /// Decode into a real key. For `npub` this is where the checksum is checked.
    pub fn to_public_key(&self) -> AuthResult<PublicKey> {
        let parsed = match self {
            Self::Hex(hex) => PublicKey::from_hex(hex).map_err(|e| e.to_string()),
            Self::Npub(npub) => PublicKey::from_bech32(npub).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| AuthError::invalid(format!("not a valid public key: {}", e)))
    }

    /// The single canonical hex form of this key
    pub fn canonical_hex(&self) -> AuthResult<String> {
        match self {
            Self::Hex(hex) => Ok(hex.clone()),
            Self::Npub(_) => Ok(self.to_public_key()?.to_hex()),
        }
    }
}

impl From<PublicKey> for PublicKeyIdentifier {
    fn from(pk: PublicKey) -> Self {
        Self::Hex(pk.to_hex())
    }
}

impl fmt::Display for PublicKeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `bunker://<pubkey>?relay=wss://...&secret=TOKEN`
///
/// Only constructible through [`parse_bunker_url`], so a descriptor always
/// has a 64-hex remote signer key and at least one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerDescriptor {
    remote_signer_pubkey: String,
    relay: String,
    extra_relays: Vec<String>,
    secret: Option<String>,
}

impl BunkerDescriptor {
    /// Remote signer key, lowercase hex
    pub fn remote_signer_pubkey(&self) -> &str {
        &self.remote_signer_pubkey
    }

    /// Primary relay (the first `relay` parameter)
    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn relays(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.relay.as_str()).chain(self.extra_relays.iter().map(String::as_str))
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn remote_signer(&self) -> PublicKeyIdentifier {
        PublicKeyIdentifier::Hex(self.remote_signer_pubkey.clone())
    }

    /// Rebuild a normalized `bunker://` URI
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in self.relays() {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        format!("bunker://{}?{}", self.remote_signer_pubkey, query.finish())
    }

    pub fn to_nostr_connect_uri(&self) -> AuthResult<NostrConnectURI> {
        let remote_signer_public_key = PublicKey::from_hex(&self.remote_signer_pubkey)
            .map_err(|e| AuthError::invalid(format!("bunker public key is not a valid key: {}", e)))?;
        let relays = self
            .relays()
            .map(|r| {
                RelayUrl::parse(r)
                    .map_err(|e| AuthError::invalid(format!("invalid relay URL {}: {}", r, e)))
            })
            .collect::<AuthResult<Vec<_>>>()?;

        Ok(NostrConnectURI::Bunker {
            remote_signer_public_key,
            relays,
            secret: self.secret.clone(),
        })
    }
}

fn parse_relay(raw: &str) -> AuthResult<String> {
    let url = Url::parse(raw)
        .map_err(|_| AuthError::invalid(format!("relay is not a valid URL: {}", raw)))?;
    match url.scheme() {
        "wss" | "ws" if url.host_str().is_some() => Ok(raw.to_string()),
        _ => Err(AuthError::invalid(format!(
            "relay must be a wss:// URL, got {}",
            raw
        ))),
    }
}

/// Parse a `bunker://` URL. Any missing or malformed component is an error.
pub fn parse_bunker_url(input: &str) -> AuthResult<BunkerDescriptor> {
    let url = Url::parse(input.trim())
        .map_err(|_| AuthError::invalid("bunker URL is not a valid URL"))?;

    if url.scheme() != "bunker" {
        return Err(AuthError::invalid("expected a bunker:// URL"));
    }

    let host = url.host_str().unwrap_or_default();
    if !is_hex_key(host) {
        return Err(AuthError::invalid(
            "bunker URL must carry a 64-character hex public key",
        ));
    }

    let mut relays = Vec::new();
    let mut secret = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "relay" => relays.push(parse_relay(&value)?),
            "secret" if !value.is_empty() => secret = Some(value.into_owned()),
            _ => {}
        }
    }

    let mut relays = relays.into_iter();
    let relay = relays
        .next()
        .ok_or_else(|| AuthError::invalid("bunker URL is missing a relay parameter"))?;

    Ok(BunkerDescriptor {
        remote_signer_pubkey: host.to_ascii_lowercase(),
        relay,
        extra_relays: relays.collect(),
        secret,
    })
}

/// What kind of identifier a free-form string is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    HexKey,
    Npub,
    BunkerUrl,
    Unknown,
}

pub fn classify(input: &str) -> IdentifierKind {
    let input = input.trim();
    if is_hex_key(input) {
        IdentifierKind::HexKey
    } else if is_npub(input) {
        IdentifierKind::Npub
    } else if parse_bunker_url(input).is_ok() {
        IdentifierKind::BunkerUrl
    } else {
        IdentifierKind::Unknown
    }
}
