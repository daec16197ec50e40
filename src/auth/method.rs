//! Sign-in methods and how each one signs

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the user chose to sign in. Fixed for the lifetime of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Extension,
    ExternalSigner,
    Bunker,
    ReadOnly,
    PrivateKey,
}

impl AuthMethod {
    /// Someone other than this client holds the private key
    pub fn is_signer_backed(self) -> bool {
        matches!(self, Self::Extension | Self::ExternalSigner | Self::Bunker)
    }

    /// The method form asks for text before it can start
    pub fn needs_input(self) -> bool {
        matches!(self, Self::Bunker | Self::ReadOnly | Self::PrivateKey)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Extension => "browser extension",
            Self::ExternalSigner => "external signer",
            Self::Bunker => "NIP-46 bunker",
            Self::ReadOnly => "read-only",
            Self::PrivateKey => "private key",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `signing_method` as the session API knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    BrowserExtension,
    Amber,
    Bunker,
    PrivateKey,
    None,
}

impl SigningMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrowserExtension => "browser_extension",
            Self::Amber => "amber",
            Self::Bunker => "bunker",
            Self::PrivateKey => "private_key",
            Self::None => "none",
        }
    }
}

/// `requested_mode` as the session API knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedMode {
    Write,
    ReadOnly,
}

impl RequestedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::ReadOnly => "read_only",
        }
    }
}
