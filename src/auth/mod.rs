//! Remote signer sign-in
//!
//! Validates identifiers, drives the external-signer and NIP-46 bunker
//! transports, and exchanges the resulting public key for a backend session.

pub mod audit;
pub mod bunker;
pub mod callback;
pub mod config;
pub mod error;
pub mod flow;
pub mod identifier;
pub mod method;
pub mod navigator;
pub mod session;
pub mod settings;
pub mod transport;

pub use audit::AuditLog;
pub use bunker::NostrConnectConnector;
pub use config::RememberedBunker;
pub use flow::{AuthFlowController, FlowOutcome};
pub use identifier::{classify, IdentifierKind, PublicKeyIdentifier};
pub use method::AuthMethod;
pub use navigator::{Navigator, PageEvent};
pub use session::{HttpSessionApi, SessionApi};
pub use settings::FlowSettings;
pub use transport::TransportSelector;
