//! Sign-in audit trail
//!
//! One JSON object per line in `auth.audit.jsonl` under the state directory.
//! Each line says which method was tried, for which key, and how it ended.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::AuthError;
use super::identifier::{BunkerDescriptor, PublicKeyIdentifier};
use super::method::AuthMethod;
use super::session::Session;

const AUDIT_FILE: &str = "auth.audit.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    LoginAttempt,
    LoginSuccess,
    LoginFailed,
    BunkerConnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub operation: AuditOperation,
    pub method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Session mode granted by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    fn new(operation: AuditOperation, method: AuthMethod) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation,
            method,
            public_key: None,
            mode: None,
            remote_signer: None,
            error: None,
        }
    }
}

pub struct AuditLog {
    /// `None` drops every entry
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: Some(state_dir.join(AUDIT_FILE)),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record_attempt(&mut self, method: AuthMethod) {
        self.append(AuditEntry::new(AuditOperation::LoginAttempt, method));
    }

    pub fn record_success(&mut self, method: AuthMethod, session: &Session) {
        let mut entry = AuditEntry::new(AuditOperation::LoginSuccess, method);
        entry.public_key = Some(session.public_key.clone());
        entry.mode = Some(session.mode.clone());
        self.append(entry);
    }

    pub fn record_failure(&mut self, method: AuthMethod, error: &AuthError) {
        let mut entry = AuditEntry::new(AuditOperation::LoginFailed, method);
        entry.error = Some(error.to_string());
        self.append(entry);
    }

    pub fn record_bunker_connect(
        &mut self,
        descriptor: &BunkerDescriptor,
        user_pubkey: &PublicKeyIdentifier,
    ) {
        let mut entry = AuditEntry::new(AuditOperation::BunkerConnect, AuthMethod::Bunker);
        entry.public_key = Some(user_pubkey.as_str().to_string());
        entry.remote_signer = Some(descriptor.remote_signer_pubkey().to_string());
        self.append(entry);
    }

    /// Best-effort: a sign-in never fails because the audit write did
    fn append(&mut self, entry: AuditEntry) {
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_string(&entry)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = written {
            warn!("Could not write audit entry to {}: {}", path.display(), e);
        }
    }

    /// All readable entries, oldest first. Lines that do not parse are skipped.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path).context("Failed to open audit log")?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read audit log")?;
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable audit line: {}", e),
            }
        }
        Ok(entries)
    }

    /// The most recent successful sign-in
    pub fn last_success(&self) -> Result<Option<AuditEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.operation == AuditOperation::LoginSuccess))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identifier::parse_bunker_url;
    use crate::auth::session::Capabilities;

    const KEY: &str = "79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3";

    fn session(mode: &str) -> Session {
        Session {
            public_key: KEY.to_string(),
            mode: mode.to_string(),
            capabilities: Capabilities::default(),
        }
    }

    #[test]
    fn test_entries_carry_method_and_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path());
        log.record_attempt(AuthMethod::ReadOnly);
        log.record_failure(AuthMethod::ReadOnly, &AuthError::LoginFailed("key banned".into()));
        log.record_success(AuthMethod::ExternalSigner, &session("write"));

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].operation, AuditOperation::LoginAttempt);
        assert_eq!(entries[0].method, AuthMethod::ReadOnly);
        assert_eq!(entries[0].public_key, None);

        assert_eq!(entries[1].operation, AuditOperation::LoginFailed);
        assert_eq!(entries[1].error.as_deref(), Some("Login failed: key banned"));

        assert_eq!(entries[2].method, AuthMethod::ExternalSigner);
        assert_eq!(entries[2].public_key.as_deref(), Some(KEY));
        assert_eq!(entries[2].mode.as_deref(), Some("write"));
    }

    #[test]
    fn test_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path());
        log.record_attempt(AuthMethod::PrivateKey);

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["operation"], "login_attempt");
        assert_eq!(line["method"], "private_key");
        assert!(line.get("error").is_none());
    }

    #[test]
    fn test_bunker_connect_names_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path());
        let signer = "a".repeat(64);
        let descriptor =
            parse_bunker_url(&format!("bunker://{}?relay=wss://relay.nsec.app", signer)).unwrap();
        let user = PublicKeyIdentifier::parse(KEY).unwrap();
        log.record_bunker_connect(&descriptor, &user);

        let entry = &log.entries().unwrap()[0];
        assert_eq!(entry.operation, AuditOperation::BunkerConnect);
        assert_eq!(entry.method, AuthMethod::Bunker);
        assert_eq!(entry.remote_signer.as_deref(), Some(signer.as_str()));
        assert_eq!(entry.public_key.as_deref(), Some(KEY));
    }

    #[test]
    fn test_last_success_skips_later_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path());
        assert_eq!(log.last_success().unwrap(), None);

        log.record_success(AuthMethod::ReadOnly, &session("read_only"));
        log.record_failure(AuthMethod::Bunker, &AuthError::NetworkError("down".into()));
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path().unwrap())
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();

        let last = log.last_success().unwrap().unwrap();
        assert_eq!(last.method, AuthMethod::ReadOnly);
        assert_eq!(last.mode.as_deref(), Some("read_only"));
    }

    #[test]
    fn test_disabled_log_keeps_nothing() {
        let mut log = AuditLog::disabled();
        log.record_attempt(AuthMethod::Extension);
        assert!(log.path().is_none());
        assert!(log.entries().unwrap().is_empty());
    }
}
