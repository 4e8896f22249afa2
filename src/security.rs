//! Operator authorization.
//!
//! A single credential guards the actions that weaken blocking: stopping the
//! gateway, removing domains, editing an armed schedule. The credential is
//! stored as a salted SHA-256 digest; plaintext never touches disk or logs.
//! Every check and every change attempt is appended to a JSON-lines audit log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::StateError;
use crate::state;

/// Credential stored when none exists yet.
pub const DEFAULT_PASSWORD: &str = "admin123";

const SALT_LEN: usize = 16;

/// On-disk credential record.
///
/// Records without a salt hold a plain SHA-256 of the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl Credential {
    /// Derive a record for `password` with a fresh random salt.
    pub fn new(password: &str) -> Self {
        let salt: [u8; SALT_LEN] = rand::random();
        Self {
            password_hash: digest(&salt, password),
            salt: Some(hex::encode(salt)),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let salt = match self.salt.as_deref().map(hex::decode) {
            None => Vec::new(),
            Some(Ok(salt)) => salt,
            Some(Err(_)) => return false,
        };
        constant_time_eq(
            digest(&salt, candidate).as_bytes(),
            self.password_hash.to_ascii_lowercase().as_bytes(),
        )
    }
}

fn digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub event: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SecurityGate {
    credentials_path: PathBuf,
    audit_path: PathBuf,
}

impl SecurityGate {
    pub fn new(credentials_path: impl Into<PathBuf>, audit_path: impl Into<PathBuf>) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            audit_path: audit_path.into(),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    /// Check an operator-supplied password. Empty input always fails.
    pub fn authorize(&self, candidate: &str) -> bool {
        let result = self.check(candidate);
        self.audit("authorize", result.is_ok(), result.err());
        result.is_ok()
    }

    /// Replace the credential, provided `current` still validates.
    ///
    /// On failure the stored credential is untouched.
    pub fn change_credential(&self, current: &str, new: &str) -> bool {
        let result = self
            .check(current)
            .map_err(|reason| match reason {
                "invalid_password" => "invalid_current_password",
                other => other,
            })
            .and_then(|()| {
                if new.is_empty() {
                    return Err("empty_new_password");
                }
                self.store(&Credential::new(new)).map_err(|err| {
                    warn!(error = %err, "failed to store credential");
                    "write_failed"
                })
            });

        match result {
            Ok(()) => info!("credential changed"),
            Err(reason) => warn!(reason, "credential change refused"),
        }
        self.audit("change_password", result.is_ok(), result.err());
        result.is_ok()
    }

    fn check(&self, candidate: &str) -> Result<(), &'static str> {
        if candidate.is_empty() {
            return Err("empty_password");
        }
        let credential = self.load().ok_or("credential_unreadable")?;
        if credential.verify(candidate) {
            Ok(())
        } else {
            Err("invalid_password")
        }
    }

    /// Current credential, seeding the default one on first use.
    ///
    /// A corrupt store yields `None` so every check fails closed.
    fn load(&self) -> Option<Credential> {
        match state::try_read_json::<Credential>(&self.credentials_path) {
            Ok(Some(credential)) => Some(credential),
            Ok(None) => {
                let credential = Credential::new(DEFAULT_PASSWORD);
                if let Err(err) = self.store(&credential) {
                    warn!(error = %err, "failed to store default credential");
                }
                Some(credential)
            }
            Err(err) => {
                warn!(error = %err, "credential store unreadable");
                None
            }
        }
    }

    fn store(&self, credential: &Credential) -> Result<(), StateError> {
        state::write_json(&self.credentials_path, credential)
    }

    fn audit(&self, event: &str, success: bool, reason: Option<&str>) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            user: current_user(),
            event: event.to_string(),
            success,
            reason: reason.map(str::to_string),
        };
        if let Err(err) = append_line(&self.audit_path, &record) {
            warn!(error = %err, path = ?self.audit_path, "failed to write audit record");
        }
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn append_line(path: &Path, record: &AuditRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Parse every record of an audit log, skipping unreadable lines.
pub fn read_audit_log(path: &Path) -> Vec<AuditRecord> {
    std::fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()
        })
        .unwrap_or_default()
}
