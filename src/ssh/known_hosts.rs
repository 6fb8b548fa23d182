//! Backend host key store
//!
//! Memory-only trust-on-first-use cache for instance host keys. Instances are
//! rebuilt behind the same address, so a changed key is re-trusted with a
//! warning instead of failing the login.

use dashmap::DashMap;
use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::{debug, info, warn};

use super::keys::md5_fingerprint;

/// Outcome of checking a backend's host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    Verified,
    Unknown { fingerprint: String },
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Default)]
pub struct KnownHostsStore {
    hosts: DashMap<String, String>,
}

impl KnownHostsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        md5_fingerprint(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = Self::fingerprint(key);
        match self.hosts.get(&lookup_key) {
            Some(expected) if *expected == fingerprint => {
                debug!("Host key verified for {}", lookup_key);
                HostKeyVerification::Verified
            }
            Some(expected) => HostKeyVerification::Changed {
                expected_fingerprint: expected.clone(),
                actual_fingerprint: fingerprint,
            },
            None => HostKeyVerification::Unknown { fingerprint },
        }
    }

    /// Check a key and trust it, returning whether the connection may proceed.
    pub fn check_and_trust(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match self.verify(host, port, key) {
            HostKeyVerification::Verified => {}
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "TOFU: Trusting host key for {}:{} (fingerprint: {})",
                    host, port, fingerprint
                );
                self.hosts.insert(Self::make_key(host, port), fingerprint);
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "Host key changed for {}:{} (expected {}, got {}), instance was likely rebuilt",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                self.hosts
                    .insert(Self::make_key(host, port), actual_fingerprint);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
