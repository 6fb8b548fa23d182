//! Public key helpers
//!
//! Authorized-key lines are compared by their base64 body only, so the key
//! type and trailing comment never take part in matching.

use base64::Engine;
use md5::{Digest, Md5};
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};

/// Extract the base64 body of an OpenSSH public key line.
///
/// `"AAAA"` -> `"AAAA"`
/// `"ssh-rsa AAAA"` -> `"AAAA"`
/// `"ssh-rsa AAAA user@host"` -> `"AAAA"`
pub fn public_key_body(line: &str) -> &str {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.len() {
        0 => "",
        1 => fields[0],
        2 => fields[1],
        _ => fields[1],
    }
}

/// Base64 body of a key offered during authentication.
pub fn offered_key_body(key: &PublicKey) -> String {
    key.public_key_base64()
}

/// Find the authorized entry whose body matches the offered body exactly.
/// The whole entry is returned, type and comment included.
pub fn find_authorized<'a>(authorized: &'a [String], offered_body: &str) -> Option<&'a String> {
    authorized.iter().find(|line| {
        let body = public_key_body(line);
        !body.is_empty() && body == offered_body
    })
}

/// MD5 fingerprint of a raw key blob as colon-delimited hex.
pub fn md5_fingerprint(blob: &[u8]) -> String {
    let digest = Md5::digest(blob);
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprint of a base64 body, `None` when the body does not decode.
pub fn body_fingerprint(body: &str) -> Option<String> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .ok()
        .map(|blob| md5_fingerprint(&blob))
}

pub fn private_key_fingerprint(key: &PrivateKey) -> String {
    md5_fingerprint(&key.public_key().public_key_bytes())
}

/// Keep the first five characters of a password for operator logs and mask
/// the rest, one `*` per hidden character.
pub fn redact_password(password: &str) -> String {
    let visible: String = password.chars().take(5).collect();
    let hidden = password.chars().count().saturating_sub(5);
    format!("{}{}", visible, "*".repeat(hidden))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_body_fields() {
        assert_eq!(public_key_body("AAAAB3Nza"), "AAAAB3Nza");
        assert_eq!(public_key_body("ssh-rsa AAAAB3Nza"), "AAAAB3Nza");
        assert_eq!(public_key_body("ssh-rsa AAAAB3Nza deploy@laptop"), "AAAAB3Nza");
        assert_eq!(public_key_body("ssh-ed25519  AAAAC3 a b c"), "AAAAC3");
        assert_eq!(public_key_body("   "), "");
    }

    #[test]
    fn test_find_authorized_exact_match() {
        let keys = vec![
            "ssh-rsa AAAAfirst alice@a".to_string(),
            "ssh-ed25519 AAAAsecond".to_string(),
        ];
        assert_eq!(
            find_authorized(&keys, "AAAAsecond").map(String::as_str),
            Some("ssh-ed25519 AAAAsecond")
        );
        assert_eq!(
            find_authorized(&keys, "AAAAfirst").map(String::as_str),
            Some("ssh-rsa AAAAfirst alice@a")
        );
        assert_eq!(find_authorized(&keys, "AAAAsec"), None);
        assert_eq!(find_authorized(&keys, ""), None);
    }

    #[test]
    fn test_md5_fingerprint_format() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(
            md5_fingerprint(b""),
            "d4:1d:8c:d9:8f:00:b2:04:e9:80:09:98:ec:f8:42:7e"
        );
        assert!(body_fingerprint("not base64 !!").is_none());
    }

    #[test]
    fn test_redact_password() {
        assert_eq!(redact_password("hunter22"), "hunte***");
        assert_eq!(redact_password("hunter2secret"), "hunte********");
        assert_eq!(redact_password("hunte"), "hunte");
        assert_eq!(redact_password("abc"), "abc");
    }
}
