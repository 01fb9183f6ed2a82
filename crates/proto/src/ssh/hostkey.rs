//! Server host key verification (RFC 4253 Section 6.6, RFC 5656, RFC 8332, RFC 8709).
//!
//! The client never signs with a host key; it only checks the server's
//! signature over the exchange hash. Each supported algorithm provides a
//! [`VerifyFn`] that parses the key blob and signature blob and verifies.
//!
//! | Algorithm              | Key blob                      | Backend         |
//! |------------------------|-------------------------------|-----------------|
//! | `ssh-ed25519`          | string name, string key[32]   | `ed25519-dalek` |
//! | `ecdsa-sha2-nistp256`  | string name, string curve, Q  | `ring`          |
//! | `ecdsa-sha2-nistp384`  | string name, string curve, Q  | `ring`          |
//! | `rsa-sha2-256/512`     | string "ssh-rsa", mpint e, n  | `ring`          |
//! | `ssh-rsa`              | string "ssh-rsa", mpint e, n  | `ring` (SHA-1)  |

use crate::ssh::error::{Error, Result};
use crate::ssh::wire::{self, Reader};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use ring::signature::{self, RsaPublicKeyComponents, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Verifies `signature_blob` over `data` with the public key in `key_blob`.
pub type VerifyFn = fn(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()>;

/// Application hook deciding whether a server host key is acceptable.
///
/// Invoked once per key exchange, after the signature has been verified.
pub type HostKeyCallback = Arc<dyn Fn(&HostKeyInfo) -> bool + Send + Sync>;

/// Host key presented by the server during a key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    /// Negotiated host key algorithm
    pub algorithm: String,
    /// Key blob as sent by the server (K_S)
    pub key_blob: Vec<u8>,
    /// OpenSSH-style fingerprint, `SHA256:<base64>`
    pub fingerprint: String,
}

impl HostKeyInfo {
    /// Builds the info for a key blob.
    pub fn new(algorithm: &str, key_blob: &[u8]) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            key_blob: key_blob.to_vec(),
            fingerprint: fingerprint_sha256(key_blob),
        }
    }
}

/// OpenSSH-style SHA-256 fingerprint of a key blob.
pub fn fingerprint_sha256(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

fn verification(msg: impl Into<String>) -> Error {
    Error::HostKeyVerification(msg.into())
}

/// Splits a signature blob into its algorithm name and raw signature.
fn parse_signature_blob<'a>(blob: &'a [u8], expected: &[&str]) -> Result<&'a [u8]> {
    let mut r = Reader::new(blob);
    let name = r
        .read_string()
        .map_err(|_| verification("malformed signature blob"))?;
    if !expected.iter().any(|e| e.as_bytes() == name) {
        return Err(verification(format!(
            "signature algorithm '{}' does not match '{}'",
            String::from_utf8_lossy(name),
            expected.join("|")
        )));
    }
    r.read_string()
        .map_err(|_| verification("malformed signature blob"))
}

/// Builds an `ssh-ed25519` key blob.
pub fn ed25519_key_blob(public_key: &[u8; 32]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_string(&mut buf, b"ssh-ed25519");
    wire::put_string(&mut buf, public_key);
    buf.to_vec()
}

/// Builds an `ssh-ed25519` signature blob.
pub fn ed25519_signature_blob(signature: &[u8; 64]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_string(&mut buf, b"ssh-ed25519");
    wire::put_string(&mut buf, signature);
    buf.to_vec()
}

/// `ssh-ed25519`
pub fn verify_ed25519(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    let mut r = Reader::new(key_blob);
    let name = r.read_string().map_err(|_| verification("malformed key blob"))?;
    if name != b"ssh-ed25519" {
        return Err(verification("key blob is not ssh-ed25519"));
    }
    let key: [u8; 32] = r
        .read_string()
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| verification("Ed25519 public key must be 32 bytes"))?;

    let sig: [u8; 64] = parse_signature_blob(signature_blob, &["ssh-ed25519"])?
        .try_into()
        .map_err(|_| verification("Ed25519 signature must be 64 bytes"))?;

    let verifying_key = VerifyingKey::from_bytes(&key)
        .map_err(|e| verification(format!("Invalid Ed25519 public key: {}", e)))?;
    verifying_key
        .verify(data, &Signature::from_bytes(&sig))
        .map_err(|_| verification("Ed25519 signature mismatch"))
}

fn parse_rsa_key(key_blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut r = Reader::new(key_blob);
    let name = r.read_string().map_err(|_| verification("malformed key blob"))?;
    if name != b"ssh-rsa" {
        return Err(verification("key blob is not ssh-rsa"));
    }
    let e = r.read_mpint().map_err(|_| verification("malformed RSA exponent"))?;
    let n = r.read_mpint().map_err(|_| verification("malformed RSA modulus"))?;
    Ok((n.to_vec(), e.to_vec()))
}

fn verify_rsa(
    key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
    sig_name: &str,
    params: &'static signature::RsaParameters,
) -> Result<()> {
    let (n, e) = parse_rsa_key(key_blob)?;
    let sig = parse_signature_blob(signature_blob, &[sig_name])?;
    RsaPublicKeyComponents { n: &n, e: &e }
        .verify(params, data, sig)
        .map_err(|_| verification(format!("{} signature mismatch", sig_name)))
}

/// `rsa-sha2-256`
pub fn verify_rsa_sha256(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    verify_rsa(
        key_blob,
        data,
        signature_blob,
        "rsa-sha2-256",
        &signature::RSA_PKCS1_2048_8192_SHA256,
    )
}

/// `rsa-sha2-512`
pub fn verify_rsa_sha512(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    verify_rsa(
        key_blob,
        data,
        signature_blob,
        "rsa-sha2-512",
        &signature::RSA_PKCS1_2048_8192_SHA512,
    )
}

/// `ssh-rsa` (SHA-1 signatures, legacy servers only)
pub fn verify_ssh_rsa(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    verify_rsa(
        key_blob,
        data,
        signature_blob,
        "ssh-rsa",
        &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    )
}

fn verify_ecdsa(
    key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
    name: &str,
    curve: &str,
    scalar_len: usize,
    algorithm: &'static signature::EcdsaVerificationAlgorithm,
) -> Result<()> {
    let mut r = Reader::new(key_blob);
    let blob_name = r.read_string().map_err(|_| verification("malformed key blob"))?;
    let blob_curve = r.read_string().map_err(|_| verification("malformed key blob"))?;
    if blob_name != name.as_bytes() || blob_curve != curve.as_bytes() {
        return Err(verification(format!("key blob is not {}", name)));
    }
    let point = r.read_string().map_err(|_| verification("malformed EC point"))?;

    // Signature is string(mpint r || mpint s); ring wants fixed-width r || s
    let sig = parse_signature_blob(signature_blob, &[name])?;
    let mut sr = Reader::new(sig);
    let mut fixed = vec![0u8; 2 * scalar_len];
    for half in 0..2 {
        let scalar = sr
            .read_mpint()
            .map_err(|_| verification("malformed ECDSA signature"))?;
        if scalar.len() > scalar_len {
            return Err(verification("ECDSA signature scalar too large"));
        }
        let end = (half + 1) * scalar_len;
        fixed[end - scalar.len()..end].copy_from_slice(scalar);
    }

    UnparsedPublicKey::new(algorithm, point)
        .verify(data, &fixed)
        .map_err(|_| verification(format!("{} signature mismatch", name)))
}

/// `ecdsa-sha2-nistp256`
pub fn verify_ecdsa_p256(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    verify_ecdsa(
        key_blob,
        data,
        signature_blob,
        "ecdsa-sha2-nistp256",
        "nistp256",
        32,
        &signature::ECDSA_P256_SHA256_FIXED,
    )
}

/// `ecdsa-sha2-nistp384`
pub fn verify_ecdsa_p384(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    verify_ecdsa(
        key_blob,
        data,
        signature_blob,
        "ecdsa-sha2-nistp384",
        "nistp384",
        48,
        &signature::ECDSA_P384_SHA384_FIXED,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

    fn ed25519_pair() -> (SigningKey, Vec<u8>) {
        let signing = SigningKey::from_bytes(&[0x5a; 32]);
        let blob = ed25519_key_blob(signing.verifying_key().as_bytes());
        (signing, blob)
    }

    #[test]
    fn test_ed25519_verify() {
        let (signing, blob) = ed25519_pair();
        let sig = ed25519_signature_blob(&signing.sign(b"exchange hash").to_bytes());

        assert!(verify_ed25519(&blob, b"exchange hash", &sig).is_ok());
        assert!(matches!(
            verify_ed25519(&blob, b"other hash", &sig),
            Err(Error::HostKeyVerification(_))
        ));
    }

    #[test]
    fn test_ed25519_wrong_signature_name() {
        let (signing, blob) = ed25519_pair();
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, b"ssh-rsa");
        wire::put_string(&mut buf, &signing.sign(b"h").to_bytes());
        assert!(verify_ed25519(&blob, b"h", &buf).is_err());
    }

    #[test]
    fn test_ed25519_truncated_key() {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, b"ssh-ed25519");
        wire::put_string(&mut buf, &[1u8; 31]);
        assert!(verify_ed25519(&buf, b"h", &ed25519_signature_blob(&[0u8; 64])).is_err());
    }

    #[test]
    fn test_ecdsa_p256_verify() {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();

        let mut key_blob = BytesMut::new();
        wire::put_string(&mut key_blob, b"ecdsa-sha2-nistp256");
        wire::put_string(&mut key_blob, b"nistp256");
        wire::put_string(&mut key_blob, pair.public_key().as_ref());

        let fixed = pair.sign(&rng, b"exchange hash").unwrap();
        let (r, s) = fixed.as_ref().split_at(32);
        let mut inner = BytesMut::new();
        wire::put_mpint(&mut inner, r);
        wire::put_mpint(&mut inner, s);
        let mut sig_blob = BytesMut::new();
        wire::put_string(&mut sig_blob, b"ecdsa-sha2-nistp256");
        wire::put_string(&mut sig_blob, &inner);

        assert!(verify_ecdsa_p256(&key_blob, b"exchange hash", &sig_blob).is_ok());
        assert!(verify_ecdsa_p256(&key_blob, b"tampered", &sig_blob).is_err());
        assert!(verify_ecdsa_p384(&key_blob, b"exchange hash", &sig_blob).is_err());
    }

    #[test]
    fn test_rsa_rejects_non_rsa_blob() {
        let (_, blob) = ed25519_pair();
        assert!(matches!(
            verify_rsa_sha256(&blob, b"h", b""),
            Err(Error::HostKeyVerification(_))
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let (_, blob) = ed25519_pair();
        let info = HostKeyInfo::new("ssh-ed25519", &blob);
        assert!(info.fingerprint.starts_with("SHA256:"));
        // 32-byte digest in unpadded base64 is 43 characters
        assert_eq!(info.fingerprint.len(), "SHA256:".len() + 43);
    }
}
