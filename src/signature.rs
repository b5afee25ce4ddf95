use crate::error::{IoContext, MpkError, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Member that holds the signature and is excluded from the digest.
pub const SIGNATURE_FILE: &str = "signature.sig";
/// Placeholder written into unsigned packages.
pub const UNSIGNED_MARKER: &str = "UNSIGNED";
/// Prefix of the placeholder older tooling wrote when no crypto backend was present.
pub const SIMULATED_PREFIX: &str = "SIMULATED_SIGNATURE_";

const SHA256_LEN: usize = 32;

/// SHA-256 over every member except the signature: path bytes then contents,
/// in lexicographic path order.
pub fn content_digest(members: &BTreeMap<String, Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (path, contents) in members {
        if path == SIGNATURE_FILE {
            continue;
        }
        debug!(member = %path, "digesting");
        hasher.update(path.as_bytes());
        hasher.update(contents);
    }
    hasher.finalize().into()
}

// PSS with the largest salt the modulus allows (emLen - hLen - 2).
fn max_salt_len(key: &RsaPublicKey) -> usize {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = em_bits.div_ceil(8);
    em_len.saturating_sub(SHA256_LEN + 2)
}

pub fn sign_digest(key: &RsaPrivateKey, digest: &[u8]) -> Vec<u8> {
    let salt_len = max_salt_len(&key.to_public_key());
    let signer = SigningKey::<Sha256>::new_with_salt_len(key.clone(), salt_len);
    let signature = signer.sign_with_rng(&mut OsRng, digest);
    signature.to_vec()
}

pub fn verify_digest(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    let verifier = VerifyingKey::<Sha256>::new_with_salt_len(key.clone(), max_salt_len(key));
    verifier.verify(digest, &signature).is_ok()
}

pub fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| MpkError::Key(e.to_string()))
}

/// Write a fresh key pair as PKCS#8 (private) and SPKI (public) PEM.
pub fn generate_keypair(bits: usize, secret_path: &Path, pub_path: &Path) -> Result<RsaPrivateKey> {
    let key = generate_key(bits)?;
    let secret_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| MpkError::Key(e.to_string()))?;
    let public_pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| MpkError::Key(e.to_string()))?;

    fs::write(secret_path, secret_pem.as_bytes()).at(secret_path)?;
    fs::write(pub_path, public_pem.as_bytes()).at(pub_path)?;
    Ok(key)
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path).at(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| MpkError::Key(format!("{}: {e}", path.display())))
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path).at(path)?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| MpkError::Key(format!("{}: {e}", path.display())))
}
