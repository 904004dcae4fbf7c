use std::fs;
use std::path::Path;

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::{ChainError, ChainResult};
use crate::types::DATA_IV_LEN;

/// Data keys are AES-256.
pub const DATA_KEY_LEN: usize = 32;
pub const MIN_RSA_BITS: u32 = 2048;

/// The blocks use a 16-byte GCM IV rather than the 12-byte default.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub fn generate_keypair() -> ChainResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, MIN_RSA_BITS as usize)
        .map_err(|err| ChainError::Crypto(format!("keypair generation failed: {err}")))
}

/// Writes the private key PEM at `path` and the public half next to it with
/// a `.pub.pem` extension.
pub fn save_keypair(path: &Path, private_key: &RsaPrivateKey) -> ChainResult<()> {
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| ChainError::Crypto(format!("failed to encode private key: {err}")))?;
    fs::write(path, private_pem.as_bytes())?;
    let public_pem = public_key_pem(&private_key.to_public_key())?;
    fs::write(path.with_extension("pub.pem"), public_pem)?;
    Ok(())
}

pub fn load_private_key(path: &Path) -> ChainResult<RsaPrivateKey> {
    let raw = fs::read_to_string(path)?;
    parse_private_key_pem(&raw)
}

pub fn parse_private_key_pem(pem: &str) -> ChainResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|err| ChainError::Crypto(format!("invalid private key PEM: {err}")))
}

/// Accepts both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1 (`BEGIN RSA PUBLIC
/// KEY`) encodings; browsers export the former, openssl defaults to the
/// latter.
pub fn parse_public_key_pem(pem: &str) -> ChainResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|err| ChainError::Crypto(format!("invalid public key PEM: {err}")))
}

pub fn public_key_pem(public_key: &RsaPublicKey) -> ChainResult<String> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| ChainError::Crypto(format!("failed to encode public key: {err}")))
}

pub fn key_bits(public_key: &RsaPublicKey) -> u32 {
    (public_key.size() * 8) as u32
}

/// RSA-SHA256 (PKCS#1 v1.5) over the ASCII bytes of the hex block hash.
pub fn sign_block_hash(private_key: &RsaPrivateKey, block_hash: &str) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    signing_key.sign(block_hash.as_bytes()).to_vec()
}

pub fn verify_block_hash_signature(
    public_key_pem: &str,
    block_hash: &str,
    signature: &[u8],
) -> ChainResult<()> {
    let public_key = parse_public_key_pem(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature = Signature::try_from(signature)
        .map_err(|err| ChainError::Crypto(format!("malformed signature: {err}")))?;
    verifying_key
        .verify(block_hash.as_bytes(), &signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Wraps the AES data key under the creator's public key with OAEP/SHA-256.
pub fn wrap_data_key(public_key: &RsaPublicKey, data_key: &[u8]) -> ChainResult<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data_key)
        .map_err(|err| ChainError::Crypto(format!("key wrap failed: {err}")))
}

pub fn unwrap_data_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> ChainResult<Vec<u8>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|err| ChainError::Crypto(format!("key unwrap failed: {err}")))
}

pub fn generate_data_key() -> [u8; DATA_KEY_LEN] {
    let mut key = [0u8; DATA_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_iv() -> [u8; DATA_IV_LEN] {
    let mut iv = [0u8; DATA_IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-GCM seal; the returned ciphertext carries the 16-byte auth tag
/// appended.
pub fn aes_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> ChainResult<Vec<u8>> {
    if key.len() != DATA_KEY_LEN {
        return Err(ChainError::Crypto("data key must be 32 bytes".into()));
    }
    if iv.len() != DATA_IV_LEN {
        return Err(ChainError::Crypto("data IV must be 16 bytes".into()));
    }
    let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(iv), plaintext)
        .map_err(|_| ChainError::Crypto("encryption failed".into()))
}

pub fn aes_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> ChainResult<Vec<u8>> {
    if key.len() != DATA_KEY_LEN {
        return Err(ChainError::Crypto("data key must be 32 bytes".into()));
    }
    if iv.len() != DATA_IV_LEN {
        return Err(ChainError::Crypto("data IV must be 16 bytes".into()));
    }
    let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| ChainError::Crypto("decryption failed or payload tampered".into()))
}

/// Constant-time equality for hex digests.
pub fn hashes_match(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| generate_keypair().expect("keypair"))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let private_key = test_key();
        let public_key = private_key.to_public_key();
        let data_key = generate_data_key();
        let iv = generate_iv();

        let ciphertext = aes_encrypt(&data_key, &iv, b"hello sealed world").unwrap();
        assert!(ciphertext.len() >= 16 + b"hello sealed world".len());
        let wrapped = wrap_data_key(&public_key, &data_key).unwrap();
        assert_eq!(wrapped.len(), public_key.size());

        let unwrapped = unwrap_data_key(private_key, &wrapped).unwrap();
        let plaintext = aes_decrypt(&unwrapped, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello sealed world");
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let data_key = generate_data_key();
        let iv = generate_iv();
        let mut ciphertext = aes_encrypt(&data_key, &iv, b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(aes_decrypt(&data_key, &iv, &ciphertext).is_err());
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let private_key = test_key();
        let pem = public_key_pem(&private_key.to_public_key()).unwrap();
        let block_hash = "00ab".repeat(16);

        let mut signature = sign_block_hash(private_key, &block_hash);
        verify_block_hash_signature(&pem, &block_hash, &signature).unwrap();

        signature[0] ^= 0x01;
        assert!(verify_block_hash_signature(&pem, &block_hash, &signature).is_err());
    }

    #[test]
    fn public_key_pem_round_trips() {
        let public_key = test_key().to_public_key();
        let pem = public_key_pem(&public_key).unwrap();
        let parsed = parse_public_key_pem(&pem).unwrap();
        assert_eq!(parsed, public_key);
        assert_eq!(key_bits(&parsed), 2048);
    }

    #[test]
    fn hash_comparison_requires_exact_match() {
        assert!(hashes_match("abcd", "abcd"));
        assert!(!hashes_match("abcd", "abce"));
        assert!(!hashes_match("abcd", "abcde"));
    }
}
