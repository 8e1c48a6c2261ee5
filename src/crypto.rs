//! Low-level cryptographic operations.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). All other modules encrypt and decrypt
//! field values exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Random nonce**: 96-bit, generated fresh per operation via `SystemRandom`
//! - **Deterministic nonce**: first 96 bits of HMAC-SHA256(mac_key, aad || plaintext)
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::FieldVaultError;

/// The AEAD algorithm used throughout fieldvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a data key or derived subkey in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Fill `buf` from the operating system's secure random source.
///
/// `SystemRandom` is the only source of randomness in the crate. Key
/// material and random nonces both come from here.
pub fn fill_random(buf: &mut [u8]) -> Result<(), FieldVaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| FieldVaultError::RandomnessFailure)
}

/// Generate `len` secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, FieldVaultError> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a 256-bit key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], FieldVaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

fn random_nonce() -> Result<[u8; NONCE_LEN], FieldVaultError> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Derive a synthetic nonce from the plaintext, so equal inputs under the
/// same keys produce equal ciphertext.
fn synthetic_nonce(mac_key: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> [u8; NONCE_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(aad);
    ctx.update(plaintext);
    let tag = ctx.sign();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&tag.as_ref()[..NONCE_LEN]);
    nonce
}

fn seal_with_nonce(
    key_bytes: &[u8; KEY_LEN],
    nonce_bytes: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, FieldVaultError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| FieldVaultError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(aad),
        &mut in_out,
    )
    .map_err(|_| FieldVaultError::EncryptionFailure)?;

    let mut output = Vec::with_capacity(NONCE_LEN + in_out.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&in_out);
    Ok(output)
}

/// Encrypt with a fresh random nonce. Equal plaintexts produce different
/// ciphertexts.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn encrypt_random(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, FieldVaultError> {
    let nonce = random_nonce()?;
    seal_with_nonce(key_bytes, nonce, aad, plaintext)
}

/// Encrypt with a nonce derived from `mac_key`, `aad` and the plaintext.
///
/// Same layout as [`encrypt_random`]. Equal plaintexts under the same keys
/// and associated data produce byte-identical output, which is what makes
/// equality queries on the ciphertext possible.
pub fn encrypt_deterministic(
    key_bytes: &[u8; KEY_LEN],
    mac_key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, FieldVaultError> {
    let nonce = synthetic_nonce(mac_key, aad, plaintext);
    seal_with_nonce(key_bytes, nonce, aad, plaintext)
}

/// Decrypt a payload produced by either encrypt function.
///
/// If the key is wrong, the associated data differs, or the ciphertext has
/// been tampered with, the GCM check fails and no partial plaintext is
/// returned.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, FieldVaultError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(FieldVaultError::DecryptionFailure);
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| FieldVaultError::DecryptionFailure)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| FieldVaultError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut payload = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut payload)
        .map_err(|_| FieldVaultError::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}
