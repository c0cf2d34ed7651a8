use std::fmt;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{DbError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
const KDF_ITERATIONS: u32 = 100_000;

/// Wraps collection plaintext as `hex(salt):hex(iv):hex(ciphertext)`.
///
/// Salt and IV are regenerated on every encrypt, so two saves of the same
/// plaintext never produce the same envelope. The legacy two-field form
/// `hex(iv):hex(ciphertext)` (key = SHA-256 of the passphrase, no KDF) is
/// still accepted on read.
#[derive(Clone)]
pub struct Encryptor {
    passphrase: String,
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Encryptor(..)")
    }
}

impl Encryptor {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|err| DbError::Encryption(format!("cipher initialization failed: {err}")))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(salt),
            hex::encode(iv),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>> {
        let fields: Vec<&str> = envelope.trim().split(':').collect();
        match fields.as_slice() {
            [salt_hex, iv_hex, ct_hex] => {
                let salt = decode_field("salt", salt_hex)?;
                if salt.len() != SALT_LEN {
                    return Err(DbError::Decryption(format!(
                        "salt must be {SALT_LEN} bytes, got {}",
                        salt.len()
                    )));
                }
                let key = self.derive_key(&salt);
                self.decrypt_with_key(&key, iv_hex, ct_hex)
            }
            [iv_hex, ct_hex] => {
                let key = self.legacy_key();
                self.decrypt_with_key(&key, iv_hex, ct_hex)
            }
            _ => Err(DbError::Decryption(format!(
                "envelope must have two or three ':'-separated fields, got {}",
                fields.len()
            ))),
        }
    }

    fn decrypt_with_key(&self, key: &[u8; KEY_LEN], iv_hex: &str, ct_hex: &str) -> Result<Vec<u8>> {
        let iv = decode_field("iv", iv_hex)?;
        if iv.len() != IV_LEN {
            return Err(DbError::Decryption(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        let ciphertext = decode_field("ciphertext", ct_hex)?;

        let cipher = Aes256CbcDec::new_from_slices(key, &iv)
            .map_err(|err| DbError::Decryption(format!("cipher initialization failed: {err}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| {
                DbError::Decryption("decryption failed (wrong passphrase or corrupted data)".into())
            })
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        key
    }

    fn legacy_key(&self) -> [u8; KEY_LEN] {
        Sha256::digest(self.passphrase.as_bytes()).into()
    }
}

fn decode_field(label: &str, field: &str) -> Result<Vec<u8>> {
    hex::decode(field)
        .map_err(|err| DbError::Decryption(format!("invalid hex in {label} field: {err}")))
}
