//! Value encryption for stored records.
//!
//! AES-256 in full-block CFB mode. The key is SHA-256 of the caller's secret,
//! every record gets a fresh random IV.
//!
//! Record wire format:
//!   [ iv (16 bytes) | ciphertext (same length as plaintext) ]
//!
//! There is no authentication tag. A corrupted or foreign record decrypts to
//! garbage without an error; only records shorter than one block are rejected.

use std::fmt;

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, InnerIvInit, KeyInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("derived key length {0} is not accepted by AES-256")]
    KeyLength(usize),

    #[error("iv length {0} does not match the cipher block size")]
    IvLength(usize),

    #[error("random source failure: {0}")]
    RandomSource(#[from] rand::Error),

    #[error("ciphertext too short: {len} bytes, need at least {}", BLOCK_SIZE)]
    TruncatedInput { len: usize },
}

/// Keyed block cipher shared by every encrypt/decrypt call of one store.
#[derive(Clone)]
pub struct CipherBox {
    block: Aes256,
}

impl fmt::Debug for CipherBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherBox").finish_non_exhaustive()
    }
}

/// SHA-256 of the secret. Identical secrets always give identical keys.
pub fn derive_key(secret: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&Sha256::digest(secret));
    key
}

impl CipherBox {
    pub fn new(secret: &[u8]) -> Result<Self, CipherError> {
        let key = derive_key(secret);
        let block = Aes256::new_from_slice(key.as_slice())
            .map_err(|_| CipherError::KeyLength(key.len()))?;
        Ok(Self { block })
    }

    /// Encrypt `plaintext` into a new `iv || ciphertext` record.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut output = vec![0u8; BLOCK_SIZE + plaintext.len()];
        let (iv, body) = output.split_at_mut(BLOCK_SIZE);
        OsRng.try_fill_bytes(iv)?;
        body.copy_from_slice(plaintext);

        Encryptor::<Aes256>::inner_iv_slice_init(self.block.clone(), iv)
            .map_err(|_| CipherError::IvLength(iv.len()))?
            .encrypt(body);
        Ok(output)
    }

    /// Decrypt a record into a freshly allocated buffer. `record` is untouched.
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>, CipherError> {
        let (iv, body) = split_record(record)?;
        let mut plaintext = body.to_vec();
        self.apply_keystream(iv, &mut plaintext)?;
        Ok(plaintext)
    }

    /// Decrypt without copying. The body region of `record` is overwritten with
    /// the plaintext and returned; the ciphertext is gone afterwards.
    pub fn decrypt_in_place<'a>(&self, record: &'a mut [u8]) -> Result<&'a mut [u8], CipherError> {
        if record.len() < BLOCK_SIZE {
            return Err(CipherError::TruncatedInput { len: record.len() });
        }
        let (iv, body) = record.split_at_mut(BLOCK_SIZE);
        self.apply_keystream(iv, body)?;
        Ok(body)
    }

    /// Decrypt an owned record in place and strip the IV.
    pub fn decrypt_vec(&self, mut record: Vec<u8>) -> Result<Vec<u8>, CipherError> {
        self.decrypt_in_place(&mut record)?;
        record.drain(..BLOCK_SIZE);
        Ok(record)
    }

    fn apply_keystream(&self, iv: &[u8], body: &mut [u8]) -> Result<(), CipherError> {
        Decryptor::<Aes256>::inner_iv_slice_init(self.block.clone(), iv)
            .map_err(|_| CipherError::IvLength(iv.len()))?
            .decrypt(body);
        Ok(())
    }
}

fn split_record(record: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    if record.len() < BLOCK_SIZE {
        return Err(CipherError::TruncatedInput { len: record.len() });
    }
    Ok(record.split_at(BLOCK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_RECORD: &[u8] =
        br#"{"info":{"name":"gXeMfp.zip","type":"","size":79448, "comment":"test"}}"#;

    #[test]
    fn encrypt_decrypt_table() {
        let long_secret: &[u8] = b"input with more than 16 characters";
        let repeated = JSON_RECORD.repeat(7);
        let cases: [(&[u8], &[u8]); 7] = [
            (b"Foo", b"Boo"),
            (b"Foo", b"Car"),
            (b"Foo", b""),
            (b"", b"Car"),
            (b"Long input with more than 16 characters", b"Car"),
            (JSON_RECORD, long_secret),
            (&repeated, long_secret),
        ];

        for (content, secret) in cases {
            let cb = CipherBox::new(secret).unwrap();
            let enc = cb.encrypt(content).unwrap();
            assert_eq!(enc.len(), BLOCK_SIZE + content.len());
            let dec = cb.decrypt(&enc).unwrap();
            assert_eq!(dec, content, "secret {:?}", secret);
        }
    }

    #[test]
    fn same_plaintext_gives_different_records() {
        let cb = CipherBox::new(b"secret").unwrap();
        let a = cb.encrypt(b"identical payload").unwrap();
        let b = cb.encrypt(b"identical payload").unwrap();
        assert_ne!(a[..BLOCK_SIZE], b[..BLOCK_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn same_secret_decrypts_across_instances() {
        let writer = CipherBox::new(b"shared").unwrap();
        let reader = CipherBox::new(b"shared").unwrap();
        let record = writer.encrypt(b"hello").unwrap();
        assert_eq!(reader.decrypt(&record).unwrap(), b"hello");
        assert_eq!(*derive_key(b"shared"), *derive_key(b"shared"));
    }

    #[test]
    fn short_input_is_rejected() {
        let cb = CipherBox::new(b"secret").unwrap();
        for len in 0..BLOCK_SIZE {
            let input = vec![7u8; len];
            match cb.decrypt(&input) {
                Err(CipherError::TruncatedInput { len: got }) => assert_eq!(got, len),
                other => panic!("expected truncation error, got {other:?}"),
            }
        }
        // A bare IV is a valid record of an empty plaintext.
        assert!(cb.decrypt(&[0u8; BLOCK_SIZE]).unwrap().is_empty());
    }

    #[test]
    fn in_place_overwrites_body_only() {
        let cb = CipherBox::new(b"secret").unwrap();
        let mut record = cb.encrypt(b"in place").unwrap();
        let iv = record[..BLOCK_SIZE].to_vec();
        let plain = cb.decrypt_in_place(&mut record).unwrap();
        assert_eq!(plain, b"in place");
        assert_eq!(&record[..BLOCK_SIZE], iv.as_slice());
        assert_eq!(&record[BLOCK_SIZE..], b"in place");
    }

    #[test]
    fn copy_out_leaves_record_intact() {
        let cb = CipherBox::new(b"secret").unwrap();
        let record = cb.encrypt(b"keep me").unwrap();
        let before = record.clone();
        cb.decrypt(&record).unwrap();
        assert_eq!(record, before);
        assert_eq!(cb.decrypt_vec(record).unwrap(), b"keep me");
    }

    #[test]
    fn wrong_secret_is_not_detected() {
        let record = CipherBox::new(b"right").unwrap().encrypt(b"payload").unwrap();
        let garbage = CipherBox::new(b"wrong").unwrap().decrypt(&record).unwrap();
        assert_eq!(garbage.len(), b"payload".len());
        assert_ne!(garbage, b"payload");
    }
}
