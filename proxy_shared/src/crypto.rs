//! Crypto primitives for the datagram transport.
//!
//! The wire protocol fixes AES-CBC with PKCS#7 padding for the outer
//! layer and HMAC-SHA256 for the inner frame tag. The key length (16,
//! 24, or 32 bytes) selects the AES variant; the IV is fixed per
//! session by configuration.
//!
//! All helpers are pure and never mutate their inputs.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ProxyError, Result};

/// AES block size in bytes; CBC and PKCS#7 operate at this granularity.
pub const BLOCK_LEN: usize = 16;

/// Required IV length.
pub const IV_LEN: usize = 16;

/// HMAC-SHA256 tag length.
pub const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// AES variant selected by key length.
enum CbcCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl CbcCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let bad_key = |_| ProxyError::Crypto("invalid AES key".into());
        match key.len() {
            16 => Ok(Self::Aes128(Aes128::new_from_slice(key).map_err(bad_key)?)),
            24 => Ok(Self::Aes192(Aes192::new_from_slice(key).map_err(bad_key)?)),
            32 => Ok(Self::Aes256(Aes256::new_from_slice(key).map_err(bad_key)?)),
            n => Err(ProxyError::Crypto(format!(
                "invalid AES key length {n} (expected 16, 24, or 32)"
            ))),
        }
    }

    fn encrypt_block(&self, block: &mut Block) {
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut Block) {
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes192(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

fn check_iv(iv: &[u8]) -> Result<[u8; IV_LEN]> {
    iv.try_into().map_err(|_| {
        ProxyError::Crypto(format!("invalid IV length {} (expected {IV_LEN})", iv.len()))
    })
}

/// PKCS#7: always appends at least one byte; block-aligned input gains a
/// full block of padding.
fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_LEN - data.len() % BLOCK_LEN;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

fn pkcs7_unpad(buf: &mut Vec<u8>) -> Result<()> {
    let len = buf.len();
    let pad = match buf.last() {
        Some(&b) => b as usize,
        None => return Err(ProxyError::Crypto("empty plaintext".into())),
    };
    if pad == 0 || pad > BLOCK_LEN || pad > len {
        return Err(ProxyError::Crypto(format!(
            "invalid PKCS#7 padding length {pad}"
        )));
    }
    if buf[len - pad..].iter().any(|&b| b as usize != pad) {
        return Err(ProxyError::Crypto("invalid PKCS#7 padding bytes".into()));
    }
    buf.truncate(len - pad);
    Ok(())
}

/// AES-CBC encrypts `plain`, PKCS#7-padding it to the block boundary.
///
/// Output length is always `((plain.len() / 16) + 1) * 16`.
pub fn aes_cbc_encrypt(plain: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let cipher = CbcCipher::new(key)?;
    let iv = check_iv(iv)?;

    let mut out = pkcs7_pad(plain);
    let mut prev = iv;
    for chunk in out.chunks_exact_mut(BLOCK_LEN) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(Block::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }

    Ok(out)
}

/// AES-CBC decrypts `ciphertext` and strips the PKCS#7 padding.
///
/// The padding bytes are validated; a malformed pad is a crypto error,
/// which callers treat as log-and-drop.
pub fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let cipher = CbcCipher::new(key)?;
    let iv = check_iv(iv)?;

    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(ProxyError::Crypto(format!(
            "invalid ciphertext length {} (not a positive multiple of {BLOCK_LEN})",
            ciphertext.len()
        )));
    }

    let mut out = ciphertext.to_vec();
    let mut prev = iv;
    for chunk in out.chunks_exact_mut(BLOCK_LEN) {
        let mut saved = [0u8; BLOCK_LEN];
        saved.copy_from_slice(chunk);
        cipher.decrypt_block(Block::from_mut_slice(chunk));
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = saved;
    }

    pkcs7_unpad(&mut out)?;
    Ok(out)
}

/// HMAC-SHA256 over `data`.
pub fn hmac_sum(data: &[u8], key: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProxyError::Crypto(format!("invalid HMAC key: {e}")))?;
    mac.update(data);
    let mut sum = [0u8; HMAC_LEN];
    sum.copy_from_slice(&mac.finalize().into_bytes());
    Ok(sum)
}

/// Constant-time HMAC verification. A mismatch reports both tags; it is
/// never fatal, callers log and drop the datagram.
pub fn hmac_verify(data: &[u8], key: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProxyError::Crypto(format!("invalid HMAC key: {e}")))?;
    mac.update(data);
    if mac.verify_slice(tag).is_ok() {
        return Ok(());
    }

    let computed = hmac_sum(data, key)?;
    Err(ProxyError::Framing(format!(
        "invalid HMAC sum: expected \"{}\", got \"{}\"",
        hex::encode(tag),
        hex::encode(computed)
    )))
}
