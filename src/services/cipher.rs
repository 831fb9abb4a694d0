//! Striped Blowfish-CBC stream decryption.
//!
//! Protected streams arrive with every third 2048-byte block encrypted;
//! everything else, including a trailing partial block, passes through
//! verbatim. Each encrypted block is an independent CBC unit with a fixed
//! IV, which is what makes decrypting a stream progressively possible.

use blowfish::Blowfish;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::errors::{CadenzaError, Result};

pub const STRIPE_BLOCK_SIZE: usize = 2048;
/// Every third block is encrypted, starting with block 0.
const STRIPE_PERIOD: usize = 3;
const STRIPE_IV: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

type BfCbcDecryptor = cbc::Decryptor<Blowfish>;
type BfCbcEncryptor = cbc::Encryptor<Blowfish>;

/// Track key: fold the two halves of the md5 hex digest of the track id
/// into the shared secret, byte by byte.
pub fn derive_track_key(track_id: &str, secret: &[u8; 16]) -> [u8; 16] {
    let digest = hex::encode(md5::compute(track_id.as_bytes()).0);
    let digest = digest.as_bytes();
    let mut key = [0u8; 16];
    for i in 0..16 {
        key[i] = digest[i] ^ digest[i + 16] ^ secret[i];
    }
    key
}

/// Streaming transform over the striped scheme. Feed arbitrary chunks with
/// [`StripeCipher::process`]; call [`StripeCipher::finish`] at EOF to flush
/// the trailing partial block.
pub struct StripeCipher {
    key: [u8; 16],
    decrypt: bool,
    pending: Vec<u8>,
    block_index: usize,
}

impl StripeCipher {
    pub fn decryptor(key: [u8; 16]) -> Self {
        Self {
            key,
            decrypt: true,
            pending: Vec::with_capacity(STRIPE_BLOCK_SIZE),
            block_index: 0,
        }
    }

    /// Inverse transform, used by the tests to produce striped input.
    pub fn encryptor(key: [u8; 16]) -> Self {
        Self {
            key,
            decrypt: false,
            pending: Vec::with_capacity(STRIPE_BLOCK_SIZE),
            block_index: 0,
        }
    }

    fn transform_block(&self, block: &mut [u8]) -> Result<()> {
        if self.decrypt {
            let cipher = BfCbcDecryptor::new_from_slices(&self.key, &STRIPE_IV)
                .map_err(|e| CadenzaError::Decryption(format!("bad key/iv: {}", e)))?;
            cipher
                .decrypt_padded_mut::<NoPadding>(block)
                .map_err(|e| CadenzaError::Decryption(format!("block decrypt failed: {}", e)))?;
        } else {
            let cipher = BfCbcEncryptor::new_from_slices(&self.key, &STRIPE_IV)
                .map_err(|e| CadenzaError::Decryption(format!("bad key/iv: {}", e)))?;
            let len = block.len();
            cipher
                .encrypt_padded_mut::<NoPadding>(block, len)
                .map_err(|e| CadenzaError::Decryption(format!("block encrypt failed: {}", e)))?;
        }
        Ok(())
    }

    /// Consume a chunk and return all bytes that are ready to emit.
    pub fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);
        let mut out = Vec::with_capacity(self.pending.len());

        while self.pending.len() >= STRIPE_BLOCK_SIZE {
            let mut block: Vec<u8> = self.pending.drain(..STRIPE_BLOCK_SIZE).collect();
            if self.block_index % STRIPE_PERIOD == 0 {
                self.transform_block(&mut block)?;
            }
            self.block_index += 1;
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    /// Flush at EOF. A final short block is never encrypted.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8; 16] = b"0123456789abcdef";

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let key = derive_track_key("314159", SECRET);
        let mut enc = StripeCipher::encryptor(key);
        let mut striped = enc.process(data).unwrap();
        striped.extend(enc.finish());

        let mut dec = StripeCipher::decryptor(key);
        let mut plain = dec.process(&striped).unwrap();
        plain.extend(dec.finish());
        plain
    }

    #[test]
    fn key_derivation_folds_digest_halves() {
        let key = derive_track_key("12345", SECRET);
        let digest = format!("{:x}", md5::compute(b"12345"));
        let hex = digest.as_bytes();
        for i in 0..16 {
            assert_eq!(key[i], hex[i] ^ hex[i + 16] ^ SECRET[i]);
        }
    }

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        for len in [0usize, 8, 2048, 4096, 6144, 2048 * 7 + 8] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&data), data, "length {}", len);
        }
    }

    #[test]
    fn only_every_third_full_block_is_transformed() {
        let key = derive_track_key("99", SECRET);
        let data: Vec<u8> = (0..STRIPE_BLOCK_SIZE * 4).map(|i| (i % 251) as u8).collect();

        let mut enc = StripeCipher::encryptor(key);
        let mut striped = enc.process(&data).unwrap();
        striped.extend(enc.finish());

        for i in 0..4 {
            let range = i * STRIPE_BLOCK_SIZE..(i + 1) * STRIPE_BLOCK_SIZE;
            if i % 3 == 0 {
                assert_ne!(&striped[range.clone()], &data[range], "block {} should change", i);
            } else {
                assert_eq!(&striped[range.clone()], &data[range], "block {} should pass", i);
            }
        }
    }

    #[test]
    fn trailing_partial_block_passes_through() {
        let key = derive_track_key("7", SECRET);
        // Three full blocks, then 100 spare bytes. Block 3 would be a stripe
        // block (3 % 3 == 0) but is short, so it must not be touched.
        let data: Vec<u8> = (0..STRIPE_BLOCK_SIZE * 3 + 100).map(|i| (i % 251) as u8).collect();

        let mut enc = StripeCipher::encryptor(key);
        let mut striped = enc.process(&data).unwrap();
        striped.extend(enc.finish());

        assert_eq!(&striped[STRIPE_BLOCK_SIZE * 3..], &data[STRIPE_BLOCK_SIZE * 3..]);
    }

    #[test]
    fn chunk_boundaries_do_not_affect_output() {
        let key = derive_track_key("42", SECRET);
        let data: Vec<u8> = (0..STRIPE_BLOCK_SIZE * 5 + 37).map(|i| (i % 251) as u8).collect();

        let mut enc = StripeCipher::encryptor(key);
        let mut striped = enc.process(&data).unwrap();
        striped.extend(enc.finish());

        // One-shot decrypt.
        let mut dec = StripeCipher::decryptor(key);
        let mut whole = dec.process(&striped).unwrap();
        whole.extend(dec.finish());

        // Dribbled decrypt in awkward chunk sizes.
        let mut dec = StripeCipher::decryptor(key);
        let mut dribbled = Vec::new();
        for chunk in striped.chunks(777) {
            dribbled.extend(dec.process(chunk).unwrap());
        }
        dribbled.extend(dec.finish());

        assert_eq!(whole, data);
        assert_eq!(dribbled, data);
    }
}
