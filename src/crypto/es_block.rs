//! The ES block transform that protects tickets at rest.
//!
//! AES-128-CCM (RFC 3610) with a 12 byte nonce (L = 3), a 16 byte MAC and no associated data.
//! The block is stored as the encrypted payload followed by a 0x20 byte footer:
//!
//! ```text
//! 0x00  MAC (16)          \ encrypted with the CCM counter stream
//! 0x10  0x3A              | starting at counter 0
//! 0x11  payload len u24   /
//! 0x14  nonce (12)          plain
//! ```
//!
//! The payload itself is encrypted with the counter stream starting at counter 1.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

use crate::error::{Error, Result};

pub const FOOTER_SIZE: usize = 0x20;
pub const NONCE_SIZE: usize = 12;
pub const MAC_SIZE: usize = 16;

/// CCM flags byte for M = 16, L = 3, no associated data; also the footer marker.
const MARKER: u8 = 0x3A;
const MAX_PAYLOAD: usize = (1 << 24) - 1;
/// MAC, marker and length are encrypted, the nonce is not.
const SEALED_FOOTER: usize = 0x14;

type Aes128Ctr32 = ctr::Ctr32BE<aes::Aes128>;

#[derive(Clone)]
pub struct EsCipher {
    key: [u8; 16],
    aes: aes::Aes128,
}

impl core::fmt::Debug for EsCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("EsCipher")
    }
}

impl EsCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self { key: *key, aes: aes::Aes128::new(GenericArray::from_slice(key)) }
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        self.aes.encrypt_block(GenericArray::from_mut_slice(block));
    }

    /// XOR the CCM counter stream starting at `A_first_counter` into `data`.
    ///
    /// The 32 bit counter never carries into the nonce: payloads stay below 2^20 blocks.
    fn apply_keystream(&self, nonce: &[u8; NONCE_SIZE], data: &mut [u8], first_counter: u32) {
        let mut block = [0u8; 16];
        block[0] = 2; // L - 1
        block[1..13].copy_from_slice(nonce);
        block[13..].copy_from_slice(&first_counter.to_be_bytes()[1..]);
        let mut ctr = Aes128Ctr32::new(&self.key.into(), &block.into());
        ctr.apply_keystream(data);
    }

    /// CBC-MAC over `B_0` and the zero padded plaintext.
    fn cbc_mac(&self, nonce: &[u8; NONCE_SIZE], plain: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = [0u8; 16];
        mac[0] = MARKER;
        mac[1..13].copy_from_slice(nonce);
        mac[13..].copy_from_slice(&(plain.len() as u32).to_be_bytes()[1..]);
        self.encrypt_block(&mut mac);
        for chunk in plain.chunks(16) {
            for (byte, data) in mac.iter_mut().zip(chunk.iter()) {
                *byte ^= data;
            }
            self.encrypt_block(&mut mac);
        }
        mac
    }

    /// Authenticate and decrypt a stored ES block, returning the plain payload.
    pub fn decrypt(&self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() < FOOTER_SIZE {
            return Err(Error::EsBlock("shorter than its footer"));
        }
        let (payload, footer) = block.split_at(block.len() - FOOTER_SIZE);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&footer[SEALED_FOOTER..]);
        let mut sealed = [0u8; SEALED_FOOTER];
        sealed.copy_from_slice(&footer[..SEALED_FOOTER]);
        // the footer shares counter 1 with the first payload block
        self.apply_keystream(&nonce, &mut sealed, 0);

        if sealed[MAC_SIZE] != MARKER {
            return Err(Error::EsBlock("bad marker"));
        }
        let len = u32::from_be_bytes([0, sealed[17], sealed[18], sealed[19]]) as usize;
        if len != payload.len() {
            debug!("ES block records {} payload bytes, holds {}", len, payload.len());
            return Err(Error::EsBlock("bad length"));
        }

        let mut plain = payload.to_vec();
        self.apply_keystream(&nonce, &mut plain, 1);

        let mac = self.cbc_mac(&nonce, &plain);
        let difference = mac.iter().zip(sealed[..MAC_SIZE].iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if difference != 0 {
            return Err(Error::EsBlock("bad MAC"));
        }
        Ok(plain)
    }

    /// Encrypt `payload` under a fresh random nonce.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encrypt_with_nonce(payload, &nonce)
    }

    pub fn encrypt_with_nonce(&self, payload: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::EsBlock("payload too large"));
        }
        let mac = self.cbc_mac(nonce, payload);

        let mut block = Vec::with_capacity(payload.len() + FOOTER_SIZE);
        block.extend_from_slice(payload);
        self.apply_keystream(nonce, &mut block, 1);

        let mut sealed = [0u8; SEALED_FOOTER];
        sealed[..MAC_SIZE].copy_from_slice(&mac);
        sealed[MAC_SIZE] = MARKER;
        sealed[17..].copy_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        self.apply_keystream(nonce, &mut sealed, 0);

        block.extend_from_slice(&sealed);
        block.extend_from_slice(nonce);
        Ok(block)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::derive_es_key;
    use crate::testing::test_identity;

    fn cipher() -> EsCipher {
        EsCipher::new(&derive_es_key(&test_identity().console_id))
    }

    fn payload() -> Vec<u8> {
        (0..0x2A4).map(|i| (i * 7 + 3) as u8).collect()
    }

    const NONCE: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn es_key_known_answer() {
        assert_eq!(
            hex::encode_upper(derive_es_key(&test_identity().console_id)),
            "AC9FFDAE7B1F16DA6C31328658EDB56D"
        );
    }

    #[test]
    fn matches_reference_ccm() {
        let block = cipher().encrypt_with_nonce(&payload(), &NONCE).unwrap();
        assert_eq!(block.len(), 0x2A4 + FOOTER_SIZE);
        assert_eq!(hex::encode_upper(&block[..16]), "50F508951245050F2AC9637497B9CFD2");
        assert_eq!(hex::encode_upper(&block[0x2A4 - 16..0x2A4]), "B1EA3F4E3531C3D4B8BC0D40A243BEFB");
        let footer = &block[0x2A4..];
        assert_eq!(hex::encode_upper(&footer[..16]), "6693D38699662A8FF799CAD70250011A");
        assert_eq!(hex::encode_upper(&footer[16..20]), "69FF1B29");
        assert_eq!(&footer[20..], &NONCE);
    }

    #[test]
    fn decrypt_recovers_payload() {
        let cipher = cipher();
        let block = cipher.encrypt(&payload()).unwrap();
        assert_eq!(cipher.decrypt(&block).unwrap(), payload());
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let cipher = cipher();
        assert_ne!(cipher.encrypt(&payload()).unwrap(), cipher.encrypt(&payload()).unwrap());
    }

    #[test]
    fn fails_closed() {
        let cipher = cipher();
        let block = cipher.encrypt_with_nonce(&payload(), &NONCE).unwrap();

        let mut tampered = block.clone();
        tampered[5] ^= 1;
        assert!(matches!(cipher.decrypt(&tampered), Err(Error::EsBlock("bad MAC"))));

        let mut tampered = block.clone();
        tampered[0x2A4 + 16] ^= 1;
        assert!(matches!(cipher.decrypt(&tampered), Err(Error::EsBlock("bad marker"))));

        let mut tampered = block.clone();
        tampered[0x2A4 + 19] ^= 1;
        assert!(matches!(cipher.decrypt(&tampered), Err(Error::EsBlock("bad length"))));

        assert!(matches!(cipher.decrypt(&block[..0x10]), Err(Error::EsBlock(_))));

        let other = EsCipher::new(&[0x55; 16]);
        assert!(other.decrypt(&block).is_err());
    }
}
