//! Console-unique key derivation.
//!
//! The NAND key is built from a per-variant `KEY_X` (assembled from the console id) and a
//! fixed `KEY_Y`:
//! ```ignore
//! key = ((KEY_X ^ KEY_Y) + MAGIC) rotl 42
//! ```
//! with all arithmetic on 128-bit integers whose limb 0 is the least significant 32 bits.
//! The AES key is the big-endian byte representation of `key`.
//!
//! The base counter is the first 16 bytes of SHA-1 over the eMMC CID, read little-endian.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::sha1;
use crate::identity::DeviceIdentity;

const KEY_Y: u128 = 0xE1A0_0005_202D_DD1D_BD4D_C4D3_0AB9_DC76;
const ES_KEY_Y: u128 = 0xA936_1239_DCE8_179C_72C9_D056_8B5A_CCE5;
const KEY_MAGIC: u128 = 0xFFFE_FB4E_2959_0258_2A68_0F5F_1A4F_3E79;

/// The two supported console families. They share the scheme but not the `KEY_X` constants.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Dsi,
    #[serde(rename = "3ds")]
    ThreeDs,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::Dsi => "DSi",
            Variant::ThreeDs => "3DS",
        })
    }
}

/// 128-bit counter, viewed as four 32-bit limbs with limb 0 least significant.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Counter(pub u128);

impl Counter {
    pub fn from_limbs(limbs: [u32; 4]) -> Self {
        Counter(
            limbs[0] as u128
                | (limbs[1] as u128) << 32
                | (limbs[2] as u128) << 64
                | (limbs[3] as u128) << 96,
        )
    }

    pub fn limbs(&self) -> [u32; 4] {
        [self.0 as u32, (self.0 >> 32) as u32, (self.0 >> 64) as u32, (self.0 >> 96) as u32]
    }

    /// Add with carry across all four limbs, wrapping at 2^128.
    pub fn add(self, offset: u128) -> Self {
        Counter(self.0.wrapping_add(offset))
    }

    /// The counter block as fed to the block cipher.
    pub fn to_block(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({:#034x})", self.0)
    }
}

/// Everything the sector cipher needs. Derived once per session.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct KeyMaterial {
    pub key: [u8; 16],
    pub counter: Counter,
    pub variant: Variant,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &hex::encode_upper(self.key))
            .field("counter", &self.counter)
            .field("variant", &self.variant)
            .finish()
    }
}

fn split_console_id(console_id: &[u8; 8]) -> (u32, u32) {
    let high = u32::from_be_bytes([console_id[0], console_id[1], console_id[2], console_id[3]]);
    let low = u32::from_be_bytes([console_id[4], console_id[5], console_id[6], console_id[7]]);
    (low, high)
}

/// Assemble `KEY_X` from the console id halves.
pub fn key_x(console_id: &[u8; 8], variant: Variant) -> u128 {
    let (low, high) = split_console_id(console_id);
    let limbs = match variant {
        Variant::ThreeDs => [(low ^ 0xB358_A6AF) | 0x8000_0000, 0x544E_494E, 0x4F44_4E45, high ^ 0x08C2_67B7],
        Variant::Dsi => [low, low ^ 0x24EE_6906, high ^ 0xE65B_601D, high],
    };
    Counter::from_limbs(limbs).0
}

/// The key scrambler: `((x ^ y) + MAGIC) rotl 42`, returned as AES key bytes.
pub fn scramble(x: u128, y: u128) -> [u8; 16] {
    ((x ^ y).wrapping_add(KEY_MAGIC)).rotate_left(42).to_be_bytes()
}

pub fn base_counter(cid: &[u8; 16]) -> Counter {
    let digest = sha1(cid);
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    Counter(u128::from_le_bytes(head))
}

/// Derive the sector key and base counter for `identity` on a `variant` console.
pub fn derive(identity: &DeviceIdentity, variant: Variant) -> KeyMaterial {
    let key = scramble(key_x(&identity.console_id, variant), KEY_Y);
    let counter = base_counter(&identity.cid);
    trace!("{} key: {}", variant, delog::hex_str!(&key[..]));
    trace!("base counter: {:?}", counter);
    KeyMaterial { key, counter, variant }
}

/// Key for the ES block transform used on tickets. Always uses the DSi `KEY_X`.
pub fn derive_es_key(console_id: &[u8; 8]) -> [u8; 16] {
    scramble(key_x(console_id, Variant::Dsi), ES_KEY_Y)
}
