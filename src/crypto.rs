//! The NAND sector cipher and the SHA-1 helpers shared by the install paths.
//!
//! The sector cipher is AES-128 in counter mode, with the console's byte order quirk:
//! the counter block is fed to AES big-endian, and the resulting keystream block is
//! byte-reversed before it is XORed onto the data. Block `i` of the NAND (16-byte units,
//! counted from the start of the device, not the start of a call) uses counter `base + i`.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha1::{Digest as _, Sha1};

use crate::error::{Error, Result};
use crate::keys::{Counter, KeyMaterial};

pub mod es_block;

pub const BLOCK_SIZE: usize = 16;
pub const SHA1_LEN: usize = 20;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash everything `reader` yields, using `buf` as the read buffer.
///
/// Returns the digest and the number of bytes hashed.
pub fn sha1_reader(mut reader: impl Read, buf: &mut [u8]) -> io::Result<([u8; SHA1_LEN], u64)> {
    let mut hasher = Sha1::new();
    let mut size = 0u64;
    loop {
        let read = match reader.read(buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok((hasher.finalize().into(), size))
}

pub fn sha1_file(path: &Path, buf: &mut [u8]) -> io::Result<([u8; SHA1_LEN], u64)> {
    sha1_reader(File::open(path)?, buf)
}

/// Counter-mode sector cipher. Encryption and decryption are the same operation.
///
/// Holds only the expanded key and the base counter; nothing changes between calls.
#[derive(Clone)]
pub struct NandCipher {
    aes: aes::Aes128,
    key: [u8; 16],
    base: Counter,
}

impl core::fmt::Debug for NandCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NandCipher").field("base", &self.base).finish()
    }
}

impl NandCipher {
    pub fn new(material: &KeyMaterial) -> Self {
        Self {
            aes: aes::Aes128::new(GenericArray::from_slice(&material.key)),
            key: material.key,
            base: material.counter,
        }
    }

    pub fn base_counter(&self) -> Counter {
        self.base
    }

    fn keystream(&self, offset: u64) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(self.base.add(offset as u128).to_block());
        self.aes.encrypt_block(&mut block);
        let mut keystream: [u8; BLOCK_SIZE] = block.into();
        keystream.reverse();
        keystream
    }

    /// Crypt the single block at block `offset`.
    pub fn crypt_block(&self, block: &mut [u8; BLOCK_SIZE], offset: u64) {
        let keystream = self.keystream(offset);
        for (byte, key) in block.iter_mut().zip(keystream.iter()) {
            *byte ^= key;
        }
    }

    /// Crypt `data` in place, starting at block `offset`.
    ///
    /// `data` must be a whole number of blocks. The result is identical to calling
    /// [`crypt_block`](Self::crypt_block) on each block with consecutive offsets.
    pub fn crypt(&self, data: &mut [u8], offset: u64) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(Error::Unaligned { what: "cipher input", unit: BLOCK_SIZE, len: data.len() });
        }
        let blocks = (data.len() / BLOCK_SIZE) as u128;
        let start = self.base.add(offset as u128);

        // the stream cipher refuses to run past the end of its counter space,
        // so a range that reaches the wrap point goes block by block
        if start.0 > u128::MAX - blocks {
            for (i, chunk) in data.chunks_exact_mut(BLOCK_SIZE).enumerate() {
                let keystream = self.keystream(offset.wrapping_add(i as u64));
                for (byte, key) in chunk.iter_mut().zip(keystream.iter()) {
                    *byte ^= key;
                }
            }
            return Ok(());
        }

        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            chunk.reverse();
        }
        let mut ctr = Aes128Ctr::new(&self.key.into(), &start.to_block().into());
        ctr.apply_keystream(data);
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            chunk.reverse();
        }
        Ok(())
    }

    /// Crypt `src` into `dst`, starting at block `offset`.
    pub fn crypt_into(&self, dst: &mut [u8], src: &[u8], offset: u64) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::malformed("cipher output", format!("{} bytes for {} bytes of input", dst.len(), src.len())));
        }
        dst.copy_from_slice(src);
        self.crypt(dst, offset)
    }

    /// Crypt whole sectors in place, starting at `sector`.
    pub fn crypt_sectors(&self, data: &mut [u8], sector: u64) -> Result<()> {
        let offset = sector
            .checked_mul(crate::sector0::BLOCKS_PER_SECTOR)
            .ok_or_else(|| Error::malformed("sector number", format!("{:#x} is past any device", sector)))?;
        self.crypt(data, offset)
    }
}
