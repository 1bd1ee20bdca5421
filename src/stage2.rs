//! Stage2 loader blobs in the unpartitioned start of a DSi NAND.
//!
//! Sector 1 holds the boot info block: 0x20 zero bytes, then one descriptor each for the
//! ARM9 and the ARM7 blob. The blobs sit outside the sector cipher's reach and are
//! encrypted with the boot2 key instead, in the same counter mode and byte order. Each blob
//! starts its own counter at `(size, -size, !size, 0)`, `size` being its rounded size.
//!
//! 3DS consoles keep their firmware elsewhere; there is nothing to extract.

use core::fmt;
use std::io::Write;

use nom::{bytes::complete::take, multi::fill, number::complete::le_u32, sequence::tuple};
use serde::Serialize;
use sha1::{Digest as _, Sha1};

use crate::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::crypto::{NandCipher, SHA1_LEN};
use crate::error::{Error, Result};
use crate::keys::{Counter, KeyMaterial, Variant};
use crate::sector0::{detect_variant, BLOCKS_PER_SECTOR};
use crate::util::hex_serialize;

const INFO_SECTOR: u64 = 1;
const INFO_PADDING: u8 = 0x20;
const CHUNK_SECTORS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage2Part {
    Arm9,
    Arm7,
}

impl fmt::Display for Stage2Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage2Part::Arm9 => "ARM9",
            Stage2Part::Arm7 => "ARM7",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootCodeDescriptor {
    /// Byte offset on the NAND.
    pub offset: u32,
    pub size: u32,
    pub ram_address: u32,
    /// `size` rounded up to whole sectors, the amount stored and crypted.
    pub size_rounded: u32,
}

impl BootCodeDescriptor {
    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, (offset, size, ram_address, size_rounded)) = tuple((le_u32, le_u32, le_u32, le_u32))(i)?;
        Ok((i, Self { offset, size, ram_address, size_rounded }))
    }

    pub fn counter(&self) -> Counter {
        let size = self.size_rounded;
        Counter::from_limbs([size, size.wrapping_neg(), !size, 0])
    }

    /// The boot2 cipher for this blob; block 0 is the blob's first 16 bytes.
    pub fn cipher(&self, key: &[u8; 16]) -> NandCipher {
        NandCipher::new(&KeyMaterial { key: *key, counter: self.counter(), variant: Variant::Dsi })
    }

    fn sectors(&self) -> Result<(u64, u64)> {
        let unit = SECTOR_SIZE as u32;
        if self.offset % unit != 0 || self.size_rounded % unit != 0 {
            return Err(Error::malformed(
                "stage2 descriptor",
                format!("offset {:#x} and size {:#x} must be whole sectors", self.offset, self.size_rounded),
            ));
        }
        Ok(((self.offset / unit) as u64, (self.size_rounded / unit) as u64))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BootInfoBlock {
    pub descriptors: [BootCodeDescriptor; 2],
}

impl BootInfoBlock {
    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, _zero) = take(INFO_PADDING)(i)?;
        let mut block = BootInfoBlock::default();
        let (i, ()) = fill(BootCodeDescriptor::from_bytes, &mut block.descriptors)(i)?;
        Ok((i, block))
    }

    pub fn parse(sector: &[u8]) -> Result<Self> {
        let (_, block) =
            Self::from_bytes(sector).map_err(|_| Error::malformed("stage2 info block", format!("{} bytes", sector.len())))?;
        Ok(block)
    }

    pub fn descriptor(&self, part: Stage2Part) -> &BootCodeDescriptor {
        match part {
            Stage2Part::Arm9 => &self.descriptors[0],
            Stage2Part::Arm7 => &self.descriptors[1],
        }
    }
}

/// What [`dump`] read.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Stage2Dump {
    pub part: Stage2Part,
    pub descriptor: BootCodeDescriptor,
    /// Digest of the blob as stored.
    #[serde(serialize_with = "hex_serialize")]
    pub raw_sha1: [u8; SHA1_LEN],
    /// Digest of the decrypted blob.
    #[serde(serialize_with = "hex_serialize")]
    pub sha1: [u8; SHA1_LEN],
}

/// Decrypt one stage2 blob from a raw (sector-cipher encrypted) DSi device into `out`.
///
/// `progress` is called with (sectors done, sectors total) after every chunk.
pub fn dump<D: BlockDevice>(
    device: &mut D,
    part: Stage2Part,
    key: &[u8; 16],
    out: &mut impl Write,
    mut progress: impl FnMut(u64, u64),
) -> Result<Stage2Dump> {
    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sectors(0, 1, &mut sector)?;
    if detect_variant(&sector) == Variant::ThreeDs {
        return Err(Error::NotOnThreeDs("stage2 extraction"));
    }

    device.read_sectors(INFO_SECTOR, 1, &mut sector)?;
    let descriptor = *BootInfoBlock::parse(&sector)?.descriptor(part);
    info!("{} stage2 at {:#x}, {:#x} bytes ({:#x} stored)", part, descriptor.offset, descriptor.size, descriptor.size_rounded);
    let (first, total) = descriptor.sectors()?;

    let cipher = descriptor.cipher(key);
    let mut raw_hasher = Sha1::new();
    let mut hasher = Sha1::new();
    let mut chunk = vec![0u8; CHUNK_SECTORS * SECTOR_SIZE];

    let mut done = 0u64;
    while done < total {
        let count = (total - done).min(CHUNK_SECTORS as u64) as usize;
        let buf = &mut chunk[..count * SECTOR_SIZE];
        device.read_sectors(first + done, count, buf)?;
        raw_hasher.update(&*buf);
        cipher.crypt(buf, done * BLOCKS_PER_SECTOR)?;
        hasher.update(&*buf);
        out.write_all(buf)?;
        done += count as u64;
        progress(done, total);
    }
    out.flush()?;

    let dump = Stage2Dump { part, descriptor, raw_sha1: raw_hasher.finalize().into(), sha1: hasher.finalize().into() };
    debug!("{} stage2 raw SHA-1 {}, SHA-1 {}", part, hex::encode_upper(dump.raw_sha1), hex::encode_upper(dump.sha1));
    Ok(dump)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::blockdev::RawImage;
    use crate::crypto::sha1;
    use crate::testing::{encrypted_image, test_identity};
    use std::io::{self, Cursor};

    pub const BOOT2_KEY: [u8; 16] = [0x42; 16];

    pub const ARM9: BootCodeDescriptor =
        BootCodeDescriptor { offset: 0x800, size: 0x23F0, ram_address: 0x037B_8000, size_rounded: 0x2400 };
    pub const ARM7: BootCodeDescriptor =
        BootCodeDescriptor { offset: 0x2C00, size: 0x1F4, ram_address: 0x0380_0000, size_rounded: 0x200 };

    pub fn blob(descriptor: &BootCodeDescriptor, seed: u8) -> Vec<u8> {
        (0..descriptor.size_rounded as usize).map(|i| (i as u8).wrapping_mul(seed).wrapping_add(seed)).collect()
    }

    /// Lay both blobs, encrypted with [`BOOT2_KEY`], over the start of `image`.
    pub fn add_stage2(image: &mut [u8]) {
        let mut info = vec![0u8; INFO_PADDING as usize];
        for descriptor in [ARM9, ARM7] {
            for field in [descriptor.offset, descriptor.size, descriptor.ram_address, descriptor.size_rounded] {
                info.extend_from_slice(&field.to_le_bytes());
            }
        }
        image[SECTOR_SIZE..SECTOR_SIZE + info.len()].copy_from_slice(&info);

        for (descriptor, seed) in [(ARM9, 9), (ARM7, 7)] {
            let mut stored = blob(&descriptor, seed);
            descriptor.cipher(&BOOT2_KEY).crypt(&mut stored, 0).unwrap();
            let start = descriptor.offset as usize;
            image[start..start + stored.len()].copy_from_slice(&stored);
        }
    }

    fn device() -> RawImage<Cursor<Vec<u8>>> {
        let mut data = encrypted_image(&test_identity(), Variant::Dsi, 4).into_inner();
        add_stage2(&mut data);
        RawImage::new(Cursor::new(data)).unwrap()
    }

    #[test]
    fn counter_from_rounded_size() {
        assert_eq!(ARM9.counter().limbs(), [0x2400, 0xFFFF_DC00, 0xFFFF_DBFF, 0]);
    }

    #[test]
    fn info_block_layout() {
        let mut device = device();
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sectors(INFO_SECTOR, 1, &mut sector).unwrap();
        let block = BootInfoBlock::parse(&sector).unwrap();
        assert_eq!(*block.descriptor(Stage2Part::Arm9), ARM9);
        assert_eq!(*block.descriptor(Stage2Part::Arm7), ARM7);
        assert!(BootInfoBlock::parse(&sector[..0x30]).is_err());
    }

    #[test]
    fn dumps_both_blobs() {
        let mut device = device();
        for (part, descriptor, seed) in [(Stage2Part::Arm9, ARM9, 9), (Stage2Part::Arm7, ARM7, 7)] {
            let mut out = Vec::new();
            let mut calls = Vec::new();
            let dump = dump(&mut device, part, &BOOT2_KEY, &mut out, |done, total| calls.push((done, total))).unwrap();

            let plain = blob(&descriptor, seed);
            assert_eq!(out, plain);
            assert_eq!(dump.sha1, sha1(&plain));
            let mut stored = plain.clone();
            descriptor.cipher(&BOOT2_KEY).crypt(&mut stored, 0).unwrap();
            assert_eq!(dump.raw_sha1, sha1(&stored));
            assert_eq!(dump.descriptor, descriptor);
            let sectors = descriptor.size_rounded as u64 / SECTOR_SIZE as u64;
            assert_eq!(calls.last(), Some(&(sectors, sectors)));
        }
    }

    #[test]
    fn wrong_key_changes_only_the_plain_digest() {
        let mut device = device();
        let good = dump(&mut device, Stage2Part::Arm7, &BOOT2_KEY, &mut io::sink(), |_, _| {}).unwrap();
        let bad = dump(&mut device, Stage2Part::Arm7, &[0u8; 16], &mut io::sink(), |_, _| {}).unwrap();
        assert_eq!(good.raw_sha1, bad.raw_sha1);
        assert_ne!(good.sha1, bad.sha1);
    }

    #[test]
    fn refuses_three_ds() {
        let data = encrypted_image(&test_identity(), Variant::ThreeDs, 4).into_inner();
        let mut device = RawImage::new(Cursor::new(data)).unwrap();
        let result = dump(&mut device, Stage2Part::Arm9, &BOOT2_KEY, &mut io::sink(), |_, _| {});
        assert!(matches!(result, Err(Error::NotOnThreeDs(_))));
    }

    #[test]
    fn bad_descriptors() {
        let mut data = encrypted_image(&test_identity(), Variant::Dsi, 4).into_inner();
        add_stage2(&mut data);
        // ARM9 offset off by one byte
        data[SECTOR_SIZE + 0x20] = 0x01;
        // ARM7 far past the end of the device
        data[SECTOR_SIZE + 0x30..SECTOR_SIZE + 0x34].copy_from_slice(&0x4000_0000u32.to_le_bytes());
        let mut device = RawImage::new(Cursor::new(data)).unwrap();

        let result = dump(&mut device, Stage2Part::Arm9, &BOOT2_KEY, &mut io::sink(), |_, _| {});
        assert!(matches!(result, Err(Error::Malformed { what: "stage2 descriptor", .. })));
        let result = dump(&mut device, Stage2Part::Arm7, &BOOT2_KEY, &mut io::sink(), |_, _| {});
        assert!(matches!(result, Err(Error::SectorIo { .. })));
    }
}
