//! Sector 0: variant detection, the partition table and the FAT signature repair.
//!
//! On 3DS consoles the raw (still encrypted) sector 0 carries an NCSD header at 0x100,
//! which is how the variant is detected before any key is derived. Decrypted, both
//! variants hold a classic MBR partition table at 0x1BE whose first two entries are fixed
//! per variant; comparing against them is how a wrong console id is caught.

use nom::{
    bytes::complete::{tag, take},
    multi::fill,
    number::complete::{le_u32, le_u64, u8},
    sequence::tuple,
};
use serde::{Deserialize, Serialize};

use crate::blockdev::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::keys::Variant;

pub const BLOCKS_PER_SECTOR: u64 = (SECTOR_SIZE / crate::crypto::BLOCK_SIZE) as u64;

const NCSD_OFFSET: usize = 0x100;
const MBR_OFFSET: usize = 0x1BE;
const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const FAT_SIGNATURE_OFFSET: usize = 0x36;

/// 3DS NAND header, media units are 512 bytes.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NcsdHeader {
    pub media_size: u32,
    pub media_id: u64,
    pub fs_types: [u8; 8],
    pub crypt_types: [u8; 8],
    /// (offset, size) pairs.
    pub partitions: [(u32, u32); 8],
}

impl NcsdHeader {
    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, _magic) = tag("NCSD")(i)?;
        let (i, (media_size, media_id)) = tuple((le_u32, le_u64))(i)?;
        let mut header = NcsdHeader { media_size, media_id, ..Default::default() };
        let (i, fs_types) = take(8u8)(i)?;
        let (i, crypt_types) = take(8u8)(i)?;
        header.fs_types.copy_from_slice(fs_types);
        header.crypt_types.copy_from_slice(crypt_types);
        let (i, ()) = fill(|i| tuple((le_u32, le_u32))(i), &mut header.partitions)(i)?;
        Ok((i, header))
    }

    /// Parse the header out of a raw sector 0, if there is one.
    pub fn parse(sector: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes(sector.get(NCSD_OFFSET..)?).ok()?;
        Some(header)
    }
}

/// Detect the console family from the raw, undecrypted sector 0.
pub fn detect_variant(raw_sector: &[u8]) -> Variant {
    match NcsdHeader::parse(raw_sector) {
        Some(header) => {
            debug!("NCSD header: {:?}", header);
            Variant::ThreeDs
        }
        None => Variant::Dsi,
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PartitionEntry {
    pub status: u8,
    /// head, sector|cylinder-high, cylinder-low
    pub start_chs: [u8; 3],
    #[serde(rename = "type")]
    pub kind: u8,
    pub end_chs: [u8; 3],
    /// First sector.
    pub offset: u32,
    /// Length in sectors.
    pub length: u32,
}

impl PartitionEntry {
    const SIZE: usize = 16;

    const fn new(start_chs: [u8; 3], kind: u8, end_chs: [u8; 3], offset: u32, length: u32) -> Self {
        Self { status: 0, start_chs, kind, end_chs, offset, length }
    }

    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, (status, start_chs, kind, end_chs, offset, length)) =
            tuple((u8, take(3u8), u8, take(3u8), le_u32, le_u32))(i)?;
        let mut entry = PartitionEntry { status, kind, offset, length, ..Default::default() };
        entry.start_chs.copy_from_slice(start_chs);
        entry.end_chs.copy_from_slice(end_chs);
        Ok((i, entry))
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.status;
        bytes[1..4].copy_from_slice(&self.start_chs);
        bytes[4] = self.kind;
        bytes[5..8].copy_from_slice(&self.end_chs);
        bytes[8..12].copy_from_slice(&self.offset.to_le_bytes());
        bytes[12..].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

const DSI_LAYOUT: [PartitionEntry; 3] = [
    PartitionEntry::new([3, 24, 4], 6, [15, 224, 59], 0x877, 0x66F89),
    PartitionEntry::new([2, 206, 60], 6, [15, 224, 190], 0x6784D, 0x105B3),
    PartitionEntry::new([2, 222, 191], 1, [15, 224, 191], 0x77E5D, 0x1A3),
];

const THREE_DS_LAYOUT: [PartitionEntry; 2] = [
    PartitionEntry::new([4, 24, 0], 6, [1, 160, 63], 0x97, 0x47DA9),
    PartitionEntry::new([4, 142, 64], 6, [1, 160, 195], 0x4808D, 0x105B3),
];

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PartitionTable {
    pub entries: [PartitionEntry; 4],
}

impl PartitionTable {
    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let mut table = PartitionTable::default();
        let (i, ()) = fill(PartitionEntry::from_bytes, &mut table.entries)(i)?;
        Ok((i, table))
    }

    /// The layout every console of `variant` ships with.
    pub fn reference(variant: Variant) -> Self {
        let mut table = PartitionTable::default();
        match variant {
            Variant::Dsi => table.entries[..3].copy_from_slice(&DSI_LAYOUT),
            Variant::ThreeDs => table.entries[..2].copy_from_slice(&THREE_DS_LAYOUT),
        }
        table
    }

    /// Partition 0 holds the main FAT filesystem.
    pub fn main(&self) -> &PartitionEntry {
        &self.entries[0]
    }

    /// Write the table and boot signature into a sector.
    pub fn write(&self, sector: &mut [u8; SECTOR_SIZE]) {
        for (i, entry) in self.entries.iter().enumerate() {
            let at = MBR_OFFSET + i * PartitionEntry::SIZE;
            sector[at..at + PartitionEntry::SIZE].copy_from_slice(&entry.to_bytes());
        }
        sector[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
    }

    /// Parse and check a decrypted sector 0.
    pub fn validate(sector: &[u8], variant: Variant) -> Result<Self> {
        if sector.len() != SECTOR_SIZE {
            return Err(Error::Unaligned { what: "sector 0", unit: SECTOR_SIZE, len: sector.len() });
        }
        if sector[BOOT_SIGNATURE_OFFSET..] != BOOT_SIGNATURE {
            trace!("sector 0 tail: {}", delog::hex_str!(&sector[BOOT_SIGNATURE_OFFSET..]));
            return Err(Error::Sector0Mismatch("boot signature"));
        }
        if variant == Variant::Dsi && sector[..MBR_OFFSET].iter().any(|&b| b != 0) {
            warn!("bootstrap area of the DSi MBR is not empty");
        }

        let (_, table) = Self::from_bytes(&sector[MBR_OFFSET..BOOT_SIGNATURE_OFFSET])
            .map_err(|_| Error::Sector0Mismatch("partition table"))?;

        let reference = Self::reference(variant);
        for (i, (entry, expected)) in table.entries.iter().zip(reference.entries.iter()).take(2).enumerate() {
            if entry != expected {
                debug!("partition {}: found {:?}, expected {:?}", i, entry, expected);
                return Err(Error::Sector0Mismatch("partition table"));
            }
        }
        Ok(table)
    }
}

/// Restore a zeroed FAT signature in the boot sector of the main partition.
///
/// Some consoles ship with these bytes cleared. Returns whether the sector was changed.
pub fn repair_fat_signature(boot_sector: &mut [u8]) -> bool {
    match boot_sector.get_mut(FAT_SIGNATURE_OFFSET..FAT_SIGNATURE_OFFSET + 3) {
        Some(signature) if signature.iter().all(|&b| b == 0) => {
            signature.copy_from_slice(b"FAT");
            warn!("restored missing FAT signature in partition boot sector");
            true
        }
        _ => false,
    }
}
