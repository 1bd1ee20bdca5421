//! The decrypted view of a NAND.
//!
//! [`Nand::open`] is the composition root for everything that touches raw flash: it detects
//! the variant, derives the key material and proves it correct by decrypting and parsing
//! sector 0. The resulting [`Nand`] is itself a [`BlockDevice`] whose sectors are plaintext,
//! which is what the external FAT driver mounts.

use crate::blockdev::{check_request, BlockDevice, SECTOR_SIZE};
use crate::crypto::NandCipher;
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::keys::{self, Variant};
use crate::sector0::{detect_variant, repair_fat_signature, PartitionTable};

/// Writes are encrypted through a buffer of this many sectors.
pub const CHUNK_SECTORS: usize = 64;

pub struct Nand<D> {
    device: D,
    cipher: NandCipher,
    variant: Variant,
    table: PartitionTable,
    fat_fix_sector: Option<u64>,
    chunk: Vec<u8>,
}

impl<D> core::fmt::Debug for Nand<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Nand")
            .field("variant", &self.variant)
            .field("table", &self.table)
            .field("fat_fix_sector", &self.fat_fix_sector)
            .finish()
    }
}

impl<D: BlockDevice> Nand<D> {
    /// Derive the cipher for `identity` and check it against sector 0 of `device`.
    pub fn open(mut device: D, identity: &DeviceIdentity) -> Result<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sectors(0, 1, &mut sector)?;

        let variant = detect_variant(&sector);
        info!("{} mode", variant);

        let cipher = NandCipher::new(&keys::derive(identity, variant));
        cipher.crypt_sectors(&mut sector, 0)?;
        let table = PartitionTable::validate(&sector, variant)?;
        info!("MBR OK, main partition at sector {:#x}", table.main().offset);

        let fat_fix_sector = match variant {
            Variant::Dsi => Some(table.main().offset as u64),
            Variant::ThreeDs => None,
        };

        Ok(Self {
            device,
            cipher,
            variant,
            table,
            fat_fix_sector,
            chunk: vec![0u8; CHUNK_SECTORS * SECTOR_SIZE],
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn partition_table(&self) -> &PartitionTable {
        &self.table
    }

    pub fn cipher(&self) -> &NandCipher {
        &self.cipher
    }

    /// The main partition as `(first sector, sector count)`.
    pub fn main_partition(&self) -> (u64, u64) {
        let main = self.table.main();
        (main.offset as u64, main.length as u64)
    }

    pub fn into_inner(self) -> D {
        self.device
    }
}

impl<D: BlockDevice> BlockDevice for Nand<D> {
    fn sector_count(&self) -> u64 {
        self.device.sector_count()
    }

    fn read_sectors(&mut self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        check_request(self.device.sector_count(), start, count, buf.len())?;
        self.device.read_sectors(start, count, buf)?;
        self.cipher.crypt_sectors(buf, start)?;

        if let Some(fix) = self.fat_fix_sector {
            if fix >= start && fix < start + count as u64 {
                let at = (fix - start) as usize * SECTOR_SIZE;
                repair_fat_signature(&mut buf[at..at + SECTOR_SIZE]);
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, count: usize, buf: &[u8]) -> Result<()> {
        check_request(self.device.sector_count(), start, count, buf.len())?;
        for (i, plain) in buf.chunks(CHUNK_SECTORS * SECTOR_SIZE).enumerate() {
            let sector = start + (i * CHUNK_SECTORS) as u64;
            let chunk = &mut self.chunk[..plain.len()];
            self.cipher.crypt_into(chunk, plain, sector * crate::sector0::BLOCKS_PER_SECTOR)?;
            self.device.write_sectors(sector, plain.len() / SECTOR_SIZE, chunk)?;
        }
        Ok(())
    }
}
