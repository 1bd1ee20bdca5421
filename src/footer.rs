//! The identity footer appended to file-backed NAND images.
//!
//! ```text
//! 0x00  "DSi eMMC CID/CPU"
//! 0x10  eMMC CID
//! 0x20  console id, byte-reversed
//! 0x28  zero padding
//! ```

use crate::blockdev::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;

pub const FOOTER_SIZE: usize = 64;
pub const MAGIC: &[u8; 16] = b"DSi eMMC CID/CPU";

/// What the length of an image says about its trailer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageLayout {
    Bare { sectors: u64 },
    WithFooter { sectors: u64 },
}

impl ImageLayout {
    pub fn from_len(len: u64) -> Result<Self> {
        let sectors = len / SECTOR_SIZE as u64;
        match (len % SECTOR_SIZE as u64) as usize {
            0 => Ok(ImageLayout::Bare { sectors }),
            FOOTER_SIZE => Ok(ImageLayout::WithFooter { sectors }),
            _ => Err(Error::WrongSize(len)),
        }
    }

    pub fn sectors(&self) -> u64 {
        match *self {
            ImageLayout::Bare { sectors } | ImageLayout::WithFooter { sectors } => sectors,
        }
    }

    pub fn has_footer(&self) -> bool {
        matches!(self, ImageLayout::WithFooter { .. })
    }
}

pub fn encode(identity: &DeviceIdentity) -> [u8; FOOTER_SIZE] {
    let mut footer = [0u8; FOOTER_SIZE];
    footer[..0x10].copy_from_slice(MAGIC);
    footer[0x10..0x20].copy_from_slice(&identity.cid);
    let mut console_id = identity.console_id;
    console_id.reverse();
    footer[0x20..0x28].copy_from_slice(&console_id);
    footer
}

/// Recover the identity recorded in a footer.
pub fn decode(footer: &[u8]) -> Result<DeviceIdentity> {
    if footer.len() != FOOTER_SIZE {
        return Err(Error::malformed("image footer", format!("{} bytes", footer.len())));
    }
    if &footer[..0x10] != MAGIC {
        return Err(Error::BadMagic);
    }
    let mut identity = DeviceIdentity::new([0; 8], [0; 16]);
    identity.cid.copy_from_slice(&footer[0x10..0x20]);
    identity.console_id.copy_from_slice(&footer[0x20..0x28]);
    identity.console_id.reverse();
    Ok(identity)
}

/// Check that `footer` is well formed and records `identity`.
pub fn validate(footer: &[u8], identity: &DeviceIdentity) -> Result<()> {
    let recorded = decode(footer)?;
    if recorded != *identity {
        debug!("footer records {:?}, expected {:?}", recorded, identity);
        return Err(Error::IdentityMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_identity;

    #[test]
    fn round_trip() {
        let footer = encode(&test_identity());
        assert_eq!(&footer[0x20..0x28], &[0x36, 0x01, 0x11, 0x17, 0x26, 0x52, 0xA1, 0x08]);
        assert!(footer[0x28..].iter().all(|&b| b == 0));
        validate(&footer, &test_identity()).unwrap();
        assert_eq!(decode(&footer).unwrap(), test_identity());
    }

    #[test]
    fn any_magic_flip_fails() {
        let footer = encode(&test_identity());
        for i in 0..MAGIC.len() {
            for bit in 0..8 {
                let mut flipped = footer;
                flipped[i] ^= 1 << bit;
                assert!(matches!(validate(&flipped, &test_identity()), Err(Error::BadMagic)));
            }
        }
    }

    #[test]
    fn other_identity_mismatches() {
        let footer = encode(&test_identity());
        let mut other = test_identity();
        other.console_id[7] ^= 1;
        assert!(matches!(validate(&footer, &other), Err(Error::IdentityMismatch)));
    }

    #[test]
    fn layout_from_length() {
        assert_eq!(ImageLayout::from_len(1024).unwrap(), ImageLayout::Bare { sectors: 2 });
        assert_eq!(ImageLayout::from_len(1024 + 64).unwrap(), ImageLayout::WithFooter { sectors: 2 });
        assert!(matches!(ImageLayout::from_len(1024 + 63), Err(Error::WrongSize(1087))));
    }
}
