//! Title metadata and the header of the application it describes.
//!
//! Only single-content titles are supported, which makes a TMD exactly 0x208 bytes:
//!
//! ```text
//! 0x000  signature type (u32 BE), RSA-2048 signature, padding
//! 0x140  issuer                        <- signed payload starts here
//! 0x180  version, ca crl / signer crl versions
//! 0x184  system version (u64 BE)
//! 0x18C  title id (u64 BE)
//! 0x194  title type (u32 BE), group id (u16 BE)
//! 0x19A  public / private save size (u32 LE each)
//! 0x1DC  title version (u16 BE), content count (u16 BE), boot index (u16 BE)
//! 0x1E4  content record: id (u32 BE), index, type (u16 BE), size (u64 BE), SHA-1
//! ```

use std::fs;
use std::path::Path;

use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, be_u64, le_u32, u8},
    sequence::tuple,
};
use serde::{Deserialize, Serialize};

use crate::crypto::SHA1_LEN;
use crate::error::{Error, Result};
use crate::pki::{Certificate, SIGNATURE_LENGTH};
use crate::util::{c_str, hex_serialize};

pub const TMD_SIZE: usize = 0x208;
pub const SIGNATURE_TYPE_RSA_2048_SHA1: u32 = 0x0001_0001;
const SIGNED_PAYLOAD_OFFSET: usize = 0x140;
const CONTENT_COUNT_OFFSET: usize = 0x1DE;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ContentRecord {
    pub id: u32,
    pub index: u16,
    #[serde(rename = "type")]
    pub kind: u16,
    pub size: u64,
    #[serde(serialize_with = "hex_serialize")]
    pub sha1: [u8; SHA1_LEN],
}

impl ContentRecord {
    fn from_bytes(i: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, (id, index, kind, size, digest)) = tuple((be_u32, be_u16, be_u16, be_u64, take(SHA1_LEN)))(i)?;
        let mut sha1 = [0u8; SHA1_LEN];
        sha1.copy_from_slice(digest);
        Ok((i, Self { id, index, kind, size, sha1 }))
    }

    /// File name of this content next to its TMD.
    pub fn file_name(&self) -> String {
        format!("{:08x}.app", self.id)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TitleMetadata {
    pub signature_type: u32,
    pub issuer: String,
    pub version: u8,
    pub system_version: u64,
    pub title_id: u64,
    pub title_type: u32,
    pub group_id: u16,
    pub public_save_size: u32,
    pub private_save_size: u32,
    pub title_version: u16,
    pub boot_index: u16,
    pub content: ContentRecord,
    #[serde(skip)]
    raw: Vec<u8>,
}

impl TitleMetadata {
    fn from_bytes(raw: &[u8]) -> nom::IResult<&[u8], Self, ()> {
        let (i, (signature_type, _signature, _padding)) = tuple((be_u32, take(SIGNATURE_LENGTH), take(0x3Cu8)))(raw)?;
        let (i, (issuer, version, _crl_versions, _reserved)) = tuple((take(0x40u8), u8, take(2u8), u8))(i)?;
        let (i, (system_version, title_id, title_type, group_id)) = tuple((be_u64, be_u64, be_u32, be_u16))(i)?;
        let (i, (public_save_size, private_save_size)) = tuple((le_u32, le_u32))(i)?;
        let (i, _reserved) = take(0x3Au8)(i)?;
        let (i, (title_version, _content_count, boot_index, _padding)) = tuple((be_u16, be_u16, be_u16, be_u16))(i)?;
        let (i, content) = ContentRecord::from_bytes(i)?;
        Ok((
            i,
            Self {
                signature_type,
                issuer: c_str(issuer),
                version,
                system_version,
                title_id,
                title_type,
                group_id,
                public_save_size,
                private_save_size,
                title_version,
                boot_index,
                content,
                raw: Vec::new(),
            },
        ))
    }

    /// Parse and structurally validate a single-content TMD.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < CONTENT_COUNT_OFFSET + 2 {
            return Err(Error::malformed("TMD", format!("only {} bytes", raw.len())));
        }
        let count = u16::from_be_bytes([raw[CONTENT_COUNT_OFFSET], raw[CONTENT_COUNT_OFFSET + 1]]);
        if count != 1 {
            return Err(Error::malformed("TMD", format!("{} contents, only single-content titles are supported", count)));
        }
        if raw.len() != TMD_SIZE {
            return Err(Error::malformed("TMD", format!("{} bytes, a single-content TMD is {:#x}", raw.len(), TMD_SIZE)));
        }
        let (_, mut tmd) = Self::from_bytes(&raw).map_err(|_| Error::malformed("TMD", "truncated"))?;
        if tmd.signature_type != SIGNATURE_TYPE_RSA_2048_SHA1 {
            return Err(Error::malformed("TMD", format!("signature type {:#010x}", tmd.signature_type)));
        }
        tmd.raw = raw;
        Ok(tmd)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(Error::file(path))?;
        let tmd = Self::parse(raw)?;
        info!("TMD {}: title {:016x} v{}, content {:08x} ({} bytes)", path.display(), tmd.title_id, tmd.title_version, tmd.content.id, tmd.content.size);
        Ok(tmd)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn signature(&self) -> &[u8] {
        &self.raw[4..4 + SIGNATURE_LENGTH]
    }

    pub fn signed_payload(&self) -> &[u8] {
        &self.raw[SIGNED_PAYLOAD_OFFSET..]
    }

    /// Title id as (high, low) halves, the way install paths spell it.
    pub fn title_id_halves(&self) -> (u32, u32) {
        ((self.title_id >> 32) as u32, self.title_id as u32)
    }

    /// Check issuer binding and signature against `certificate`.
    pub fn verify_signature(&self, certificate: &Certificate) -> Result<()> {
        let expected = certificate.issuer_path();
        if self.issuer != expected {
            return Err(Error::CertificateMismatch { field: "TMD issuer", expected, found: self.issuer.clone() });
        }
        certificate.verifier().verify(self.signature(), self.signed_payload())
    }
}

bitflags::bitflags! {
    pub struct Region: u32 {
        const JAPAN = 0x01;
        const USA = 0x02;
        const EUROPE = 0x04;
        const AUSTRALIA = 0x08;
        const CHINA = 0x10;
        const KOREA = 0x20;
    }
}

pub const REGION_FREE: u32 = 0xFFFF_FFFF;

/// The region a console is set up for, as named in configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRegion {
    Japan,
    Usa,
    Europe,
    Australia,
    China,
    Korea,
}

impl DeviceRegion {
    pub fn flag(self) -> Region {
        match self {
            DeviceRegion::Japan => Region::JAPAN,
            DeviceRegion::Usa => Region::USA,
            DeviceRegion::Europe => Region::EUROPE,
            DeviceRegion::Australia => Region::AUSTRALIA,
            DeviceRegion::China => Region::CHINA,
            DeviceRegion::Korea => Region::KOREA,
        }
    }
}

/// The fields of an application header the installer looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppHeader {
    pub region_mask: u32,
    pub title_id: u64,
}

impl AppHeader {
    pub const REGION_OFFSET: usize = 0x1B0;
    pub const TITLE_ID_OFFSET: usize = 0x230;
    pub const SIZE: usize = Self::TITLE_ID_OFFSET + 8;

    pub fn parse(header: &[u8]) -> Result<Self> {
        if header.len() < Self::SIZE {
            return Err(Error::malformed("application header", format!("only {} bytes", header.len())));
        }
        let mut region = [0u8; 4];
        region.copy_from_slice(&header[Self::REGION_OFFSET..Self::REGION_OFFSET + 4]);
        let mut title_id = [0u8; 8];
        title_id.copy_from_slice(&header[Self::TITLE_ID_OFFSET..Self::SIZE]);
        Ok(Self { region_mask: u32::from_le_bytes(region), title_id: u64::from_le_bytes(title_id) })
    }

    pub fn is_region_free(&self) -> bool {
        self.region_mask == REGION_FREE
    }

    pub fn runs_in(&self, region: Region) -> bool {
        self.is_region_free() || self.region_mask & region.bits() != 0
    }
}
