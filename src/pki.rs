//! Certificate records from the system store and RSA-2048 signature checks.
//!
//! Only the raw public-key operation is done here. The padding is checked by hand against the
//! one layout the console uses (PKCS#1 v1.5 with a SHA-1 `DigestInfo`), and the recovered
//! digest is handed back so callers can compare it with their own hash of the payload.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use nom::{
    bytes::complete::take,
    number::complete::be_u32,
    sequence::tuple,
};
use rsa::{BigUint, PublicKeyParts as _, RsaPublicKey};

use crate::crypto::{sha1, SHA1_LEN};
use crate::error::{Error, Result};
use crate::util::c_str;

pub const SIGNATURE_LENGTH: usize = 256;
pub const CERT_RECORD_SIZE: usize = 0x300;
pub const KEY_TYPE_RSA_2048: u32 = 1;

/// `DigestInfo` header for SHA-1, ending in the digest length.
const SHA1_DIGEST_INFO: [u8; 15] = [0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14];
const MIN_PADDING: usize = 8;

/// A named RSA public key as stored in `sys/cert.sys`.
#[derive(Clone, PartialEq)]
pub struct Certificate {
    pub issuer: String,
    pub key_type: u32,
    pub name: String,
    pub key_id: u32,
    pub key: RsaPublicKey,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("issuer", &self.issuer)
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("modulus", &hex::encode_upper(self.key.n().to_bytes_be()))
            .field("exponent", &self.key.e())
            .finish()
    }
}

struct RawRecord<'a> {
    issuer: &'a [u8],
    key_type: u32,
    name: &'a [u8],
    key_id: u32,
    modulus: &'a [u8],
    exponent: &'a [u8],
}

fn raw_record(i: &[u8]) -> nom::IResult<&[u8], RawRecord<'_>, ()> {
    let (i, (_sig_type, _signature, _padding)) = tuple((be_u32, take(0x100u16), take(0x3Cu8)))(i)?;
    let (i, (issuer, key_type, name, key_id)) = tuple((take(0x40u8), be_u32, take(0x40u8), be_u32))(i)?;
    let (i, (modulus, exponent, _padding)) = tuple((take(0x100u16), take(4u8), take(0x34u8)))(i)?;
    Ok((i, RawRecord { issuer, key_type, name, key_id, modulus, exponent }))
}

impl Certificate {
    pub fn parse(record: &[u8]) -> Result<Self> {
        let (_, raw) = raw_record(record)
            .map_err(|_| Error::malformed("certificate", format!("record is {} bytes, need {:#x}", record.len(), CERT_RECORD_SIZE)))?;
        if raw.key_type != KEY_TYPE_RSA_2048 {
            return Err(Error::malformed("certificate", format!("key type {} is not RSA-2048", raw.key_type)));
        }
        let n = BigUint::from_bytes_be(raw.modulus);
        let e = BigUint::from_bytes_be(raw.exponent);
        let key = RsaPublicKey::new(n, e).map_err(|e| Error::malformed("certificate", e.to_string()))?;
        Ok(Self {
            issuer: c_str(raw.issuer),
            key_type: raw.key_type,
            name: c_str(raw.name),
            key_id: raw.key_id,
            key,
        })
    }

    /// Read the record at `offset` of the certificate store at `path`.
    pub fn load(path: &Path, offset: u64) -> Result<Self> {
        let mut record = [0u8; CERT_RECORD_SIZE];
        let mut file = File::open(path).map_err(Error::file(path))?;
        file.seek(SeekFrom::Start(offset)).map_err(Error::file(path))?;
        file.read_exact(&mut record).map_err(Error::file(path))?;
        let certificate = Self::parse(&record)?;
        debug!("loaded {:?} from {}", certificate, path.display());
        Ok(certificate)
    }

    /// Require exact issuer and key names.
    pub fn check_names(&self, issuer: &str, name: &str) -> Result<()> {
        if self.name != name {
            return Err(Error::CertificateMismatch { field: "key name", expected: name.into(), found: self.name.clone() });
        }
        if self.issuer != issuer {
            return Err(Error::CertificateMismatch { field: "issuer", expected: issuer.into(), found: self.issuer.clone() });
        }
        Ok(())
    }

    /// Issuer string of anything this key signs, e.g. `Root-CA00000001-CP00000007`.
    pub fn issuer_path(&self) -> String {
        format!("{}-{}", self.issuer, self.name)
    }

    pub fn verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(self.key.clone())
    }
}

/// RSA-2048 / SHA-1 signature checks against one public key.
#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    key: RsaPublicKey,
}

impl SignatureVerifier {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Run the public-key operation and return the digest the padding wraps.
    ///
    /// Every malformed input, whatever the reason, is [`Error::BadSignature`].
    pub fn recover_digest(&self, signature: &[u8]) -> Result<[u8; SHA1_LEN]> {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(Error::BadSignature);
        }
        let s = BigUint::from_bytes_be(signature);
        if &s >= self.key.n() {
            return Err(Error::BadSignature);
        }
        let m = s.modpow(self.key.e(), self.key.n()).to_bytes_be();
        if m.len() > SIGNATURE_LENGTH {
            return Err(Error::BadSignature);
        }
        let mut em = [0u8; SIGNATURE_LENGTH];
        em[SIGNATURE_LENGTH - m.len()..].copy_from_slice(&m);
        trace!("recovered block: {}", delog::hex_str!(&em[..]));
        unpad(&em)
    }

    /// Check `signature` over `payload`.
    pub fn verify(&self, signature: &[u8], payload: &[u8]) -> Result<()> {
        let recovered = self.recover_digest(signature)?;
        if recovered != sha1(payload) {
            debug!("signed digest {}, payload digest {}", hex::encode(recovered), hex::encode(sha1(payload)));
            return Err(Error::BadSignature);
        }
        Ok(())
    }
}

fn unpad(em: &[u8; SIGNATURE_LENGTH]) -> Result<[u8; SHA1_LEN]> {
    let digest_at = SIGNATURE_LENGTH - SHA1_LEN;
    let info_at = digest_at - SHA1_DIGEST_INFO.len();
    let separator_at = info_at - 1;

    let header_ok = em[0] == 0x00 && em[1] == 0x01;
    let padding_ok = separator_at - 2 >= MIN_PADDING && em[2..separator_at].iter().all(|&b| b == 0xFF);
    let info_ok = em[separator_at] == 0x00 && em[info_at..digest_at] == SHA1_DIGEST_INFO;
    if !(header_ok && padding_ok && info_ok) {
        return Err(Error::BadSignature);
    }
    let mut digest = [0u8; SHA1_LEN];
    digest.copy_from_slice(&em[digest_at..]);
    Ok(digest)
}

/// Encode `digest` into a 256 byte block ready for the private-key operation.
pub fn pad_digest(digest: &[u8; SHA1_LEN]) -> [u8; SIGNATURE_LENGTH] {
    let mut em = [0xFFu8; SIGNATURE_LENGTH];
    let digest_at = SIGNATURE_LENGTH - SHA1_LEN;
    let info_at = digest_at - SHA1_DIGEST_INFO.len();
    em[0] = 0x00;
    em[1] = 0x01;
    em[info_at - 1] = 0x00;
    em[info_at..digest_at].copy_from_slice(&SHA1_DIGEST_INFO);
    em[digest_at..].copy_from_slice(digest);
    em
}
