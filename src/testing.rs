//! Fixtures shared by the unit tests: a fixed identity, a throwaway RSA-2048 key pair standing
//! in for the system certificate, and builders for the records signed with it.

use std::io::Cursor;

use rsa::BigUint;

use crate::blockdev::SECTOR_SIZE;
use crate::crypto::{sha1, NandCipher};
use crate::identity::DeviceIdentity;
use crate::keys::{self, Variant};
use crate::pki::{pad_digest, Certificate, CERT_RECORD_SIZE, KEY_TYPE_RSA_2048, SIGNATURE_LENGTH};
use crate::sector0::PartitionTable;
use crate::ticket::PLAIN_TICKET_SIZE;
use crate::tmd::{AppHeader, SIGNATURE_TYPE_RSA_2048_SHA1, TMD_SIZE};
use crate::util::put_c_str;

pub const TEST_ISSUER: &str = "Root-CA00000001";
pub const TEST_KEY_NAME: &str = "CP00000007";
pub const TEST_TITLE_ID: u64 = 0x0003_0004_4B4E_4141;

const TEST_N: &[&str] = &[
    "9f6f6fa03710453800f804c8558190f0973c765e526076829f8f214b82590b08",
    "313f64571f6194cc7a1ee7f7bbd9efcc7ac81223b158eba5aeeb1d5e1f27439d",
    "031a49fcb2469f14059d1d344b30cac09684c180169573b082a496e9ee1ff44c",
    "ee0ea9c77567993c8b633122ad220bab490ba47d7fab664ec2688fd882cf4633",
    "1d91d3930773776c719efdfcde8baa1131a9d10b26c476b7b1e802e88fe58d92",
    "69d7cdfe962d327ce086f05fe01c8ededa1139b84a5d8873fe891e5135b55cbd",
    "1f739311e71b7f8735905582af42631448942b3def5864fe0b10ca54709c98fd",
    "b56c7cfaacc763d4cccf5f325651e2004193093a0e10d2dee1011f1dde1d13f9",
];

const TEST_D: &[&str] = &[
    "15e9a0f3ea32d2f0a18c1fa17bc45fabfc27e934ded437358e172e97a185fa1d",
    "8421ec4e8a6cefa088359b382744b57a95c8230618d28480b4611d70d98df1f3",
    "05d6cfcdbff588d8f2f491c0fadc97e139a416b188be685f72ca8af0ad33b870",
    "a254b842465698c458d151e82c2cd3b714f104088e4ad10d88c15f93d3015dea",
    "624e3667eae5a09fd4464cb5e9a2794f944fc32fde3fc771a9f4512e5664ee8a",
    "203e560c339caea8a0a40b7dd2e7693c3f756b9e0f95c1e7be762aab9a7d35ee",
    "ea36ee4654c4268137739ac84b4dbfb6e5f00939cbe239e7f0290e862aff98d4",
    "537eb3142232fedc182a7c54d9047d38a548e8ff831bd5ff140e1331b23f0529",
];

fn big(parts: &[&str]) -> BigUint {
    BigUint::parse_bytes(parts.concat().as_bytes(), 16).unwrap()
}

pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::from_hex("08A1522617110136", "A2D4E5F6071829304A5B6C7D8E9F0011").unwrap()
}

/// Raw private-key operation, `em ^ d mod n`, left-padded to the modulus size.
pub fn sign_raw(em: &[u8; SIGNATURE_LENGTH]) -> [u8; SIGNATURE_LENGTH] {
    let s = BigUint::from_bytes_be(em).modpow(&big(TEST_D), &big(TEST_N)).to_bytes_be();
    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[SIGNATURE_LENGTH - s.len()..].copy_from_slice(&s);
    signature
}

/// A certificate store record for the test key.
pub fn cert_record(issuer: &str, name: &str) -> Vec<u8> {
    let mut record = vec![0u8; CERT_RECORD_SIZE];
    record[..4].copy_from_slice(&SIGNATURE_TYPE_RSA_2048_SHA1.to_be_bytes());
    put_c_str(&mut record[0x140..0x180], issuer);
    record[0x180..0x184].copy_from_slice(&KEY_TYPE_RSA_2048.to_be_bytes());
    put_c_str(&mut record[0x184..0x1C4], name);
    record[0x1C4..0x1C8].copy_from_slice(&0x1234_5678u32.to_be_bytes());
    let n = big(TEST_N).to_bytes_be();
    record[0x1C8 + SIGNATURE_LENGTH - n.len()..0x2C8].copy_from_slice(&n);
    record[0x2C8..0x2CC].copy_from_slice(&65537u32.to_be_bytes());
    record
}

pub fn test_certificate() -> Certificate {
    Certificate::parse(&cert_record(TEST_ISSUER, TEST_KEY_NAME)).unwrap()
}

/// An application image of `len` bytes with the given header fields.
pub fn app_payload(title_id: u64, region_mask: u32, len: usize) -> Vec<u8> {
    assert!(len >= AppHeader::SIZE);
    let mut app: Vec<u8> = (0..len).map(|i| (i * 13 + 5) as u8).collect();
    app[AppHeader::REGION_OFFSET..AppHeader::REGION_OFFSET + 4].copy_from_slice(&region_mask.to_le_bytes());
    app[AppHeader::TITLE_ID_OFFSET..AppHeader::SIZE].copy_from_slice(&title_id.to_le_bytes());
    app
}

/// A single-content TMD for `app`, signed with the test key.
pub fn signed_tmd(title_id: u64, content_id: u32, app: &[u8]) -> Vec<u8> {
    let mut tmd = vec![0u8; TMD_SIZE];
    tmd[..4].copy_from_slice(&SIGNATURE_TYPE_RSA_2048_SHA1.to_be_bytes());
    put_c_str(&mut tmd[0x140..0x180], &format!("{}-{}", TEST_ISSUER, TEST_KEY_NAME));
    tmd[0x18C..0x194].copy_from_slice(&title_id.to_be_bytes());
    tmd[0x1DC..0x1DE].copy_from_slice(&0x0100u16.to_be_bytes());
    tmd[0x1DE..0x1E0].copy_from_slice(&1u16.to_be_bytes());
    tmd[0x1E4..0x1E8].copy_from_slice(&content_id.to_be_bytes());
    tmd[0x1EA..0x1EC].copy_from_slice(&1u16.to_be_bytes());
    tmd[0x1EC..0x1F4].copy_from_slice(&(app.len() as u64).to_be_bytes());
    tmd[0x1F4..0x208].copy_from_slice(&sha1(app));
    let signature = sign_raw(&pad_digest(&sha1(&tmd[0x140..])));
    tmd[4..4 + SIGNATURE_LENGTH].copy_from_slice(&signature);
    tmd
}

/// A plain v0 ticket for `title_id`.
pub fn plain_ticket(title_id: u64) -> Vec<u8> {
    let mut ticket: Vec<u8> = (0..PLAIN_TICKET_SIZE).map(|i| (i * 7 + 3) as u8).collect();
    ticket[0x1DC..0x1E4].copy_from_slice(&title_id.to_be_bytes());
    ticket
}

/// An encrypted image holding the reference partition table and `tail_sectors` sectors of
/// the main partition, all zero in plaintext.
pub fn encrypted_image(identity: &DeviceIdentity, variant: Variant, tail_sectors: u64) -> Cursor<Vec<u8>> {
    let table = PartitionTable::reference(variant);
    let sectors = table.main().offset as u64 + tail_sectors;
    let mut data = vec![0u8; sectors as usize * SECTOR_SIZE];

    let mut sector0 = [0u8; SECTOR_SIZE];
    table.write(&mut sector0);
    data[..SECTOR_SIZE].copy_from_slice(&sector0);

    NandCipher::new(&keys::derive(identity, variant)).crypt_sectors(&mut data, 0).unwrap();
    if variant == Variant::ThreeDs {
        data[0x100..0x104].copy_from_slice(b"NCSD");
    }
    Cursor::new(data)
}
