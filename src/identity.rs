//! Device identifiers and where they came from.
//!
//! The console id and the eMMC CID are normally queried from the co-processor that owns the
//! hardware. Plain hex files (`console_id.txt`, `cid.txt`) take precedence when present, so a
//! backup can be worked on without the console it came from. The caller is always told which
//! source supplied each identifier.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{hex_deserialize, hex_serialize, parse_hex_prefix};

pub const CONSOLE_ID_FILE: &str = "console_id.txt";
pub const CID_FILE: &str = "cid.txt";

#[derive(Clone, Copy, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DeviceIdentity {
    #[serde(serialize_with = "hex_serialize", deserialize_with = "hex_deserialize")]
    pub console_id: [u8; 8],
    #[serde(serialize_with = "hex_serialize", deserialize_with = "hex_deserialize")]
    pub cid: [u8; 16],
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("console_id", &hex::encode_upper(self.console_id))
            .field("cid", &hex::encode_upper(self.cid))
            .finish()
    }
}

impl DeviceIdentity {
    pub fn new(console_id: [u8; 8], cid: [u8; 16]) -> Self {
        Self { console_id, cid }
    }

    /// Parse both identifiers from hex text.
    pub fn from_hex(console_id: &str, cid: &str) -> Result<Self> {
        let console_id = parse_hex_prefix(console_id)
            .ok_or_else(|| Error::Identity(format!("console id needs 16 hex digits, got {:?}", console_id)))?;
        let cid = parse_hex_prefix(cid)
            .ok_or_else(|| Error::Identity(format!("CID needs 32 hex digits, got {:?}", cid)))?;
        Ok(Self { console_id, cid })
    }
}

/// Where an identifier was obtained.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityOrigin {
    File,
    Live,
    CommandLine,
    ImageFooter,
}

impl fmt::Display for IdentityOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentityOrigin::File => "file",
            IdentityOrigin::Live => "live query",
            IdentityOrigin::CommandLine => "command line",
            IdentityOrigin::ImageFooter => "image footer",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AcquiredIdentity {
    pub identity: DeviceIdentity,
    pub console_id_origin: IdentityOrigin,
    pub cid_origin: IdentityOrigin,
}

impl AcquiredIdentity {
    pub fn uniform(identity: DeviceIdentity, origin: IdentityOrigin) -> Self {
        Self { identity, console_id_origin: origin, cid_origin: origin }
    }
}

/// The privileged hardware query. Implemented outside this crate.
pub trait IdentityProvider {
    fn console_id(&mut self) -> Result<[u8; 8]>;
    fn cid(&mut self) -> Result<[u8; 16]>;
}

/// Read an identifier file. A missing or malformed file is `None`, the next source is tried.
fn read_identifier<const N: usize>(dir: &Path, name: &str) -> Result<Option<[u8; N]>> {
    let path = dir.join(name);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => String::new(),
        Err(e) => return Err(Error::file(path)(e)),
    };
    let identifier = parse_hex_prefix(&text);
    if identifier.is_none() {
        warn!("{} needs at least {} hex digits, ignoring it", path.display(), 2 * N);
    }
    Ok(identifier)
}

/// Acquire both identifiers, preferring the files in `dir` over the `live` query.
pub fn acquire(dir: &Path, live: Option<&mut dyn IdentityProvider>) -> Result<AcquiredIdentity> {
    let console_id = read_identifier::<8>(dir, CONSOLE_ID_FILE)?;
    let cid = read_identifier::<16>(dir, CID_FILE)?;

    let mut live = live;
    let (console_id, console_id_origin) = match (console_id, live.as_deref_mut()) {
        (Some(id), _) => (id, IdentityOrigin::File),
        (None, Some(provider)) => (provider.console_id()?, IdentityOrigin::Live),
        (None, None) => {
            return Err(Error::Identity(format!("no {} in {} and no live source", CONSOLE_ID_FILE, dir.display())))
        }
    };
    let (cid, cid_origin) = match (cid, live.as_deref_mut()) {
        (Some(cid), _) => (cid, IdentityOrigin::File),
        (None, Some(provider)) => (provider.cid()?, IdentityOrigin::Live),
        (None, None) => return Err(Error::Identity(format!("no {} in {} and no live source", CID_FILE, dir.display()))),
    };

    let acquired = AcquiredIdentity { identity: DeviceIdentity { console_id, cid }, console_id_origin, cid_origin };
    info!("console id (from {}): {}", console_id_origin, hex::encode_upper(console_id));
    info!("eMMC CID (from {}): {}", cid_origin, hex::encode_upper(cid));
    Ok(acquired)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_identity;

    struct Fixed(DeviceIdentity, usize);

    impl IdentityProvider for Fixed {
        fn console_id(&mut self) -> Result<[u8; 8]> {
            self.1 += 1;
            Ok(self.0.console_id)
        }
        fn cid(&mut self) -> Result<[u8; 16]> {
            self.1 += 1;
            Ok(self.0.cid)
        }
    }

    #[test]
    fn files_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONSOLE_ID_FILE), "08A1522617110136\n").unwrap();
        let mut live = Fixed(DeviceIdentity::new([0; 8], test_identity().cid), 0);

        let acquired = acquire(dir.path(), Some(&mut live)).unwrap();
        assert_eq!(acquired.identity, test_identity());
        assert_eq!(acquired.console_id_origin, IdentityOrigin::File);
        assert_eq!(acquired.cid_origin, IdentityOrigin::Live);
        assert_eq!(live.1, 1);
    }

    #[test]
    fn files_alone_suffice() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONSOLE_ID_FILE), "08a1522617110136").unwrap();
        std::fs::write(dir.path().join(CID_FILE), "A2D4E5F6071829304A5B6C7D8E9F0011\r\n").unwrap();
        let acquired = acquire(dir.path(), None).unwrap();
        assert_eq!(acquired, AcquiredIdentity::uniform(test_identity(), IdentityOrigin::File));
    }

    #[test]
    fn missing_sources_are_identity_errors() {
        let dir = tempfile::tempdir().unwrap();
        let error = acquire(dir.path(), None).unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Identity);
    }

    #[test]
    fn malformed_files_fall_back_to_live() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONSOLE_ID_FILE), "08A15226").unwrap();
        std::fs::write(dir.path().join(CID_FILE), "not a cid at all, not a cid at all").unwrap();
        let mut live = Fixed(test_identity(), 0);
        let acquired = acquire(dir.path(), Some(&mut live)).unwrap();
        assert_eq!(acquired, AcquiredIdentity::uniform(test_identity(), IdentityOrigin::Live));
        assert_eq!(live.1, 2);

        // with nothing to fall back on it is still an identity error
        assert!(matches!(acquire(dir.path(), None), Err(Error::Identity(_))));
    }

    #[test]
    fn serde_as_hex() {
        let json = serde_json::to_string(&test_identity()).unwrap();
        assert_eq!(json, r#"{"console_id":"08A1522617110136","cid":"A2D4E5F6071829304A5B6C7D8E9F0011"}"#);
        let back: DeviceIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, test_identity());
    }
}
