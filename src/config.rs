//! Configuration file, TOML or YAML.
//!
//! ```toml
//! [identity]
//! dir = "/sd/twlnand"
//!
//! [image]
//! path = "/sd/nand.bin"
//!
//! [install]
//! root = "/mnt/nand"
//! region = "usa"
//! reserve = 2097152
//!
//! [scratch]
//! slots = 8
//!
//! [boot2]
//! key = "00112233445566778899AABBCCDDEEFF"
//! ```
//!
//! Every section and every field is optional.

use core::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::install::InstallConfig;
use crate::scratch::ScratchConfig;
use crate::util::{hex_deserialize_opt, hex_serialize, is_default};

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `console_id.txt` and `cid.txt`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(deserialize_with = "hex_deserialize_opt", serialize_with = "serialize_opt_hex")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_id: Option<[u8; 8]>,
    #[serde(deserialize_with = "hex_deserialize_opt", serialize_with = "serialize_opt_hex")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<[u8; 16]>,
}

fn serialize_opt_hex<S: serde::Serializer, const N: usize>(x: &Option<[u8; N]>, s: S) -> core::result::Result<S::Ok, S::Error> {
    match x {
        Some(x) => hex_serialize(x, s),
        None => s.serialize_none(),
    }
}

impl IdentityConfig {
    /// Both identifiers, when the configuration spells them out.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        Some(DeviceIdentity::new(self.console_id?, self.cid?))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct Boot2Config {
    /// Key the stage2 blobs are encrypted with. Console-common, never derived here.
    #[serde(deserialize_with = "hex_deserialize_opt", serialize_with = "serialize_opt_hex")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<[u8; 16]>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "is_default")]
    pub identity: IdentityConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub image: ImageConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub install: InstallConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub scratch: ScratchConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub boot2: Boot2Config,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

impl TryFrom<&'_ Path> for Config {
    type Error = Error;

    fn try_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Error::file(path))?;
        let config = match path.extension().and_then(|extension| extension.to_str()) {
            Some("toml") => Self::from_toml(&text)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            Some(extension) => return Err(Error::Config(format!("unknown config extension {:?}", extension))),
            None => return Err(Error::Config(format!("no extension in path {}", path.display()))),
        };
        trace!("{:#?}", &config);
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_identity;
    use crate::tmd::DeviceRegion;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
        let install = Config::default().install;
        assert_eq!(install.cert_offset, 0x700);
        assert_eq!(install.cert_issuer, "Root-CA00000001");
        assert_eq!(install.ticket_dir, Path::new("ticket/00030004"));
        assert_eq!(install.reserve, 1 << 20);
        assert_eq!(Config::default().scratch, ScratchConfig { slot_size: 128 << 10, slots: 4, warn_at: 3, fallback: true });
    }

    #[test]
    fn toml_sections() {
        let config = Config::from_toml(
            r#"
[identity]
console-id = "08A1522617110136"
cid = "A2D4E5F6071829304A5B6C7D8E9F0011"

[install]
root = "/mnt/nand"
region = "europe"
reserve = 4096

[scratch]
slots = 8

[boot2]
key = "00112233445566778899AABBCCDDEEFF"
"#,
        )
        .unwrap();
        assert_eq!(config.identity.identity(), Some(test_identity()));
        assert_eq!(config.install.root.as_deref(), Some(Path::new("/mnt/nand")));
        assert_eq!(config.install.region, Some(DeviceRegion::Europe));
        assert_eq!(config.install.reserve, 4096);
        assert_eq!(config.install.cert_name, "CP00000007");
        assert_eq!(config.scratch.slots, 8);
        assert_eq!(config.scratch.slot_size, 128 << 10);
        assert_eq!(config.boot2.key.map(|key| key[15]), Some(0xFF));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(Config::from_toml("[install]\nrot = 1\n"), Err(Error::Config(_))));
        assert!(matches!(Config::from_yaml("colour: blue\n"), Err(Error::Config(_))));
    }

    #[test]
    fn format_follows_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("twlnand.yml");
        fs::write(&yaml, "image:\n  path: nand.bin\nidentity:\n  dir: ids\n").unwrap();
        let config = Config::try_from(yaml.as_path()).unwrap();
        assert_eq!(config.image.path.as_deref(), Some(Path::new("nand.bin")));
        assert_eq!(config.identity.dir.as_deref(), Some(Path::new("ids")));
        assert_eq!(config.identity.identity(), None);

        let ini = dir.path().join("twlnand.ini");
        fs::write(&ini, "").unwrap();
        assert!(matches!(Config::try_from(ini.as_path()), Err(Error::Config(_))));
    }

    #[test]
    fn serializes_only_what_differs() {
        let mut config = Config::default();
        config.image.path = Some("nand.bin".into());
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("[image]"));
        assert!(!text.contains("install"));
        assert!(!text.contains("scratch"));
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }
}
