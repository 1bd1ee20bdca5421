//! Console-unique NAND encryption, image validation and title installation
//! for DSi-family flash images.
//!
//! The pieces build on each other in this order:
//!
//! - [`keys`] turns a [`DeviceIdentity`] into the sector key and base counter,
//! - [`crypto::NandCipher`] runs the counter-mode sector cipher,
//! - [`sector0`] and [`footer`] validate what the cipher produces,
//! - [`nand::Nand`] ties these together into a decrypted block device,
//! - [`pki`], [`tmd`], [`ticket`] and [`install`] implement title installation,
//! - [`scripting`] runs `.nfs` manifests against a mounted filesystem,
//! - [`stage2`] extracts the boot loader blobs ahead of the partitions.

#[macro_use]
extern crate log;

pub mod blockdev;
pub mod config;
pub mod crypto;
pub mod error;
pub mod footer;
pub mod identity;
pub mod image;
pub mod install;
pub mod keys;
pub mod nand;
pub mod pki;
pub mod scratch;
pub mod scripting;
pub mod sector0;
pub mod stage2;
pub mod status;
pub mod ticket;
pub mod tmd;
pub mod util;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, ErrorKind, Result};
pub use identity::DeviceIdentity;
pub use keys::Variant;
pub use status::Status;
