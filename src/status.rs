//! Signed status codes returned by every top-level operation.
//!
//! Zero is success, each failure category has its own negative code, so an interactive caller
//! can decide whether to retry, abort, or fall back to a backup flow.

use core::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::scripting::ScriptError;

macro_rules! generate {
    ($Status:ident: $($status:ident = $code:literal,)*) => {

        #[repr(i32)]
        #[derive(Copy, Clone, Debug, Deserialize, enum_iterator::Sequence, Eq, PartialEq, Serialize)]
        pub enum $Status { $(
            $status = $code,
        )* }

        impl TryFrom<i32> for $Status {
            type Error = i32;
            fn try_from(code: i32) -> core::result::Result<Self, i32> {
                // `Ok` is a variant, so no glob import here
                core::result::Result::Ok(match code { $(
                    $code => $Status::$status,
                )*
                    _ => return Err(code),
                })
            }
        }
    }
}

generate! { Status:
    Ok = 0,
    IdentityUnavailable = -1,
    ImageMismatch = -2,
    InsufficientSpace = -3,
    VerificationFailed = -4,
    IoFailure = -5,
    Malformed = -6,
    ScriptCommandFailed = -7,
    CopyFailed = -8,
    VanishedAfterCopy = -9,
    DigestMismatchAfterCopy = -10,
    PoolExhausted = -11,
    AlreadyExists = -12,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn all() -> impl Iterator<Item = Status> {
        enum_iterator::all::<Status>()
    }
}

impl From<&Error> for Status {
    fn from(error: &Error) -> Status {
        use Error::*;
        match error {
            Identity(_) | Config(_) => Status::IdentityUnavailable,
            IdentityMismatch | BadMagic | WrongSize(_) | Sector0Mismatch(_) | NotOnThreeDs(_) => Status::ImageMismatch,
            Malformed { .. } | Unaligned { .. } => Status::Malformed,
            BadSignature
            | CertificateMismatch { .. }
            | DigestMismatch(_)
            | RegionMismatch { .. }
            | EsBlock(_)
            | NoTicketTemplate(_) => Status::VerificationFailed,
            SectorIo { .. } | File { .. } | Io(_) => Status::IoFailure,
            InsufficientSpace { .. } => Status::InsufficientSpace,
            PoolExhausted(_) => Status::PoolExhausted,
            AlreadyExists(_) => Status::AlreadyExists,
        }
    }
}

impl From<&ScriptError> for Status {
    fn from(error: &ScriptError) -> Status {
        use ScriptError::*;
        match error {
            CommandFailed { .. } => Status::ScriptCommandFailed,
            CopyFailed { .. } => Status::CopyFailed,
            VanishedAfterCopy(_) => Status::VanishedAfterCopy,
            VerifyFailed(_) => Status::DigestMismatchAfterCopy,
            Open { .. } => Status::IoFailure,
            Scratch(error) => Status::from(error),
        }
    }
}
