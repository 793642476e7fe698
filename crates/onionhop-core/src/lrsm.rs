//! Build confirmation
//!
//! When a path finishes building, the terminus starts a status message
//! travelling back toward the originator. The message carries a bundle of
//! exactly [`PATH_MAX_HOPS`] encrypted frames. Every transit hop seals a
//! [`StatusRecord`] with its upstream key and shifts it into slot 0, so
//! when the bundle reaches the originator slot `i` holds the record of hop
//! `i` and every slot past the last hop is the empty marker.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use onionhop_crypto::{EncryptedFrame, SymmetricKey};
use serde::{Deserialize, Serialize};

use crate::error::{BuildRejection, CoreError, CoreResult};

/// Maximum hops in a path, and the size of every confirmation bundle
pub const PATH_MAX_HOPS: usize = 8;

/// Current status record version
pub const STATUS_RECORD_VERSION: u8 = 0;

/// Build status bit set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LrStatus(u64);

impl LrStatus {
    pub const SUCCESS: LrStatus = LrStatus(1 << 0);
    pub const FAIL_TIMEOUT: LrStatus = LrStatus(1 << 1);
    pub const FAIL_CONGESTION: LrStatus = LrStatus(1 << 2);
    pub const FAIL_DEST_UNKNOWN: LrStatus = LrStatus(1 << 3);
    pub const FAIL_DECRYPT_ERROR: LrStatus = LrStatus(1 << 4);
    pub const FAIL_MALFORMED_RECORD: LrStatus = LrStatus(1 << 5);
    pub const FAIL_DEST_INVALID: LrStatus = LrStatus(1 << 6);
    pub const FAIL_CANNOT_CONNECT: LrStatus = LrStatus(1 << 7);
    pub const FAIL_DUPLICATE_HOP: LrStatus = LrStatus(1 << 8);

    const NAMES: [(LrStatus, &'static str); 9] = [
        (Self::SUCCESS, "SUCCESS"),
        (Self::FAIL_TIMEOUT, "FAIL_TIMEOUT"),
        (Self::FAIL_CONGESTION, "FAIL_CONGESTION"),
        (Self::FAIL_DEST_UNKNOWN, "FAIL_DEST_UNKNOWN"),
        (Self::FAIL_DECRYPT_ERROR, "FAIL_DECRYPT_ERROR"),
        (Self::FAIL_MALFORMED_RECORD, "FAIL_MALFORMED_RECORD"),
        (Self::FAIL_DEST_INVALID, "FAIL_DEST_INVALID"),
        (Self::FAIL_CANNOT_CONNECT, "FAIL_CANNOT_CONNECT"),
        (Self::FAIL_DUPLICATE_HOP, "FAIL_DUPLICATE_HOP"),
    ];

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: LrStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// SUCCESS set and no failure bit set
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl BitOr for LrStatus {
    type Output = LrStatus;

    fn bitor(self, rhs: LrStatus) -> LrStatus {
        LrStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for LrStatus {
    fn bitor_assign(&mut self, rhs: LrStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for LrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "LrStatus({:#x})", self.0)
        } else {
            write!(f, "LrStatus({})", names.join(" | "))
        }
    }
}

/// One hop's record inside a confirmation bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: LrStatus,
    pub version: u8,
}

impl StatusRecord {
    pub fn new(status: LrStatus) -> Self {
        Self {
            status,
            version: STATUS_RECORD_VERSION,
        }
    }

    /// Encode and seal into a frame under `key`
    pub fn seal(&self, key: &SymmetricKey) -> CoreResult<EncryptedFrame> {
        let body = bincode::serialize(self)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        Ok(EncryptedFrame::seal(key, &body)?)
    }
}

/// The fixed-size confirmation bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<EncryptedFrame>", into = "Vec<EncryptedFrame>")]
pub struct ConfirmationFrames([EncryptedFrame; PATH_MAX_HOPS]);

impl ConfirmationFrames {
    /// A bundle of empty markers
    pub fn empty() -> Self {
        Self(std::array::from_fn(|_| EncryptedFrame::empty()))
    }

    /// Shift every frame one slot back, dropping the last, and put `frame` in slot 0
    pub fn push_front(&mut self, frame: EncryptedFrame) {
        self.0.rotate_right(1);
        self.0[0] = frame;
    }

    pub fn get(&self, index: usize) -> Option<&EncryptedFrame> {
        self.0.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut EncryptedFrame> {
        self.0.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncryptedFrame> {
        self.0.iter()
    }
}

impl Default for ConfirmationFrames {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<Vec<EncryptedFrame>> for ConfirmationFrames {
    type Error = BuildRejection;

    fn try_from(frames: Vec<EncryptedFrame>) -> Result<Self, Self::Error> {
        let actual = frames.len();
        let frames: [EncryptedFrame; PATH_MAX_HOPS] =
            frames.try_into().map_err(|_| BuildRejection::BundleLength {
                expected: PATH_MAX_HOPS,
                actual,
            })?;
        Ok(Self(frames))
    }
}

impl From<ConfirmationFrames> for Vec<EncryptedFrame> {
    fn from(frames: ConfirmationFrames) -> Self {
        frames.0.into()
    }
}

/// Check a bundle against the upstream keys of a path's hops, in hop order
pub fn verify_bundle(
    status: LrStatus,
    frames: &ConfirmationFrames,
    keys: &[&SymmetricKey],
) -> Result<(), BuildRejection> {
    if !status.is_success() {
        return Err(BuildRejection::Status(status));
    }

    for (index, frame) in frames.iter().enumerate() {
        let Some(key) = keys.get(index) else {
            if !frame.is_empty() {
                return Err(BuildRejection::UnexpectedRecord(index));
            }
            continue;
        };

        if frame.is_empty() {
            return Err(BuildRejection::MissingRecord(index));
        }
        let body = frame
            .open(key)
            .map_err(|_| BuildRejection::Authentication(index))?;
        let record: StatusRecord = bincode::deserialize(&body)
            .map_err(|_| BuildRejection::MalformedRecord(index))?;
        if !record.status.is_success() {
            return Err(BuildRejection::HopRejected {
                index,
                status: record.status,
            });
        }
    }

    Ok(())
}
