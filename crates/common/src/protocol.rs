//! Protocol-version gating.
//!
//! Ledger behavior changes across network protocol upgrades. Features are
//! gated on the protocol version recorded in bucket metadata, and the
//! helpers here express those gates the same way the rest of the codebase
//! reads them: "starts from version N" or "is before version N".

/// Known protocol versions, for type-safe version comparisons.
///
/// `#[repr(u32)]` keeps the discriminants equal to the on-chain version
/// numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
    V6 = 6,
    V7 = 7,
    V8 = 8,
    V9 = 9,
    V10 = 10,
    V11 = 11,
    V12 = 12,
    V13 = 13,
    V14 = 14,
    V15 = 15,
    V16 = 16,
    V17 = 17,
    V18 = 18,
    V19 = 19,
    V20 = 20,
    V21 = 21,
    V22 = 22,
    V23 = 23,
    V24 = 24,
    V25 = 25,
}

impl ProtocolVersion {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Returns `true` if `version` is at or after `from`.
#[inline]
pub fn protocol_version_starts_from(version: u32, from: ProtocolVersion) -> bool {
    version >= from.as_u32()
}

/// Returns `true` if `version` is strictly before `before`.
#[inline]
pub fn protocol_version_is_before(version: u32, before: ProtocolVersion) -> bool {
    version < before.as_u32()
}
