//! Shared primitives for the strata ledger store.
//!
//! This crate holds the small pieces that every other crate in the
//! workspace depends on: the 32-byte content hash used to identify
//! buckets, protocol-version gating helpers, and the record-marked XDR
//! file stream that the bucket read path consumes.

pub mod hash;
pub mod protocol;
pub mod xdr_stream;

pub use hash::Hash256;
pub use xdr_stream::XdrInputStream;
