//! Cryptographic primitives for sealed wallet storage.
//!
//! The codec has no state beyond its cost parameters. Everything that gets
//! persisted passes through [`CryptoCodec::seal`] and comes back through
//! [`CryptoCodec::open`], so a blob is always authenticated before it is
//! trusted.

pub mod codec;
pub mod session;

pub use codec::{
    generate_random_bytes, split_tag, CodecParams, CryptoCodec, INTEGRITY_TAG_LEN, NONCE_LEN,
    SALT_LEN,
};
pub use session::SessionKey;
