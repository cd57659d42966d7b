//! Shared types for Keystead

pub mod error;

pub use error::{Result, WalletError};
