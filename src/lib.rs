//! Keystead - background control core for a browser identity wallet
//!
//! Keystead holds encrypted identity secrets behind a password-derived
//! session, answers RPC calls from untrusted page contexts, serializes user
//! consent prompts and produces/consumes portable encrypted backups.
//!
//! ## Components
//!
//! - **Crypto**: Argon2id + ChaCha20-Poly1305 with an HMAC integrity prefix
//! - **Store**: one persisted slot per component (memory or files)
//! - **Lock**: Uninitialized/Locked/Unlocked session state machine
//! - **Actions**: named method chains, the only boundary to callers
//! - **Approval**: per-origin permissions
//! - **Requests**: FIFO consent queue with a single consent surface
//! - **Backup**: manifest export/import across every component
//! - **Identity**: the vault of identities and the active pointer
//! - **Keeper**: builds and wires everything from a [`KeeperConfig`]

pub mod actions;
pub mod approval;
pub mod backup;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod history;
pub mod identity;
pub mod keeper;
pub mod lock;
pub mod onboarding;
pub mod requests;
pub mod store;
pub mod types;

pub use actions::{ActionRegistry, CallerMeta, RpcRequest, RpcResponse};
pub use channel::{RpcChannel, RpcClient, RpcServer};
pub use config::{Args, KeeperConfig};
pub use keeper::Keeper;
pub use types::{Result, WalletError};
