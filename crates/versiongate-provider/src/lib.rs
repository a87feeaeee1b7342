//! Collaborator interfaces for versiongate
//!
//! This crate defines the boundary between the compliance core and the
//! systems it talks to: the MDM, the identity provider, the chat directory
//! and the messaging channel. It also ships:
//! - `MockMdm`/`MockMessenger` for tests
//! - `InventoryProvider`, a JSON-file-backed MDM/IDP/directory
//! - `WebhookMessenger`, which posts to an incoming webhook or only logs

mod inventory;
mod mock;
mod traits;
mod types;
mod webhook;

pub use inventory::*;
pub use mock::*;
pub use traits::*;
pub use types::*;
pub use webhook::*;
