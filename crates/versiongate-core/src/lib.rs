//! Compliance engine for versiongate
//!
//! This crate implements:
//! - Device reconciliation (MDM fleet vs. ledger)
//! - The compliance ledger service and user directory sync
//! - Exclusion workflow
//! - Reminder scheduling with a cancellable registry
//! - Escalation policies
//! - Deadline enforcement
//! - The lifecycle control loop and its status board

mod deadline;
mod escalation;
mod exclusion;
mod ledger;
mod lifecycle;
mod maintenance;
mod reconcile;
mod reminder;
mod status;

pub use deadline::*;
pub use escalation::*;
pub use exclusion::*;
pub use ledger::*;
pub use lifecycle::*;
pub use maintenance::*;
pub use reconcile::*;
pub use reminder::*;
pub use status::*;

use std::sync::Arc;
use versiongate_provider::{Directory, IdpProvider, MdmProvider, Messenger};
use versiongate_store::Store;

/// Everything the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub mdm: Arc<dyn MdmProvider>,
    pub idp: Arc<dyn IdpProvider>,
    pub directory: Arc<dyn Directory>,
    pub messenger: Arc<dyn Messenger>,
}
