//! Deadline enforcement

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use versiongate_config::CompliancePolicy;
use versiongate_store::{AuditEvent, AuditEventType, Store};
use versiongate_util::{Result, parse_deadline};

use crate::Escalation;

/// Result of one deadline evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// The configured deadline does not parse; nothing happens
    Invalid,
    /// Deadline still ahead
    Pending(DateTime<Utc>),
    /// Deadline passed and enforcement ran; the control loop should halt
    Enforced(DateTime<Utc>),
}

impl DeadlineOutcome {
    pub fn should_halt(&self) -> bool {
        matches!(self, DeadlineOutcome::Enforced(_))
    }
}

pub struct DeadlineEnforcer {
    deadline_date: String,
    cutoff_time: String,
    store: Arc<dyn Store>,
    escalation: Arc<Escalation>,
}

impl DeadlineEnforcer {
    pub fn new(policy: &CompliancePolicy, store: Arc<dyn Store>, escalation: Arc<Escalation>) -> Self {
        Self {
            deadline_date: policy.deadline_date.clone(),
            cutoff_time: policy.cutoff_time.clone(),
            store,
            escalation,
        }
    }

    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<DeadlineOutcome> {
        let deadline = match parse_deadline(&self.deadline_date, &self.cutoff_time) {
            Ok(deadline) => deadline,
            Err(e) => {
                warn!(error = %e, "Cannot parse deadline");
                return Ok(DeadlineOutcome::Invalid);
            }
        };

        if now <= deadline {
            debug!(deadline = %deadline, "Deadline not reached");
            return Ok(DeadlineOutcome::Pending(deadline));
        }

        info!(deadline = %deadline, "Deadline passed, enforcing");
        self.escalation.deadline(now).await?;
        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::DeadlineEnforced { deadline }))
        {
            warn!(error = %e, "Failed to write audit event");
        }
        Ok(DeadlineOutcome::Enforced(deadline))
    }
}
