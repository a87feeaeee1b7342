//! Shared types for the versiongate API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use versiongate_util::RunId;

/// The four periodic tasks owned by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Reconcile,
    Check,
    Poll,
    Deadline,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Reconcile,
        TaskKind::Check,
        TaskKind::Poll,
        TaskKind::Deadline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Reconcile => "reconcile",
            TaskKind::Check => "check",
            TaskKind::Poll => "poll",
            TaskKind::Deadline => "deadline",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed run of one periodic task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutineStatus {
    pub last_start: Option<DateTime<Utc>>,
    pub last_finish: Option<DateTime<Utc>>,
    /// True when the last finished run reported no error
    pub finished_without_error: bool,
    pub message: String,
}

/// Lifecycle state of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Waiting for a start signal
    Idle,
    Running,
    /// The deadline passed and enforcement ran
    Halted,
    ShuttingDown,
}

/// Health/status read model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub api_version: u32,
    pub service_name: String,
    pub state: LifecycleState,
    pub run_id: Option<RunId>,
    pub message: String,
    /// HTTP-style status code: 200 healthy, 400 degraded
    pub code: u16,
    pub store_ok: bool,
    pub routines: BTreeMap<TaskKind, RoutineStatus>,
    pub outstanding_reminders: usize,
}

impl StatusSnapshot {
    pub fn routine(&self, kind: TaskKind) -> Option<&RoutineStatus> {
        self.routines.get(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_serialization() {
        let json = serde_json::to_string(&TaskKind::Reconcile).unwrap();
        assert_eq!(json, "\"reconcile\"");
    }

    #[test]
    fn status_snapshot_serialization() {
        let mut routines = BTreeMap::new();
        routines.insert(
            TaskKind::Poll,
            RoutineStatus {
                message: "finished poll".into(),
                finished_without_error: true,
                ..Default::default()
            },
        );

        let snapshot = StatusSnapshot {
            api_version: crate::API_VERSION,
            service_name: "versiongate".into(),
            state: LifecycleState::Running,
            run_id: Some(RunId::new()),
            message: "running".into(),
            code: 200,
            store_ok: true,
            routines,
            outstanding_reminders: 2,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StatusSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert!(parsed.routine(TaskKind::Poll).unwrap().finished_without_error);
    }
}
