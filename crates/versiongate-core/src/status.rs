//! Health/status read model for the periodic tasks

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use versiongate_api::{API_VERSION, LifecycleState, RoutineStatus, StatusSnapshot, TaskKind};
use versiongate_util::RunId;

const CODE_OK: u16 = 200;
const CODE_DEGRADED: u16 = 400;

struct BoardState {
    state: LifecycleState,
    run_id: Option<RunId>,
    message: String,
    routines: BTreeMap<TaskKind, RoutineStatus>,
}

/// Shared status board written by the control loop and its tasks
pub struct StatusBoard {
    service_name: String,
    inner: Mutex<BoardState>,
}

impl StatusBoard {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            inner: Mutex::new(BoardState {
                state: LifecycleState::Idle,
                run_id: None,
                message: "idle".to_string(),
                routines: TaskKind::ALL
                    .iter()
                    .map(|k| (*k, RoutineStatus::default()))
                    .collect(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: LifecycleState, run_id: Option<RunId>, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.state = state;
        inner.run_id = run_id;
        inner.message = message.into();
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn routine_started(&self, kind: TaskKind, at: DateTime<Utc>) {
        let mut inner = self.lock();
        let routine = inner.routines.entry(kind).or_default();
        routine.last_start = Some(at);
        routine.message = format!("started {kind}");
    }

    pub fn routine_finished(&self, kind: TaskKind, at: DateTime<Utc>, ok: bool, message: impl Into<String>) {
        let mut inner = self.lock();
        let routine = inner.routines.entry(kind).or_default();
        routine.last_finish = Some(at);
        routine.finished_without_error = ok;
        routine.message = message.into();
    }

    /// Snapshot for the control socket
    pub fn snapshot(&self, store_ok: bool, outstanding_reminders: usize) -> StatusSnapshot {
        let inner = self.lock();
        let failing = inner
            .routines
            .values()
            .any(|r| r.last_finish.is_some() && !r.finished_without_error);

        StatusSnapshot {
            api_version: API_VERSION,
            service_name: self.service_name.clone(),
            state: inner.state,
            run_id: inner.run_id.clone(),
            message: inner.message.clone(),
            code: if failing || !store_ok { CODE_DEGRADED } else { CODE_OK },
            store_ok,
            routines: inner.routines.clone(),
            outstanding_reminders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_healthy() {
        let board = StatusBoard::new("versiongate");
        let snapshot = board.snapshot(true, 0);
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(snapshot.code, 200);
        assert_eq!(snapshot.routines.len(), 4);
    }

    #[test]
    fn failed_routine_degrades() {
        let board = StatusBoard::new("versiongate");
        let now = versiongate_util::now();
        board.routine_started(TaskKind::Reconcile, now);
        board.routine_finished(TaskKind::Reconcile, now, false, "mdm unavailable");

        let snapshot = board.snapshot(true, 2);
        assert_eq!(snapshot.code, 400);
        assert_eq!(snapshot.outstanding_reminders, 2);
        let routine = snapshot.routine(TaskKind::Reconcile).unwrap();
        assert_eq!(routine.message, "mdm unavailable");

        board.routine_finished(TaskKind::Reconcile, now, true, "finished reconcile");
        assert_eq!(board.snapshot(true, 0).code, 200);
        assert_eq!(board.snapshot(false, 0).code, 400);
    }
}
