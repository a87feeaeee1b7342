//! Lifecycle control loop
//!
//! The controller owns the four periodic tasks. Each start creates an
//! epoch with its own cancellation token (a child of the shutdown token);
//! every task checks that token between ticks, so stopping an epoch lets
//! the current tick finish and then retires all of them. Reminders hang off the shutdown token instead, so a reload
//! keeps them while stop, halt and shutdown cancel them.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use versiongate_api::{LifecycleState, StatusSnapshot, TaskKind};
use versiongate_config::Settings;
use versiongate_store::{AuditEvent, AuditEventType};
use versiongate_util::{ComplianceError, Result, RunId};

use crate::{
    Collaborators, DeadlineEnforcer, Escalation, Reconciler, ReminderRegistry, ReminderScheduler,
    StatusBoard,
};

const SIGNAL_BUFFER: usize = 16;

/// Signals understood by the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Start,
    Stop,
    Reload,
    /// The deadline passed during the given epoch
    Halt(RunId),
}

/// Re-reads configuration on reload
pub type SettingsLoader = Arc<dyn Fn() -> std::result::Result<Settings, String> + Send + Sync>;

/// Cheap handle for signalling the controller and reading its status
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlSignal>,
    board: Arc<StatusBoard>,
    registry: ReminderRegistry,
    running: Arc<AtomicBool>,
    collab: Collaborators,
}

impl ControlHandle {
    pub async fn send(&self, signal: ControlSignal) -> Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| ComplianceError::internal("control loop is gone"))
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.board
            .snapshot(self.collab.store.is_healthy(), self.registry.outstanding())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Epoch {
    run_id: RunId,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the periodic tasks and reacts to control signals
pub struct Controller {
    settings: Settings,
    collab: Collaborators,
    registry: ReminderRegistry,
    board: Arc<StatusBoard>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tx: mpsc::Sender<ControlSignal>,
    rx: mpsc::Receiver<ControlSignal>,
    loader: Option<SettingsLoader>,
    epoch: Option<Epoch>,
}

impl Controller {
    pub fn new(
        settings: Settings,
        collab: Collaborators,
        shutdown: CancellationToken,
    ) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let board = Arc::new(StatusBoard::new(&settings.service.service_name));
        let registry = ReminderRegistry::new();
        let running = Arc::new(AtomicBool::new(false));

        let handle = ControlHandle {
            tx: tx.clone(),
            board: board.clone(),
            registry: registry.clone(),
            running: running.clone(),
            collab: collab.clone(),
        };

        let controller = Self {
            settings,
            collab,
            registry,
            board,
            running,
            shutdown,
            tx,
            rx,
            loader: None,
            epoch: None,
        };
        (controller, handle)
    }

    /// Use `loader` to re-read configuration on reload
    pub fn with_loader(mut self, loader: SettingsLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Dispatch signals until shutdown
    pub async fn run(mut self) {
        info!("Control loop ready");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = self.rx.recv() => {
                    let Some(signal) = signal else { break };
                    self.handle(signal).await;
                }
            }
        }

        self.board
            .set_state(LifecycleState::ShuttingDown, None, "shutting down");
        if self.epoch.is_some() {
            self.stop_epoch("shutdown").await;
        }
        let cancelled = self.registry.cancel_all();
        info!(cancelled_reminders = cancelled, "Control loop stopped");
    }

    async fn handle(&mut self, signal: ControlSignal) {
        debug!(signal = ?signal, "Control signal");
        match signal {
            ControlSignal::Start => {
                if self.epoch.is_some() {
                    debug!("Already running");
                    return;
                }
                self.start_epoch();
            }
            ControlSignal::Stop => {
                if self.epoch.is_none() {
                    debug!("Not running");
                    return;
                }
                self.stop_epoch("stopped").await;
                self.registry.cancel_all();
                self.board.set_state(LifecycleState::Idle, None, "stopped");
            }
            ControlSignal::Reload => self.reload().await,
            ControlSignal::Halt(run_id) => {
                if self.epoch.as_ref().is_none_or(|e| e.run_id != run_id) {
                    debug!(run_id = %run_id, "Ignoring halt from a retired epoch");
                    return;
                }
                self.stop_epoch("deadline passed").await;
                self.registry.cancel_all();
                self.board
                    .set_state(LifecycleState::Halted, None, "deadline passed");
            }
        }
    }

    async fn reload(&mut self) {
        let Some(loader) = &self.loader else {
            warn!("Reload requested but no configuration source is set");
            return;
        };

        match loader() {
            Ok(settings) => {
                self.settings = settings;
                self.audit(AuditEventType::ConfigReloaded { success: true });
                info!("Configuration reloaded");
                if self.epoch.is_some() {
                    self.stop_epoch("reload").await;
                    self.start_epoch();
                }
            }
            Err(e) => {
                self.audit(AuditEventType::ConfigReloaded { success: false });
                warn!(error = %e, "Configuration reload failed; keeping current settings");
            }
        }
    }

    fn start_epoch(&mut self) {
        let run_id = RunId::new();
        let token = self.shutdown.child_token();
        let schedule = &self.settings.schedule;

        let escalation = Arc::new(Escalation::new(&self.settings, self.collab.clone()));
        let reconciler = Arc::new(Reconciler::new(
            self.settings.clone(),
            self.collab.clone(),
            escalation.clone(),
            self.registry.clone(),
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            self.settings.clone(),
            self.collab.clone(),
            self.registry.clone(),
        ));
        let enforcer = Arc::new(DeadlineEnforcer::new(
            &self.settings.compliance,
            self.collab.store.clone(),
            escalation.clone(),
        ));

        let mut tasks = Vec::with_capacity(TaskKind::ALL.len());

        tasks.push(self.spawn_periodic(
            TaskKind::Reconcile,
            schedule.device_diff_interval,
            &token,
            move |now| {
                let reconciler = reconciler.clone();
                async move {
                    let report = reconciler.run(now).await?;
                    match report.batch.partial_failure() {
                        Some(e) => Err(e),
                        None => Ok(report.summary()),
                    }
                }
            },
        ));

        tasks.push(self.spawn_periodic(
            TaskKind::Check,
            schedule.check_interval,
            &token,
            move |now| {
                let escalation = escalation.clone();
                async move {
                    let report = escalation.check(now).await?;
                    Ok(format!(
                        "first {}, resent {}, escalated {}",
                        report.first, report.resent, report.escalated
                    ))
                }
            },
        ));

        let reminders_parent = self.shutdown.clone();
        tasks.push(self.spawn_periodic(
            TaskKind::Poll,
            schedule.poll_interval,
            &token,
            move |now| {
                let scheduler = scheduler.clone();
                let parent = reminders_parent.clone();
                async move {
                    let report = scheduler.poll(now, &parent).await?;
                    Ok(format!(
                        "dispatched {}, failed {}",
                        report.dispatched, report.failed
                    ))
                }
            },
        ));

        let tx = self.tx.clone();
        let halt_id = run_id.clone();
        tasks.push(self.spawn_periodic(
            TaskKind::Deadline,
            schedule.deadline_interval,
            &token,
            move |now| {
                let enforcer = enforcer.clone();
                let tx = tx.clone();
                let halt_id = halt_id.clone();
                async move {
                    let outcome = enforcer.evaluate(now).await?;
                    if outcome.should_halt() && tx.try_send(ControlSignal::Halt(halt_id)).is_err() {
                        warn!("Could not deliver halt signal");
                    }
                    Ok(format!("{outcome:?}"))
                }
            },
        ));

        self.running.store(true, Ordering::SeqCst);
        self.board
            .set_state(LifecycleState::Running, Some(run_id.clone()), "running");
        self.audit(AuditEventType::LifecycleStarted {
            run_id: run_id.clone(),
        });
        info!(run_id = %run_id, "Periodic tasks started");

        self.epoch = Some(Epoch {
            run_id,
            token,
            tasks,
        });
    }

    async fn stop_epoch(&mut self, reason: &str) {
        let Some(epoch) = self.epoch.take() else {
            return;
        };
        epoch.token.cancel();
        for task in epoch.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Periodic task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.audit(AuditEventType::LifecycleStopped {
            run_id: epoch.run_id.clone(),
            reason: reason.to_string(),
        });
        info!(run_id = %epoch.run_id, reason = %reason, "Periodic tasks stopped");
    }

    fn spawn_periodic<F, Fut>(
        &self,
        kind: TaskKind,
        period: Duration,
        token: &CancellationToken,
        mut work: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let token = token.clone();
        let board = self.board.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let started = versiongate_util::now();
                board.routine_started(kind, started);

                // A tick runs to completion; cancellation is seen between ticks
                let outcome = work(started).await;

                match outcome {
                    Ok(message) => {
                        debug!(task = %kind, message = %message, "Routine finished");
                        board.routine_finished(kind, versiongate_util::now(), true, message);
                    }
                    Err(e) => {
                        warn!(task = %kind, error = %e, "Routine failed");
                        board.routine_finished(kind, versiongate_util::now(), false, e.to_string());
                    }
                }
            }
            debug!(task = %kind, "Periodic task exiting");
        })
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.collab.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versiongate_config::parse_config;
    use versiongate_provider::{DirectoryUser, MdmDevice, MdmUser, MockMdm, MockMessenger};
    use versiongate_store::{ComplianceRecord, SqliteStore, Store};

    fn settings(deadline_date: &str) -> Settings {
        parse_config(&format!(
            r#"
            config_version = 1

            [compliance]
            required_version = "13.0"
            deadline_date = "{deadline_date}"
            cutoff_time = "08:00"
            "#
        ))
        .unwrap()
    }

    fn collaborators() -> (Arc<MockMdm>, Collaborators) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let mdm = Arc::new(MockMdm::new());
        mdm.add_directory_user(DirectoryUser {
            slack_id: "U1".into(),
            email: "a@example.com".into(),
            real_name: "Ada".into(),
            tz_offset: 0,
            manager_slack_id: None,
        });
        mdm.set_devices(vec![MdmDevice {
            device_id: "d1".into(),
            serial_number: "S1".into(),
            platform: "Mac".into(),
            os_version: "12.0".into(),
            user: MdmUser {
                email: "a@example.com".into(),
                id: "m1".into(),
                name: "Ada".into(),
            },
            ..Default::default()
        }]);
        let collab = Collaborators {
            store,
            mdm: mdm.clone(),
            idp: mdm.clone(),
            directory: mdm.clone(),
            messenger: Arc::new(MockMessenger::new()),
        };
        (mdm, collab)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_tasks_and_stop_retires_them() {
        let (_, collab) = collaborators();
        let shutdown = CancellationToken::new();
        let (controller, handle) = Controller::new(settings("01-02-2099"), collab.clone(), shutdown.clone());
        let loop_task = tokio::spawn(controller.run());

        handle.send(ControlSignal::Start).await.unwrap();
        settle().await;
        assert!(handle.is_running());

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Running);
        assert!(snapshot.run_id.is_some());
        assert!(snapshot.routine(TaskKind::Reconcile).unwrap().last_finish.is_some());
        assert!(collab.store.record_by_serial("S1").unwrap().is_some());

        // A second start is ignored
        handle.send(ControlSignal::Start).await.unwrap();
        handle.send(ControlSignal::Stop).await.unwrap();
        settle().await;
        assert!(!handle.is_running());
        assert_eq!(handle.snapshot().state, LifecycleState::Idle);

        shutdown.cancel();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn passed_deadline_halts() {
        let (_, collab) = collaborators();
        let shutdown = CancellationToken::new();
        let (controller, handle) = Controller::new(settings("01-02-2024"), collab.clone(), shutdown.clone());
        let loop_task = tokio::spawn(controller.run());

        handle.send(ControlSignal::Start).await.unwrap();
        settle().await;

        assert!(!handle.is_running());
        assert_eq!(handle.snapshot().state, LifecycleState::Halted);
        let audits = collab.store.get_recent_audits(20).unwrap();
        assert!(audits
            .iter()
            .any(|a| matches!(a.event, AuditEventType::DeadlineEnforced { .. })));

        shutdown.cancel();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reload_restarts_running_epoch() {
        let (_, collab) = collaborators();
        let shutdown = CancellationToken::new();
        let (controller, handle) = Controller::new(settings("01-02-2099"), collab, shutdown.clone());
        let controller = controller.with_loader(Arc::new(|| Ok(settings("06-30-2099"))));
        let loop_task = tokio::spawn(controller.run());

        handle.send(ControlSignal::Start).await.unwrap();
        settle().await;
        let before = handle.snapshot().run_id;

        handle.send(ControlSignal::Reload).await.unwrap();
        settle().await;
        let after = handle.snapshot().run_id;
        assert!(handle.is_running());
        assert_ne!(before, after);

        shutdown.cancel();
        loop_task.await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(handle.snapshot().state, LifecycleState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_in_flight_tick_finish() {
        let (_, mut collab) = collaborators();
        let messenger = Arc::new(MockMessenger::new());
        *messenger.send_delay.lock().unwrap() = Some(Duration::from_secs(5));
        collab.messenger = messenger.clone();
        collab
            .store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "Ada", 0))
            .unwrap();

        let shutdown = CancellationToken::new();
        let (controller, handle) = Controller::new(settings("01-02-2099"), collab.clone(), shutdown.clone());
        let loop_task = tokio::spawn(controller.run());

        handle.send(ControlSignal::Start).await.unwrap();
        settle().await;
        handle.send(ControlSignal::Stop).await.unwrap();
        for _ in 0..20 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!handle.is_running());

        let record = collab.store.record_by_serial("S1").unwrap().unwrap();
        assert!(record.first_message_sent);
        assert!(!record.first_message_waiting);
        assert_eq!(messenger.sent_of(versiongate_provider::MessageKind::First).len(), 1);

        shutdown.cancel();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reconcile_degrades_but_keeps_running() {
        let (mdm, collab) = collaborators();
        *mdm.fail_list.lock().unwrap() = true;
        let shutdown = CancellationToken::new();
        let (controller, handle) = Controller::new(settings("01-02-2099"), collab, shutdown.clone());
        let loop_task = tokio::spawn(controller.run());

        handle.send(ControlSignal::Start).await.unwrap();
        settle().await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.code, 400);
        assert!(!snapshot.routine(TaskKind::Reconcile).unwrap().finished_without_error);
        assert!(handle.is_running());

        shutdown.cancel();
        loop_task.await.unwrap();
    }
}
