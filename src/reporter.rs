use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::error::{Result, ServiceError};
use crate::gensvc::StatusReporter;
use crate::status::{codes, ControlsAccepted, ServiceState, ServiceStatus, StatusTiming};

struct Worker {
    cancel: Sender<()>,
    handle: JoinHandle<Result<()>>,
}

struct Inner {
    status: ServiceStatus,
    /// Target of a control that has been accepted but not yet acted on.
    intent: Option<ServiceState>,
    worker: Option<Worker>,
    transitioning: bool,
}

pub struct StatusManager {
    reporter: Arc<dyn StatusReporter>,
    accepted: ControlsAccepted,
    timing: StatusTiming,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TransitionGuard<'a>(&'a Mutex<Inner>);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).transitioning = false;
    }
}

impl StatusManager {
    /// Starts out `Stopped` without reporting anything.
    pub fn new(
        reporter: Arc<dyn StatusReporter>,
        accepted: ControlsAccepted,
        timing: StatusTiming,
    ) -> Self {
        StatusManager {
            reporter,
            accepted,
            timing,
            inner: Arc::new(Mutex::new(Inner {
                status: ServiceStatus::stopped(),
                intent: None,
                worker: None,
                transitioning: false,
            })),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        lock(&self.inner).status.clone()
    }

    pub fn state(&self) -> ServiceState {
        lock(&self.inner).status.state
    }

    pub fn set(&self, state: ServiceState) -> Result<()> {
        self.set_exit(state, codes::NO_ERROR, codes::NO_ERROR)
    }

    /// Applies and reports `state`. Exit codes are only embedded when the
    /// state is `Stopped`. Setting the state already held does nothing.
    ///
    /// The report is made outside the lock. A rejected report leaves the
    /// previous status in place, and a failure of the previous checkpoint
    /// worker is returned as [`ServiceError::Checkpoint`] before anything
    /// changes.
    pub fn set_exit(
        &self,
        state: ServiceState,
        win32_exit_code: u32,
        service_specific_exit_code: u32,
    ) -> Result<()> {
        let previous = {
            let mut inner = lock(&self.inner);
            if inner.transitioning {
                return Err(ServiceError::InvalidState(format!(
                    "status change to {} overlaps another status change",
                    state
                )));
            }
            if inner.status.state == state {
                return Ok(());
            }
            inner.transitioning = true;
            inner.worker.take().map(|worker| {
                drop(worker.cancel);
                worker.handle
            })
        };
        let _transition = TransitionGuard(&self.inner);

        if let Some(handle) = previous {
            join_worker(handle).map_err(|err| ServiceError::Checkpoint(Box::new(err)))?;
        }

        let record = self.build(state, win32_exit_code, service_specific_exit_code);
        let (restore, restore_intent) = {
            let mut inner = lock(&self.inner);
            let restore = std::mem::replace(&mut inner.status, record.clone());
            let restore_intent = inner.intent;
            if state == ServiceState::Stopped || inner.intent == Some(state.target()) {
                inner.intent = None;
            }
            (restore, restore_intent)
        };

        tracing::info!(
            state = %record.state,
            controls = record.controls_accepted.bits(),
            exit_code = record.win32_exit_code,
            service_exit_code = record.service_specific_exit_code,
            "service status"
        );
        if let Err(err) = self.reporter.report(&record) {
            // The supervisor never saw the new state.
            let mut inner = lock(&self.inner);
            inner.status = restore;
            if inner.intent.is_none() {
                inner.intent = restore_intent;
            }
            return Err(err);
        }

        if state.is_pending() {
            let worker = self.spawn_worker()?;
            lock(&self.inner).worker = Some(worker);
        }
        Ok(())
    }

    /// Runs `f` with the current state and the pending intent while holding
    /// the status lock, so an acceptance decision cannot race a transition.
    pub(crate) fn gate<R>(&self, f: impl FnOnce(ServiceState, &mut Option<ServiceState>) -> R) -> R {
        let mut inner = lock(&self.inner);
        let state = inner.status.state;
        f(state, &mut inner.intent)
    }

    fn build(&self, state: ServiceState, win32: u32, specific: u32) -> ServiceStatus {
        let controls_accepted = match state {
            ServiceState::StartPending | ServiceState::StopPending | ServiceState::Stopped => {
                ControlsAccepted::empty()
            }
            _ => self.accepted,
        };
        let (win32_exit_code, service_specific_exit_code) = if state == ServiceState::Stopped {
            (win32, specific)
        } else {
            (codes::NO_ERROR, codes::NO_ERROR)
        };
        ServiceStatus {
            state,
            controls_accepted,
            win32_exit_code,
            service_specific_exit_code,
            checkpoint: if state.is_pending() { 1 } else { 0 },
            wait_hint: self.timing.wait_hint(state),
        }
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let (cancel, cancelled) = crossbeam_channel::bounded(0);
        let inner = self.inner.clone();
        let reporter = self.reporter.clone();
        let interval = self.timing.checkpoint_interval;
        let handle = thread::Builder::new()
            .name("svc-checkpoint".into())
            .spawn(move || checkpoint_loop(&inner, reporter.as_ref(), interval, &cancelled))
            .map_err(|err| {
                ServiceError::InvalidState(format!("cannot spawn checkpoint worker: {}", err))
            })?;
        Ok(Worker { cancel, handle })
    }
}

impl Drop for StatusManager {
    fn drop(&mut self) {
        let worker = lock(&self.inner).worker.take();
        if let Some(worker) = worker {
            drop(worker.cancel);
            if let Err(err) = join_worker(worker.handle) {
                tracing::warn!(error = %err, "checkpoint worker failed during teardown");
            }
        }
    }
}

fn join_worker(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "checkpoint worker failed");
            Err(err)
        }
        Err(panic) => Err(ServiceError::Panicked(panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn checkpoint_loop(
    inner: &Mutex<Inner>,
    reporter: &dyn StatusReporter,
    interval: std::time::Duration,
    cancelled: &Receiver<()>,
) -> Result<()> {
    loop {
        crossbeam_channel::select! {
            recv(cancelled) -> _ => return Ok(()),
            default(interval) => {}
        }
        let record = {
            let mut inner = lock(inner);
            // The sender is dropped under this lock when the period is superseded.
            if let Err(TryRecvError::Disconnected) = cancelled.try_recv() {
                return Ok(());
            }
            inner.status.checkpoint += 1;
            inner.status.clone()
        };
        tracing::trace!(state = %record.state, checkpoint = record.checkpoint, "checkpoint");
        reporter.report(&record)?;
    }
}
