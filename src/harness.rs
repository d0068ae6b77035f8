//! In-process supervisor used to drive a [`ServiceHost`] without the Windows
//! service control manager.

use std::ffi::OsString;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, ServiceError};
use crate::gensvc::{ControlCallback, StatusReporter, Supervisor};
use crate::status::{codes, ControlEvent, ControlKind, ServiceState, ServiceStatus, ServiceType};
use crate::svc::{Service, ServiceHost};

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Win32 `ERROR_INVALID_HANDLE`, returned for reports the harness refuses.
const ERROR_INVALID_HANDLE: u32 = 6;

#[derive(Default)]
struct Observed {
    name: Option<String>,
    callback: Option<Arc<ControlCallback>>,
    history: Vec<ServiceStatus>,
    fail_reports_after: Option<usize>,
    rejected_state: Option<ServiceState>,
    finished: bool,
}

impl Observed {
    fn current(&self) -> Option<ServiceState> {
        self.history.last().map(|s| s.state)
    }

    fn seen(&self, state: ServiceState) -> bool {
        self.seen_since(0, state)
    }

    fn seen_since(&self, from: usize, state: ServiceState) -> bool {
        self.history.iter().skip(from).any(|s| s.state == state)
    }

    fn stopped_with_failure(&self) -> bool {
        matches!(self.history.last(), Some(s) if s.state == ServiceState::Stopped && s.is_failure())
    }
}

#[derive(Default)]
struct Shared {
    observed: Mutex<Observed>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Observed)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    /// Blocks until `done` holds or `timeout` elapses; `None` waits forever.
    fn wait_until(&self, timeout: Option<Duration>, done: impl Fn(&Observed) -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut observed = self.lock();
        loop {
            if done(&observed) {
                return true;
            }
            observed = match deadline {
                None => self
                    .changed
                    .wait(observed)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.changed
                        .wait_timeout(observed, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Supervisor that lives entirely inside the current process.
#[derive(Clone, Default)]
pub struct LocalSupervisor {
    shared: Arc<Shared>,
}

struct LocalReporter {
    shared: Arc<Shared>,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every report after the first `n` fail.
    pub fn fail_reports_after(&self, n: usize) {
        self.shared.update(|o| o.fail_reports_after = Some(n));
    }

    /// Makes every report of `state` fail.
    pub fn reject_reports_of(&self, state: ServiceState) {
        self.shared.update(|o| o.rejected_state = Some(state));
    }

    pub fn registered_name(&self) -> Option<String> {
        self.shared.lock().name.clone()
    }

    pub fn history(&self) -> Vec<ServiceStatus> {
        self.shared.lock().history.clone()
    }

    pub fn current(&self) -> Option<ServiceStatus> {
        self.shared.lock().history.last().cloned()
    }

    /// Delivers a control to the registered callback, outside of any lock.
    pub fn send(&self, raw: u32, event: ControlEvent) -> u32 {
        let callback = self.shared.lock().callback.clone();
        match callback {
            Some(callback) => (*callback)(raw, event),
            None => codes::ERROR_SERVICE_NOT_ACTIVE,
        }
    }

    fn reset(&self) {
        self.shared.update(|o| {
            *o = Observed {
                fail_reports_after: o.fail_reports_after,
                rejected_state: o.rejected_state,
                ..Observed::default()
            };
        });
    }

    fn finish(&self) {
        self.shared.update(|o| o.finished = true);
    }
}

impl Supervisor for LocalSupervisor {
    fn register(
        &self,
        name: &str,
        service_type: ServiceType,
        callback: ControlCallback,
    ) -> Result<Arc<dyn StatusReporter>> {
        if name.trim().is_empty() {
            return Err(ServiceError::Registration(
                "service name must not be empty".into(),
            ));
        }
        tracing::debug!(name, ?service_type, "local control handler registered");
        self.shared.update(|o| {
            o.name = Some(name.to_string());
            o.callback = Some(Arc::new(callback));
        });
        Ok(Arc::new(LocalReporter {
            shared: self.shared.clone(),
        }))
    }
}

impl StatusReporter for LocalReporter {
    fn report(&self, status: &ServiceStatus) -> Result<()> {
        let mut observed = self.shared.lock();
        let over_limit = matches!(observed.fail_reports_after, Some(n) if observed.history.len() >= n);
        if over_limit || observed.rejected_state == Some(status.state) {
            return Err(ServiceError::report(
                ERROR_INVALID_HANDLE,
                "status handle rejected by local supervisor",
            ));
        }
        observed.history.push(status.clone());
        drop(observed);
        self.shared.changed.notify_all();
        Ok(())
    }
}

/// Drives one [`ServiceHost`] on a dedicated thread.
pub struct Harness<S: Service> {
    host: Arc<ServiceHost<S>>,
    supervisor: LocalSupervisor,
    thread: Option<JoinHandle<Result<ServiceStatus>>>,
    start_timeout: Duration,
}

impl<S: Service> Harness<S> {
    pub fn new(host: ServiceHost<S>) -> Self {
        Self::from_shared(Arc::new(host))
    }

    pub fn from_shared(host: Arc<ServiceHost<S>>) -> Self {
        Harness {
            host,
            supervisor: LocalSupervisor::new(),
            thread: None,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn host(&self) -> &Arc<ServiceHost<S>> {
        &self.host
    }

    pub fn supervisor(&self) -> &LocalSupervisor {
        &self.supervisor
    }

    /// Starts the service and blocks until it is running.
    ///
    /// Fails with `Timeout` when no `StartPending` report arrives within the
    /// start timeout, with the run's own error when it ends before reporting
    /// anything, and with `Exited` when the start sequence fails.
    pub fn start<I, A>(&mut self, name: &str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        if self.thread.is_some() && !self.shared().lock().finished {
            return Err(ServiceError::InvalidState(format!(
                "service {} is still running",
                name
            )));
        }
        if self.thread.is_some() {
            if let Err(err) = self.join() {
                tracing::warn!(error = %err, "previous run ended with an error");
            }
        }
        self.supervisor.reset();

        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let host = self.host.clone();
        let supervisor = self.supervisor.clone();
        let service_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("svc-{}", name))
            .spawn(move || {
                let result = host.run(&supervisor, &service_name, ServiceType::OwnProcess, args);
                supervisor.finish();
                result
            })
            .map_err(|err| ServiceError::InvalidState(format!("cannot spawn service thread: {}", err)))?;
        self.thread = Some(handle);

        let started = self.shared().wait_until(Some(self.start_timeout), |o| {
            o.seen(ServiceState::StartPending) || o.finished
        });
        if !started {
            return Err(ServiceError::Timeout {
                state: ServiceState::StartPending,
            });
        }
        self.shared().wait_until(None, |o| {
            o.seen(ServiceState::Running) || o.current() == Some(ServiceState::Stopped) || o.finished
        });

        if self.shared().lock().seen(ServiceState::Running) {
            return Ok(());
        }
        // The run ended without ever running: surface why.
        let final_status = self.join()?;
        match ServiceError::from_exit_codes(
            final_status.win32_exit_code,
            final_status.service_specific_exit_code,
        ) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn send_control(&self, kind: ControlKind) -> u32 {
        self.send_control_with(kind, ControlEvent::default())
    }

    pub fn send_control_with(&self, kind: ControlKind, event: ControlEvent) -> u32 {
        self.supervisor.send(kind.raw(), event)
    }

    /// Sends Stop, waits for `Stopped` and turns a failure exit code into an
    /// error.
    pub fn stop(&mut self) -> Result<()> {
        if self.thread.is_none() {
            return Err(ServiceError::InvalidState("service was never started".into()));
        }
        let code = self.send_control(ControlKind::Stop);
        if code != codes::NO_ERROR && code != codes::ERROR_SERVICE_NOT_ACTIVE {
            return Err(ServiceError::InvalidControl { code });
        }
        let final_status = self.join()?;
        match ServiceError::from_exit_codes(
            final_status.win32_exit_code,
            final_status.service_specific_exit_code,
        ) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until `state` is the current state or has been reported since
    /// the call began. Gives up early once the service has stopped with a
    /// failure or its run has ended.
    pub fn wait_for_status(&self, state: ServiceState, timeout: Duration) -> bool {
        let from = self.shared().lock().history.len();
        let reached = |o: &Observed| o.current() == Some(state) || o.seen_since(from, state);
        self.shared().wait_until(Some(timeout), |o| {
            reached(o) || o.stopped_with_failure() || o.finished
        });
        reached(&*self.shared().lock())
    }

    /// Waits for the run to end by itself and returns its final status.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<ServiceStatus> {
        if !self.shared().wait_until(Some(timeout), |o| o.finished) {
            return Err(ServiceError::Timeout {
                state: ServiceState::Stopped,
            });
        }
        self.join()
    }

    pub fn status(&self) -> Option<ServiceStatus> {
        self.supervisor.current()
    }

    /// Whether the last run has returned.
    pub fn is_finished(&self) -> bool {
        self.shared().lock().finished
    }

    pub fn history(&self) -> Vec<ServiceStatus> {
        self.supervisor.history()
    }

    /// Reported states with consecutive repeats (checkpoints) folded.
    pub fn states(&self) -> Vec<ServiceState> {
        let mut states: Vec<ServiceState> = Vec::new();
        for status in self.supervisor.history() {
            if states.last() != Some(&status.state) {
                states.push(status.state);
            }
        }
        states
    }

    fn shared(&self) -> &Shared {
        &self.supervisor.shared
    }

    fn join(&mut self) -> Result<ServiceStatus> {
        let handle = self
            .thread
            .take()
            .ok_or_else(|| ServiceError::InvalidState("service was never started".into()))?;
        match handle.join() {
            Ok(result) => result,
            Err(panic) => Err(ServiceError::Panicked(crate::reporter::panic_message(
                panic.as_ref(),
            ))),
        }
    }
}

impl<S: Service> Drop for Harness<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            if self.shared().lock().finished {
                match handle.join() {
                    Ok(Err(err)) => tracing::warn!(error = %err, "service run ended with an error"),
                    Err(_) => tracing::warn!("service thread panicked"),
                    Ok(Ok(_)) => {}
                }
            } else {
                // A run cannot be preempted; leave it to finish on its own.
                tracing::warn!("harness dropped while the service is still running, detaching");
                drop(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_are_rejected() {
        let supervisor = LocalSupervisor::new();
        let err = supervisor
            .register(" ", ServiceType::OwnProcess, Box::new(|_: u32, _: ControlEvent| 0))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Registration(_)));
    }

    #[test]
    fn controls_reach_the_registered_callback() {
        let supervisor = LocalSupervisor::new();
        assert_eq!(
            supervisor.send(1, ControlEvent::default()),
            codes::ERROR_SERVICE_NOT_ACTIVE
        );
        supervisor
            .register("svc", ServiceType::OwnProcess, Box::new(|raw: u32, e: ControlEvent| raw + e.event_type))
            .unwrap();
        assert_eq!(supervisor.registered_name().as_deref(), Some("svc"));
        assert_eq!(supervisor.send(2, ControlEvent::new(40, None)), 42);
    }

    #[test]
    fn reports_fail_past_the_configured_count() {
        let supervisor = LocalSupervisor::new();
        supervisor.fail_reports_after(1);
        let reporter = supervisor
            .register("svc", ServiceType::OwnProcess, Box::new(|_: u32, _: ControlEvent| 0))
            .unwrap();
        reporter.report(&ServiceStatus::stopped()).unwrap();
        assert!(reporter.report(&ServiceStatus::stopped()).is_err());
        assert_eq!(supervisor.history().len(), 1);
    }

    #[test]
    fn reports_of_a_rejected_state_fail() {
        let supervisor = LocalSupervisor::new();
        supervisor.reject_reports_of(ServiceState::Stopped);
        let reporter = supervisor
            .register("svc", ServiceType::OwnProcess, Box::new(|_: u32, _: ControlEvent| 0))
            .unwrap();
        let running = ServiceStatus {
            state: ServiceState::Running,
            ..ServiceStatus::stopped()
        };
        reporter.report(&running).unwrap();
        let err = reporter.report(&ServiceStatus::stopped()).unwrap_err();
        assert!(matches!(err, ServiceError::Report { code: ERROR_INVALID_HANDLE, .. }));
        assert_eq!(supervisor.current().map(|s| s.state), Some(ServiceState::Running));
    }
}
