//! The service lifecycle state machine. A run has no external cancellation
//! point; an owner that gives up early can only abandon its thread.

use std::ffi::OsString;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::OnceCell;

use crate::error::{Result, ServiceError};
use crate::gensvc::{ControlCallback, Supervisor};
use crate::handlers::{HandlerEntry, HandlerRegistry};
use crate::participant::{Participant, ParticipantChain};
use crate::reporter::{panic_message, StatusManager};
use crate::status::{
    codes, ControlEvent, ControlKind, ControlsAccepted, ServiceState, ServiceStatus, ServiceType,
    StatusTiming,
};

/// The primary logic of a service.
pub trait Service: Send + Sync + Sized + 'static {
    /// Declarative handler list. Consulted once, when the host is built.
    fn handlers() -> Vec<HandlerEntry<Self>>;

    /// Start logic, run after every participant has started. The service is
    /// reported `Running` once this returns successfully.
    fn start(&self, ctx: &ServiceContext, args: &[OsString]) -> Result<()>;
}

/// Result of a Stop, Pause or Continue control once the service thread has
/// processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOutcome {
    pub kind: ControlKind,
    pub code: u32,
}

trait Control: Send + Sync {
    fn name(&self) -> &str;
    fn dispatch(&self, raw: u32, event: ControlEvent) -> u32;
    fn status(&self) -> ServiceStatus;
}

/// Handle a running service keeps to interact with its own lifecycle.
#[derive(Clone)]
pub struct ServiceContext {
    control: Arc<dyn Control>,
}

impl ServiceContext {
    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// Asks the machine to stop, through the same path a supervisor Stop
    /// takes. Returns the dispatch result code.
    pub fn request_stop(&self) -> u32 {
        self.control
            .dispatch(ControlKind::Stop.raw(), ControlEvent::default())
    }

    pub fn status(&self) -> ServiceStatus {
        self.control.status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    Redundant,
    Reject(u32),
}

/// Decides whether a control is accepted against the current state and the
/// target of any control accepted but not yet acted on.
pub(crate) fn admit(
    state: ServiceState,
    intent: Option<ServiceState>,
    kind: ControlKind,
    accepted: ControlsAccepted,
    handled: bool,
) -> Admission {
    match state {
        ServiceState::Stopped | ServiceState::StopPending => {
            return Admission::Reject(codes::ERROR_SERVICE_NOT_ACTIVE)
        }
        _ if intent == Some(ServiceState::Stopped) => {
            return Admission::Reject(codes::ERROR_SERVICE_NOT_ACTIVE)
        }
        ServiceState::StartPending if kind == ControlKind::Stop => return Admission::Accept,
        ServiceState::StartPending => {
            return Admission::Reject(codes::ERROR_SERVICE_CANNOT_ACCEPT_CTRL)
        }
        _ => {}
    }

    let heading = intent.unwrap_or(state);
    match kind {
        ControlKind::Interrogate => return Admission::Redundant,
        ControlKind::Pause
            if matches!(heading, ServiceState::Paused | ServiceState::PausePending) =>
        {
            return Admission::Redundant
        }
        ControlKind::Continue
            if matches!(heading, ServiceState::Running | ServiceState::ContinuePending) =>
        {
            return Admission::Redundant
        }
        _ => {}
    }

    let bit = kind.accept_bit();
    let allowed = if bit.is_empty() {
        handled
    } else {
        accepted.contains(bit)
    };
    if allowed {
        Admission::Accept
    } else {
        Admission::Reject(codes::ERROR_CALL_NOT_IMPLEMENTED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Stop,
    Pause,
    Continue,
}

/// One-shot flags for the three transitions the service thread performs.
struct Signals {
    stop: (Sender<()>, Receiver<()>),
    pause: (Sender<()>, Receiver<()>),
    resume: (Sender<()>, Receiver<()>),
}

impl Signals {
    fn new() -> Self {
        Signals {
            stop: crossbeam_channel::bounded(1),
            pause: crossbeam_channel::bounded(1),
            resume: crossbeam_channel::bounded(1),
        }
    }

    fn raise(flag: &(Sender<()>, Receiver<()>)) {
        // A full channel means the flag is already raised.
        let _ = flag.0.try_send(());
    }

    /// Takes back a raised flag the service thread has not consumed yet.
    fn withdraw(flag: &(Sender<()>, Receiver<()>)) -> bool {
        flag.1.try_recv().is_ok()
    }

    fn wait(&self) -> Signal {
        let signal = crossbeam_channel::select! {
            recv(self.stop.1) -> _ => Signal::Stop,
            recv(self.pause.1) -> _ => Signal::Pause,
            recv(self.resume.1) -> _ => Signal::Continue,
        };
        if signal != Signal::Stop && Self::withdraw(&self.stop) {
            return Signal::Stop;
        }
        signal
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one run: everything control dispatch needs.
struct Runtime<S: Service> {
    name: String,
    service: Arc<S>,
    registry: Arc<HandlerRegistry<S>>,
    status: StatusManager,
    signals: Signals,
    outcome: Arc<Mutex<Option<ControlOutcome>>>,
}

impl<S: Service> Runtime<S> {
    fn record(&self, kind: ControlKind, code: u32) {
        *lock(&self.outcome) = Some(ControlOutcome { kind, code });
    }

    fn invoke(&self, kind: ControlKind, event: &ControlEvent) -> Result<()> {
        self.registry.invoke_all(kind, &self.service, event)
    }

    /// Runs handlers for a control that causes no transition, in the
    /// dispatch context.
    fn invoke_inline(&self, kind: ControlKind, event: &ControlEvent) -> u32 {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.invoke(kind, event)));
        match result {
            Ok(Ok(())) => codes::NO_ERROR,
            Ok(Err(err)) => {
                tracing::warn!(control = %kind, error = %err, "control handler failed");
                err.code()
            }
            Err(panic) => {
                tracing::error!(
                    control = %kind,
                    panic = %panic_message(panic.as_ref()),
                    "control handler panicked"
                );
                codes::ERROR_EXCEPTION_IN_SERVICE
            }
        }
    }

    fn raise(&self, kind: ControlKind, intent: &mut Option<ServiceState>) -> Admission {
        match kind {
            ControlKind::Stop => {
                Signals::raise(&self.signals.stop);
                *intent = Some(ServiceState::Stopped);
            }
            ControlKind::Pause => {
                if Signals::withdraw(&self.signals.resume) {
                    *intent = None;
                    return Admission::Redundant;
                }
                Signals::raise(&self.signals.pause);
                *intent = Some(ServiceState::Paused);
            }
            ControlKind::Continue => {
                if Signals::withdraw(&self.signals.pause) {
                    *intent = None;
                    return Admission::Redundant;
                }
                Signals::raise(&self.signals.resume);
                *intent = Some(ServiceState::Running);
            }
            _ => {}
        }
        Admission::Accept
    }
}

impl<S: Service> Control for Runtime<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, raw: u32, event: ControlEvent) -> u32 {
        let kind = match ControlKind::from_raw(raw) {
            Some(kind) => kind,
            None => {
                tracing::debug!(control = raw, "unrecognised control");
                return codes::ERROR_INVALID_SERVICE_CONTROL;
            }
        };
        let handled = self.registry.handles(kind);
        let admission = self.status.gate(|state, intent| {
            match admit(state, *intent, kind, self.registry.accepted(), handled) {
                Admission::Accept => self.raise(kind, intent),
                other => other,
            }
        });

        match admission {
            Admission::Reject(code) => {
                tracing::debug!(control = %kind, code, "control rejected");
                code
            }
            Admission::Redundant => codes::NO_ERROR,
            Admission::Accept => match kind {
                ControlKind::Stop | ControlKind::Pause | ControlKind::Continue => {
                    tracing::debug!(control = %kind, "control accepted");
                    codes::NO_ERROR
                }
                ControlKind::Shutdown | ControlKind::Preshutdown => {
                    let code = self.invoke_inline(kind, &event);
                    if code == codes::NO_ERROR {
                        self.dispatch(ControlKind::Stop.raw(), ControlEvent::default());
                    }
                    code
                }
                _ => self.invoke_inline(kind, &event),
            },
        }
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ServiceHostBuilder<S: Service> {
    service: S,
    participants: ParticipantChain,
    timing: StatusTiming,
}

impl<S: Service> ServiceHostBuilder<S> {
    pub fn participant(mut self, participant: impl Participant + 'static) -> Self {
        self.participants.register(Arc::new(participant));
        self
    }

    pub fn shared_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participants.register(participant);
        self
    }

    pub fn timing(mut self, timing: StatusTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn build(self) -> ServiceHost<S> {
        let registry = HandlerRegistry::new(S::handlers());
        tracing::debug!(
            handlers = registry.entries().len(),
            accepted = registry.accepted().bits(),
            participants = self.participants.len(),
            "service host built"
        );
        ServiceHost {
            service: Arc::new(self.service),
            registry: Arc::new(registry),
            participants: self.participants,
            timing: self.timing,
            active: AtomicBool::new(false),
            current: Mutex::new(None),
            outcome: Arc::new(Mutex::new(None)),
        }
    }
}

pub struct ServiceHost<S: Service> {
    service: Arc<S>,
    registry: Arc<HandlerRegistry<S>>,
    participants: ParticipantChain,
    timing: StatusTiming,
    active: AtomicBool,
    current: Mutex<Option<Arc<Runtime<S>>>>,
    outcome: Arc<Mutex<Option<ControlOutcome>>>,
}

impl<S: Service> ServiceHost<S> {
    pub fn builder(service: S) -> ServiceHostBuilder<S> {
        ServiceHostBuilder {
            service,
            participants: ParticipantChain::new(),
            timing: StatusTiming::default(),
        }
    }

    pub fn new(service: S) -> Self {
        Self::builder(service).build()
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn registry(&self) -> &HandlerRegistry<S> {
        &self.registry
    }

    pub fn timing(&self) -> StatusTiming {
        self.timing
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Snapshot of the current run's status, or of the last run's final
    /// status once it has ended.
    pub fn status(&self) -> ServiceStatus {
        match lock(&self.current).as_ref() {
            Some(runtime) => runtime.status.status(),
            None => ServiceStatus::stopped(),
        }
    }

    pub fn last_outcome(&self) -> Option<ControlOutcome> {
        *lock(&self.outcome)
    }

    /// Runs the service to completion under `supervisor`.
    ///
    /// Returns the final `Stopped` status; a failed run is reported through
    /// its exit codes rather than as an error. An error is returned only when
    /// registration fails, when a run is already active, or when the final
    /// status cannot be reported.
    pub fn run(
        &self,
        supervisor: &dyn Supervisor,
        name: &str,
        service_type: ServiceType,
        args: Vec<OsString>,
    ) -> Result<ServiceStatus> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::InvalidState(format!(
                "service {} is already running",
                name
            )));
        }
        let _active = ActiveGuard(&self.active);

        let slot: Arc<OnceCell<Weak<Runtime<S>>>> = Arc::new(OnceCell::new());
        let callback_slot = slot.clone();
        let callback: ControlCallback = Box::new(move |raw: u32, event: ControlEvent| {
            match callback_slot.get().and_then(Weak::upgrade) {
                Some(runtime) => runtime.dispatch(raw, event),
                None => codes::ERROR_SERVICE_NOT_ACTIVE,
            }
        });
        let reporter = supervisor.register(name, service_type, callback)?;

        let runtime = Arc::new(Runtime {
            name: name.to_string(),
            service: self.service.clone(),
            registry: self.registry.clone(),
            status: StatusManager::new(reporter, self.registry.accepted(), self.timing),
            signals: Signals::new(),
            outcome: self.outcome.clone(),
        });
        let _ = slot.set(Arc::downgrade(&runtime));
        *lock(&self.current) = Some(runtime.clone());
        *lock(&self.outcome) = None;

        let span = tracing::info_span!("service", name = %name);
        let _enter = span.enter();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&runtime, &args)))
            .unwrap_or_else(|panic| Err(ServiceError::Panicked(panic_message(panic.as_ref()))));

        if let Err(err) = result {
            tracing::error!(error = %err, "service failed");
            let (win32, specific) = (err.code(), err.service_specific_code());
            match runtime.status.set_exit(ServiceState::Stopped, win32, specific) {
                // The worker that failed is gone; Stopped was not reported yet.
                Err(ServiceError::Checkpoint(source)) => {
                    tracing::warn!(error = %source, "checkpoint worker failed before stop");
                    runtime
                        .status
                        .set_exit(ServiceState::Stopped, win32, specific)?;
                }
                other => other?,
            }
        }
        Ok(runtime.status.status())
    }

    fn execute(&self, runtime: &Arc<Runtime<S>>, args: &[OsString]) -> Result<()> {
        runtime.status.set(ServiceState::StartPending)?;
        self.participants.start(args)?;
        let ctx = ServiceContext {
            control: runtime.clone(),
        };
        self.service.start(&ctx, args)?;
        runtime.status.set(ServiceState::Running)?;
        tracing::info!("service started");

        loop {
            match runtime.signals.wait() {
                Signal::Stop => return self.stop(runtime),
                Signal::Pause => self.pause(runtime)?,
                Signal::Continue => self.resume(runtime)?,
            }
        }
    }

    fn stop(&self, runtime: &Runtime<S>) -> Result<()> {
        runtime.status.set(ServiceState::StopPending)?;
        let handled = runtime.invoke(ControlKind::Stop, &ControlEvent::default());
        let released = self.participants.stop();
        let (win32, specific) = match handled.and(released) {
            Ok(()) => (codes::NO_ERROR, codes::NO_ERROR),
            Err(err) => {
                tracing::warn!(error = %err, "stop processing failed");
                (err.code(), err.service_specific_code())
            }
        };
        runtime.record(ControlKind::Stop, win32);
        runtime
            .status
            .set_exit(ServiceState::Stopped, win32, specific)?;
        tracing::info!("service stopped");
        Ok(())
    }

    fn pause(&self, runtime: &Runtime<S>) -> Result<()> {
        runtime.status.set(ServiceState::PausePending)?;
        let outcome = runtime
            .invoke(ControlKind::Pause, &ControlEvent::default())
            .and_then(|()| self.participants.pause());
        match outcome {
            Ok(()) => {
                runtime.record(ControlKind::Pause, codes::NO_ERROR);
                runtime.status.set(ServiceState::Paused)
            }
            Err(err) => {
                tracing::warn!(error = %err, "pause failed, resuming");
                runtime.record(ControlKind::Pause, err.code());
                runtime.status.set(ServiceState::Running)
            }
        }
    }

    fn resume(&self, runtime: &Runtime<S>) -> Result<()> {
        runtime.status.set(ServiceState::ContinuePending)?;
        let outcome = self
            .participants
            .resume()
            .and_then(|()| runtime.invoke(ControlKind::Continue, &ControlEvent::default()));
        match outcome {
            Ok(()) => {
                runtime.record(ControlKind::Continue, codes::NO_ERROR);
                runtime.status.set(ServiceState::Running)
            }
            Err(err) => {
                tracing::warn!(error = %err, "continue failed, staying paused");
                runtime.record(ControlKind::Continue, err.code());
                runtime.status.set(ServiceState::Paused)
            }
        }
    }
}
