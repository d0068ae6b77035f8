use std::ffi::OsString;
use std::sync::Arc;

use crate::error::Result;

/// A secondary component notified alongside the primary service logic.
///
/// Every hook defaults to a no-op so a participant only implements the events
/// it cares about.
pub trait Participant: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_start(&self, _args: &[OsString]) -> Result<()> {
        Ok(())
    }

    fn on_pause(&self) -> Result<()> {
        Ok(())
    }

    fn on_continue(&self) -> Result<()> {
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of participants. Filled while the host is being built and
/// read-only once the service runs.
#[derive(Default, Clone)]
pub struct ParticipantChain {
    participants: Vec<Arc<dyn Participant>>,
}

impl ParticipantChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: Arc<dyn Participant>) -> &mut Self {
        tracing::debug!(participant = participant.name(), "registered participant");
        self.participants.push(participant);
        self
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn start(&self, args: &[OsString]) -> Result<()> {
        self.participants.iter().try_for_each(|p| p.on_start(args))
    }

    pub fn pause(&self) -> Result<()> {
        self.participants.iter().try_for_each(|p| p.on_pause())
    }

    pub fn resume(&self) -> Result<()> {
        self.participants.iter().try_for_each(|p| p.on_continue())
    }

    /// Every participant is told to stop even if an earlier one fails; the
    /// first failure is returned.
    pub fn stop(&self) -> Result<()> {
        let mut first = None;
        for p in &self.participants {
            if let Err(err) = p.on_stop() {
                tracing::warn!(participant = p.name(), error = %err, "participant failed to stop");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ParticipantChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.participants.iter().map(|p| p.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::sync::Mutex;

    struct Probe {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl Probe {
        fn record(&self, event: &'static str) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
            if self.fail_on == Some(event) {
                return Err(ServiceError::handler(5, event));
            }
            Ok(())
        }
    }

    impl Participant for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn on_start(&self, _args: &[OsString]) -> Result<()> {
            self.record("start")
        }

        fn on_pause(&self) -> Result<()> {
            self.record("pause")
        }

        fn on_continue(&self) -> Result<()> {
            self.record("continue")
        }

        fn on_stop(&self) -> Result<()> {
            self.record("stop")
        }
    }

    fn chain(fail_on: Option<&'static str>) -> (ParticipantChain, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ParticipantChain::new();
        for name in ["a", "b", "c"] {
            chain.register(Arc::new(Probe {
                name,
                log: log.clone(),
                fail_on: if name == "b" { fail_on } else { None },
            }));
        }
        (chain, log)
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let (chain, log) = chain(None);
        chain.start(&[]).unwrap();
        chain.pause().unwrap();
        chain.resume().unwrap();
        chain.stop().unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log[..3], ["a:start", "b:start", "c:start"]);
        assert_eq!(log[9..], ["a:stop", "b:stop", "c:stop"]);
    }

    #[test]
    fn start_short_circuits_on_failure() {
        let (chain, log) = chain(Some("start"));
        assert!(chain.start(&[]).is_err());
        assert_eq!(*log.lock().unwrap(), ["a:start", "b:start"]);
    }

    #[test]
    fn stop_reaches_every_participant() {
        let (chain, log) = chain(Some("stop"));
        let err = chain.stop().unwrap_err();
        assert_eq!(err.code(), 5);
        assert_eq!(*log.lock().unwrap(), ["a:stop", "b:stop", "c:stop"]);
    }

    #[test]
    fn default_hooks_are_no_ops() {
        struct Quiet;
        impl Participant for Quiet {}
        let mut chain = ParticipantChain::new();
        chain.register(Arc::new(Quiet));
        assert_eq!(chain.len(), 1);
        chain.start(&[OsString::from("x")]).unwrap();
        chain.stop().unwrap();
    }
}
