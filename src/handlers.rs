use crate::error::{Result, ServiceError};
use crate::status::{ControlEvent, ControlKind, ControlsAccepted};

type PlainFn<S> = Box<dyn Fn(&S) + Send + Sync>;
type DetailFn<S> = Box<dyn Fn(&S, &ControlEvent) + Send + Sync>;
type FallibleFn<S> = Box<dyn Fn(&S) -> Result<()> + Send + Sync>;
type FallibleDetailFn<S> = Box<dyn Fn(&S, &ControlEvent) -> Result<()> + Send + Sync>;

/// The four callback shapes a handler entry can bind.
pub enum Callback<S> {
    Plain(PlainFn<S>),
    WithDetail(DetailFn<S>),
    Fallible(FallibleFn<S>),
    FallibleWithDetail(FallibleDetailFn<S>),
}

impl<S> Callback<S> {
    fn call(&self, service: &S, event: &ControlEvent) -> Result<()> {
        match self {
            Callback::Plain(f) => {
                f(service);
                Ok(())
            }
            Callback::WithDetail(f) => {
                f(service, event);
                Ok(())
            }
            Callback::Fallible(f) => f(service),
            Callback::FallibleWithDetail(f) => f(service, event),
        }
    }
}

pub struct HandlerEntry<S> {
    kind: ControlKind,
    callback: Option<Callback<S>>,
}

impl<S> HandlerEntry<S> {
    pub fn plain(kind: ControlKind, f: impl Fn(&S) + Send + Sync + 'static) -> Self {
        Self::bound(kind, Callback::Plain(Box::new(f)))
    }

    pub fn with_detail(
        kind: ControlKind,
        f: impl Fn(&S, &ControlEvent) + Send + Sync + 'static,
    ) -> Self {
        Self::bound(kind, Callback::WithDetail(Box::new(f)))
    }

    pub fn fallible(kind: ControlKind, f: impl Fn(&S) -> Result<()> + Send + Sync + 'static) -> Self {
        Self::bound(kind, Callback::Fallible(Box::new(f)))
    }

    pub fn fallible_with_detail(
        kind: ControlKind,
        f: impl Fn(&S, &ControlEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self::bound(kind, Callback::FallibleWithDetail(Box::new(f)))
    }

    /// An entry that declares the kind without binding a callback. It still
    /// contributes to the accepted mask; invoking it is an error.
    pub fn unbound(kind: ControlKind) -> Self {
        HandlerEntry {
            kind,
            callback: None,
        }
    }

    fn bound(kind: ControlKind, callback: Callback<S>) -> Self {
        HandlerEntry {
            kind,
            callback: Some(callback),
        }
    }

    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    pub fn is_bound(&self) -> bool {
        self.callback.is_some()
    }

    pub fn invoke(&self, service: &S, event: &ControlEvent) -> Result<()> {
        match &self.callback {
            Some(callback) => callback.call(service, event),
            None => Err(ServiceError::InvalidState(format!(
                "no callback bound for {} handler",
                self.kind
            ))),
        }
    }
}

impl<S> std::fmt::Debug for HandlerEntry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("kind", &self.kind)
            .field("bound", &self.is_bound())
            .finish()
    }
}

pub struct HandlerRegistry<S> {
    entries: Vec<HandlerEntry<S>>,
    accepted: ControlsAccepted,
}

impl<S> HandlerRegistry<S> {
    pub fn new(entries: Vec<HandlerEntry<S>>) -> Self {
        let accepted = entries
            .iter()
            .fold(ControlsAccepted::empty(), |mask, e| mask | e.kind.accept_bit());
        HandlerRegistry { entries, accepted }
    }

    pub fn entries(&self) -> &[HandlerEntry<S>] {
        &self.entries
    }

    /// Mask derived from every distinct kind present in the list.
    pub fn accepted(&self) -> ControlsAccepted {
        self.accepted
    }

    pub fn handles(&self, kind: ControlKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn for_kind(&self, kind: ControlKind) -> impl Iterator<Item = &HandlerEntry<S>> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Invokes every entry bound to `kind` in registration order, stopping at
    /// the first failure.
    pub fn invoke_all(&self, kind: ControlKind, service: &S, event: &ControlEvent) -> Result<()> {
        for entry in self.for_kind(kind) {
            entry.invoke(service, event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, s: impl Into<String>) {
            self.calls.lock().unwrap().push(s.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[test]
    fn mask_is_derived_from_distinct_kinds() {
        let registry: HandlerRegistry<Recorder> = HandlerRegistry::new(vec![
            HandlerEntry::plain(ControlKind::Stop, |_| {}),
            HandlerEntry::plain(ControlKind::Stop, |_| {}),
            HandlerEntry::plain(ControlKind::Continue, |_| {}),
            HandlerEntry::unbound(ControlKind::NetBindAdd),
            HandlerEntry::plain(ControlKind::User(140), |_| {}),
        ]);
        assert_eq!(
            registry.accepted(),
            ControlsAccepted::STOP | ControlsAccepted::PAUSE_CONTINUE | ControlsAccepted::NETBIND_CHANGE
        );
        assert!(registry.handles(ControlKind::User(140)));
        assert!(!registry.handles(ControlKind::Pause));
    }

    #[test]
    fn empty_registry_accepts_nothing() {
        let registry: HandlerRegistry<Recorder> = HandlerRegistry::new(Vec::new());
        assert!(registry.accepted().is_empty());
    }

    #[test]
    fn each_shape_is_dispatched() {
        let registry = HandlerRegistry::new(vec![
            HandlerEntry::plain(ControlKind::ParamChange, |r: &Recorder| r.push("plain")),
            HandlerEntry::with_detail(ControlKind::ParamChange, |r: &Recorder, e| {
                r.push(format!("detail:{}", e.event_type))
            }),
            HandlerEntry::fallible(ControlKind::ParamChange, |r: &Recorder| {
                r.push("fallible");
                Ok(())
            }),
            HandlerEntry::fallible_with_detail(ControlKind::ParamChange, |r: &Recorder, e| {
                r.push(format!("fallible-detail:{:?}", e.data));
                Ok(())
            }),
        ]);
        let recorder = Recorder::default();
        let event = ControlEvent::new(9, Some(vec![1, 2]));
        registry
            .invoke_all(ControlKind::ParamChange, &recorder, &event)
            .unwrap();
        assert_eq!(
            recorder.calls(),
            vec!["plain", "detail:9", "fallible", "fallible-detail:Some([1, 2])"]
        );
    }

    #[test]
    fn first_failure_short_circuits() {
        let registry = HandlerRegistry::new(vec![
            HandlerEntry::plain(ControlKind::Stop, |r: &Recorder| r.push("first")),
            HandlerEntry::fallible(ControlKind::Stop, |_: &Recorder| {
                Err(ServiceError::handler(77, "nope"))
            }),
            HandlerEntry::plain(ControlKind::Stop, |r: &Recorder| r.push("third")),
        ]);
        let recorder = Recorder::default();
        let err = registry
            .invoke_all(ControlKind::Stop, &recorder, &ControlEvent::default())
            .unwrap_err();
        assert_eq!(err.code(), 77);
        assert_eq!(recorder.calls(), vec!["first"]);
    }

    #[test]
    fn unbound_entry_is_invalid_state() {
        let entry: HandlerEntry<Recorder> = HandlerEntry::unbound(ControlKind::Pause);
        let err = entry
            .invoke(&Recorder::default(), &ControlEvent::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }
}
