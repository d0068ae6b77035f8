use std::sync::Arc;

use crate::error::Result;
use crate::status::{ControlEvent, ServiceStatus, ServiceType};

/// Invoked by the supervisor for each control request: `(raw control code,
/// event detail) -> result code`. Must return quickly; the machine only flips
/// a signal here.
pub type ControlCallback = Box<dyn Fn(u32, ControlEvent) -> u32 + Send + Sync>;

pub trait Supervisor {
    /// Registers `callback` as the control handler for `name` and returns the
    /// handle status reports are sent through.
    fn register(
        &self,
        name: &str,
        service_type: ServiceType,
        callback: ControlCallback,
    ) -> Result<Arc<dyn StatusReporter>>;
}

pub trait StatusReporter: Send + Sync {
    fn report(&self, status: &ServiceStatus) -> Result<()>;
}
