//! Run ordinary processes as managed services.
//!
//! The lifecycle machine in [`svc`] is independent of the supervisor driving
//! it. On Windows, [`service_control`] binds it to the service control
//! manager; everywhere, [`harness`] drives it in-process.

pub mod config;
pub mod error;
pub mod gensvc;
pub mod handlers;
pub mod harness;
#[cfg(windows)]
pub mod jobobjects;
pub mod logging;
pub mod participant;
pub mod procsvc;
pub mod reporter;
#[cfg(windows)]
pub mod service_control;
pub mod status;
pub mod svc;
pub mod table;

pub use error::{Result, ServiceError};
pub use gensvc::{ControlCallback, StatusReporter, Supervisor};
pub use handlers::{HandlerEntry, HandlerRegistry};
pub use harness::{Harness, LocalSupervisor};
pub use participant::{Participant, ParticipantChain};
pub use status::{
    codes, ControlEvent, ControlKind, ControlsAccepted, ServiceState, ServiceStatus, ServiceType,
    StatusTiming,
};
pub use svc::{ControlOutcome, Service, ServiceContext, ServiceHost, ServiceHostBuilder};
pub use table::{ServiceEntry, ServiceTable};
