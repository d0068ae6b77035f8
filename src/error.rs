use crate::status::{codes, ServiceState};
use thiserror::Error;

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("control handler registration failed: {0}")]
    Registration(String),

    #[error("control rejected with code {code}")]
    InvalidControl { code: u32 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("status report failed ({code}): {message}")]
    Report { code: u32, message: String },

    #[error("handler failed ({code}): {message}")]
    Handler { code: u32, message: String },

    #[error("service-specific failure ({code}): {message}")]
    ServiceSpecific { code: u32, message: String },

    #[error("service panicked: {0}")]
    Panicked(String),

    /// A failure captured by the checkpoint worker of an earlier pending state.
    #[error("checkpoint report failed: {0}")]
    Checkpoint(#[source] Box<ServiceError>),

    #[error("timed out waiting for the service to reach {state}")]
    Timeout { state: ServiceState },

    #[error("service stopped with exit code {win32_exit_code} (service-specific {service_specific_exit_code})")]
    Exited {
        win32_exit_code: u32,
        service_specific_exit_code: u32,
    },
}

impl ServiceError {
    pub fn handler(code: u32, message: impl Into<String>) -> Self {
        ServiceError::Handler {
            code,
            message: message.into(),
        }
    }

    pub fn service_specific(code: u32, message: impl Into<String>) -> Self {
        ServiceError::ServiceSpecific {
            code,
            message: message.into(),
        }
    }

    pub fn report(code: u32, message: impl Into<String>) -> Self {
        ServiceError::Report {
            code,
            message: message.into(),
        }
    }

    /// Win32 code this error is reported as, either as a control result or
    /// as the exit code of the final `Stopped` status.
    pub fn code(&self) -> u32 {
        match self {
            Self::Registration(_) => codes::ERROR_INVALID_NAME,
            Self::InvalidControl { code } => *code,
            Self::InvalidState(_) => codes::ERROR_INVALID_STATE,
            Self::Report { code, .. } | Self::Handler { code, .. } => nonzero(*code),
            Self::ServiceSpecific { .. } => codes::ERROR_SERVICE_SPECIFIC_ERROR,
            Self::Panicked(_) => codes::ERROR_EXCEPTION_IN_SERVICE,
            Self::Checkpoint(inner) => inner.code(),
            Self::Timeout { .. } => codes::ERROR_SERVICE_REQUEST_TIMEOUT,
            Self::Exited {
                win32_exit_code, ..
            } => *win32_exit_code,
        }
    }

    pub fn service_specific_code(&self) -> u32 {
        match self {
            Self::ServiceSpecific { code, .. } => *code,
            Self::Exited {
                service_specific_exit_code,
                ..
            } => *service_specific_exit_code,
            Self::Checkpoint(inner) => inner.service_specific_code(),
            _ => codes::NO_ERROR,
        }
    }

    /// Rebuilds the error a stopped service's exit codes describe, if any.
    pub fn from_exit_codes(win32_exit_code: u32, service_specific_exit_code: u32) -> Option<Self> {
        if win32_exit_code == codes::NO_ERROR && service_specific_exit_code == codes::NO_ERROR {
            return None;
        }
        Some(ServiceError::Exited {
            win32_exit_code,
            service_specific_exit_code,
        })
    }
}

// A failure must never be reported as success.
fn nonzero(code: u32) -> u32 {
    if code == codes::NO_ERROR {
        codes::ERROR_GEN_FAILURE
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_code_is_carried_through() {
        let e = ServiceError::handler(42, "boom");
        assert_eq!(e.code(), 42);
        assert_eq!(e.service_specific_code(), 0);
        assert_eq!(e.to_string(), "handler failed (42): boom");
    }

    #[test]
    fn zero_code_failures_become_generic_failures() {
        assert_eq!(ServiceError::handler(0, "x").code(), codes::ERROR_GEN_FAILURE);
        assert_eq!(ServiceError::report(0, "x").code(), codes::ERROR_GEN_FAILURE);
    }

    #[test]
    fn service_specific_errors_use_the_specific_exit_code() {
        let e = ServiceError::service_specific(7, "child exited");
        assert_eq!(e.code(), codes::ERROR_SERVICE_SPECIFIC_ERROR);
        assert_eq!(e.service_specific_code(), 7);
    }

    #[test]
    fn checkpoint_failures_keep_the_inner_codes() {
        let e = ServiceError::Checkpoint(Box::new(ServiceError::report(6, "handle closed")));
        assert_eq!(e.code(), 6);
        assert_eq!(e.service_specific_code(), 0);
        assert_eq!(
            e.to_string(),
            "checkpoint report failed: status report failed (6): handle closed"
        );
    }

    #[test]
    fn exit_codes_round_trip_into_errors() {
        assert!(ServiceError::from_exit_codes(0, 0).is_none());
        let e = ServiceError::from_exit_codes(1066, 3).unwrap();
        assert_eq!(e.code(), 1066);
        assert_eq!(e.service_specific_code(), 3);
    }
}
