use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// Win32 result and exit codes used by the control and status paths.
pub mod codes {
    pub const NO_ERROR: u32 = 0;
    pub const ERROR_GEN_FAILURE: u32 = 31;
    pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
    pub const ERROR_INVALID_NAME: u32 = 123;
    pub const ERROR_INVALID_SERVICE_CONTROL: u32 = 1052;
    pub const ERROR_SERVICE_REQUEST_TIMEOUT: u32 = 1053;
    pub const ERROR_SERVICE_CANNOT_ACCEPT_CTRL: u32 = 1061;
    pub const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;
    pub const ERROR_EXCEPTION_IN_SERVICE: u32 = 1064;
    pub const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;
    pub const ERROR_INVALID_STATE: u32 = 5023;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    pub fn raw(self) -> u32 {
        match self {
            Self::Stopped => 1,
            Self::StartPending => 2,
            Self::StopPending => 3,
            Self::Running => 4,
            Self::ContinuePending => 5,
            Self::PausePending => 6,
            Self::Paused => 7,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::StartPending | Self::StopPending | Self::ContinuePending | Self::PausePending
        )
    }

    /// The steady state a transition through `self` is heading for.
    pub fn target(self) -> ServiceState {
        match self {
            Self::StopPending | Self::Stopped => Self::Stopped,
            Self::PausePending | Self::Paused => Self::Paused,
            Self::ContinuePending | Self::Running => Self::Running,
            Self::StartPending => Self::StartPending,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::StartPending => "start-pending",
            Self::StopPending => "stop-pending",
            Self::Running => "running",
            Self::ContinuePending => "continue-pending",
            Self::PausePending => "pause-pending",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// A request category a service may receive from its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Stop,
    Pause,
    Continue,
    Interrogate,
    Shutdown,
    ParamChange,
    NetBindAdd,
    NetBindRemove,
    NetBindEnable,
    NetBindDisable,
    DeviceEvent,
    HardwareProfileChange,
    PowerEvent,
    SessionChange,
    Preshutdown,
    TimeChange,
    TriggerEvent,
    /// Service-defined control in the range 128..=255.
    User(u8),
}

impl ControlKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        let kind = match raw {
            1 => Self::Stop,
            2 => Self::Pause,
            3 => Self::Continue,
            4 => Self::Interrogate,
            5 => Self::Shutdown,
            6 => Self::ParamChange,
            7 => Self::NetBindAdd,
            8 => Self::NetBindRemove,
            9 => Self::NetBindEnable,
            10 => Self::NetBindDisable,
            11 => Self::DeviceEvent,
            12 => Self::HardwareProfileChange,
            13 => Self::PowerEvent,
            14 => Self::SessionChange,
            15 => Self::Preshutdown,
            16 => Self::TimeChange,
            32 => Self::TriggerEvent,
            128..=255 => Self::User(raw as u8),
            _ => return None,
        };
        Some(kind)
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Stop => 1,
            Self::Pause => 2,
            Self::Continue => 3,
            Self::Interrogate => 4,
            Self::Shutdown => 5,
            Self::ParamChange => 6,
            Self::NetBindAdd => 7,
            Self::NetBindRemove => 8,
            Self::NetBindEnable => 9,
            Self::NetBindDisable => 10,
            Self::DeviceEvent => 11,
            Self::HardwareProfileChange => 12,
            Self::PowerEvent => 13,
            Self::SessionChange => 14,
            Self::Preshutdown => 15,
            Self::TimeChange => 16,
            Self::TriggerEvent => 32,
            Self::User(code) => u32::from(code),
        }
    }

    /// The accept bit a handler for this kind contributes to the mask.
    /// Interrogate, device events and user controls have none.
    pub fn accept_bit(self) -> ControlsAccepted {
        match self {
            Self::Stop => ControlsAccepted::STOP,
            Self::Pause | Self::Continue => ControlsAccepted::PAUSE_CONTINUE,
            Self::Shutdown => ControlsAccepted::SHUTDOWN,
            Self::ParamChange => ControlsAccepted::PARAM_CHANGE,
            Self::NetBindAdd | Self::NetBindRemove | Self::NetBindEnable | Self::NetBindDisable => {
                ControlsAccepted::NETBIND_CHANGE
            }
            Self::HardwareProfileChange => ControlsAccepted::HARDWARE_PROFILE_CHANGE,
            Self::PowerEvent => ControlsAccepted::POWER_EVENT,
            Self::SessionChange => ControlsAccepted::SESSION_CHANGE,
            Self::Preshutdown => ControlsAccepted::PRESHUTDOWN,
            Self::TimeChange => ControlsAccepted::TIME_CHANGE,
            Self::TriggerEvent => ControlsAccepted::TRIGGER_EVENT,
            Self::Interrogate | Self::DeviceEvent | Self::User(_) => ControlsAccepted::empty(),
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(code) => write!(f, "user({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Mask of control kinds the service declares it will respond to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlsAccepted(u32);

impl ControlsAccepted {
    pub const STOP: Self = Self(0x1);
    pub const PAUSE_CONTINUE: Self = Self(0x2);
    pub const SHUTDOWN: Self = Self(0x4);
    pub const PARAM_CHANGE: Self = Self(0x8);
    pub const NETBIND_CHANGE: Self = Self(0x10);
    pub const HARDWARE_PROFILE_CHANGE: Self = Self(0x20);
    pub const POWER_EVENT: Self = Self(0x40);
    pub const SESSION_CHANGE: Self = Self(0x80);
    pub const PRESHUTDOWN: Self = Self(0x100);
    pub const TIME_CHANGE: Self = Self(0x200);
    pub const TRIGGER_EVENT: Self = Self(0x400);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set. The empty mask is never contained.
    pub fn contains(self, other: Self) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }
}

impl BitOr for ControlsAccepted {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ControlsAccepted {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Detail attached to a control request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlEvent {
    pub event_type: u32,
    pub data: Option<Vec<u8>>,
}

impl ControlEvent {
    pub fn new(event_type: u32, data: Option<Vec<u8>>) -> Self {
        ControlEvent { event_type, data }
    }
}

/// Process kind a service is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    OwnProcess,
    ShareProcess,
}

/// One fully-formed status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub controls_accepted: ControlsAccepted,
    pub win32_exit_code: u32,
    pub service_specific_exit_code: u32,
    pub checkpoint: u32,
    pub wait_hint: Duration,
}

impl ServiceStatus {
    pub fn stopped() -> Self {
        ServiceStatus {
            state: ServiceState::Stopped,
            controls_accepted: ControlsAccepted::empty(),
            win32_exit_code: codes::NO_ERROR,
            service_specific_exit_code: codes::NO_ERROR,
            checkpoint: 0,
            wait_hint: Duration::ZERO,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.win32_exit_code != codes::NO_ERROR || self.service_specific_exit_code != codes::NO_ERROR
    }
}

/// Checkpoint cadence and wait hints for pending states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusTiming {
    #[serde(rename = "checkpoint_interval_ms", with = "millis")]
    pub checkpoint_interval: Duration,
    #[serde(rename = "start_wait_hint_ms", with = "millis")]
    pub start_wait_hint: Duration,
    #[serde(rename = "pending_wait_hint_ms", with = "millis")]
    pub pending_wait_hint: Duration,
}

impl StatusTiming {
    pub fn wait_hint(&self, state: ServiceState) -> Duration {
        match state {
            ServiceState::StartPending => self.start_wait_hint,
            s if s.is_pending() => self.pending_wait_hint,
            _ => Duration::ZERO,
        }
    }
}

impl Default for StatusTiming {
    fn default() -> Self {
        StatusTiming {
            checkpoint_interval: Duration::from_secs(1),
            start_wait_hint: Duration::from_secs(10),
            pending_wait_hint: Duration::from_secs(5),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
