use std::sync::{Mutex, PoisonError};

use winapi::{
    shared::minwindef,
    shared::ntdef,
    um::{handleapi, jobapi2, minwinbase, processthreadsapi, winbase, winnt},
};

use crate::config;
use crate::error::{Result, ServiceError};
use crate::participant::Participant;

fn priority_class(class: config::PriorityClass) -> u32 {
    match class {
        config::PriorityClass::Idle => winbase::IDLE_PRIORITY_CLASS,
        config::PriorityClass::BelowNormal => winbase::BELOW_NORMAL_PRIORITY_CLASS,
        config::PriorityClass::Normal => winbase::NORMAL_PRIORITY_CLASS,
        config::PriorityClass::AboveNormal => winbase::ABOVE_NORMAL_PRIORITY_CLASS,
        config::PriorityClass::High => winbase::HIGH_PRIORITY_CLASS,
        config::PriorityClass::Realtime => winbase::REALTIME_PRIORITY_CLASS,
    }
}

fn os_error(err: std::io::Error) -> ServiceError {
    ServiceError::handler(err.raw_os_error().unwrap_or(0) as u32, err.to_string())
}

pub struct ExtendedLimitInformation(winnt::JOBOBJECT_EXTENDED_LIMIT_INFORMATION);

impl ExtendedLimitInformation {
    pub fn new() -> Self {
        ExtendedLimitInformation(Default::default())
    }

    pub fn set_kill_on_close(&mut self) -> &mut Self {
        self.0.BasicLimitInformation.LimitFlags |= winnt::JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        self
    }

    pub fn set_priority_class(&mut self, class: config::PriorityClass) -> &mut Self {
        self.0.BasicLimitInformation.PriorityClass = priority_class(class);
        self.0.BasicLimitInformation.LimitFlags |= winnt::JOB_OBJECT_LIMIT_PRIORITY_CLASS;
        self
    }
}

pub struct JobObject {
    handle: ntdef::HANDLE,
}

// The handle is owned exclusively and only closed once, in Drop.
unsafe impl Send for JobObject {}

impl JobObject {
    pub fn new() -> std::io::Result<Self> {
        let handle = unsafe {
            jobapi2::CreateJobObjectW(0 as minwinbase::LPSECURITY_ATTRIBUTES, 0 as ntdef::LPCWSTR)
        };
        if handle == 0 as ntdef::HANDLE {
            return Err(std::io::Error::last_os_error());
        }
        Ok(JobObject { handle })
    }

    pub fn set_extended_limits(&self, mut limits: ExtendedLimitInformation) -> std::io::Result<()> {
        let result = unsafe {
            jobapi2::SetInformationJobObject(
                self.handle,
                winnt::JobObjectExtendedLimitInformation,
                &mut limits.0 as *mut _ as minwindef::LPVOID,
                std::mem::size_of_val(&limits.0) as u32,
            )
        };
        if result == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add_self(&self) -> std::io::Result<()> {
        let result = unsafe {
            jobapi2::AssignProcessToJobObject(self.handle, processthreadsapi::GetCurrentProcess())
        };
        if result == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for JobObject {
    fn drop(&mut self) {
        unsafe { handleapi::CloseHandle(self.handle) };
    }
}

/// Creates the job when the service first starts. The job is kept open for
/// the life of the process: closing it would kill the service itself.
pub struct JobObjectParticipant {
    priority_class: Option<config::PriorityClass>,
    job: Mutex<Option<JobObject>>,
}

impl JobObjectParticipant {
    pub fn new(config: Option<&config::JobObject>) -> Self {
        JobObjectParticipant {
            priority_class: config.and_then(|c| c.priority_class),
            job: Mutex::new(None),
        }
    }
}

impl Participant for JobObjectParticipant {
    fn name(&self) -> &str {
        "job-object"
    }

    fn on_start(&self, _args: &[std::ffi::OsString]) -> Result<()> {
        let mut slot = self.job.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let job = JobObject::new().map_err(os_error)?;
        let mut limits = ExtendedLimitInformation::new();
        limits.set_kill_on_close();
        if let Some(class) = self.priority_class {
            limits.set_priority_class(class);
        }
        job.set_extended_limits(limits).map_err(os_error)?;
        job.add_self().map_err(os_error)?;
        tracing::debug!("service process assigned to job object");
        *slot = Some(job);
        Ok(())
    }
}
