//! Binding to the Windows service control manager.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use windows_service::define_windows_service;
use windows_service::service::{
    ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
    ServiceInfo, ServiceStartType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle};
use windows_service::service_dispatcher;
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

use crate::error::ServiceError;
use crate::gensvc::{ControlCallback, StatusReporter, Supervisor};
use crate::status::{codes, ControlEvent, ControlKind, ServiceState, ServiceStatus, ServiceType};
use crate::table::ServiceTable;

define_windows_service!(ffi_service_main, service_main);

/// Stores the services this process can run while the dispatcher owns the
/// main thread.
static SERVICE_TABLE: OnceCell<ServiceTable> = OnceCell::new();

fn service_main(mut args: Vec<OsString>) {
    let table = match SERVICE_TABLE.get() {
        Some(table) => table,
        None => return,
    };
    // The SCM passes the service name as the first argument.
    let name = if args.is_empty() {
        table.names().next().map(str::to_string)
    } else {
        Some(args.remove(0).to_string_lossy().into_owned())
    };
    let name = match name {
        Some(name) => name,
        None => return,
    };
    match table.run(&name, &ScmSupervisor, args) {
        Ok(status) => tracing::info!(
            exit_code = status.win32_exit_code,
            service_exit_code = status.service_specific_exit_code,
            "service run finished"
        ),
        Err(err) => tracing::error!(error = %err, "service run failed"),
    }
}

/// Runs the SCM dispatcher for `table`. Blocks until the service stops.
pub fn start(table: ServiceTable) -> Result<()> {
    if table.len() != 1 {
        anyhow::bail!("service table must contain a single entry");
    }
    let name = table
        .names()
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("service table is empty"))?;
    SERVICE_TABLE
        .set(table)
        .map_err(|_e| anyhow::anyhow!("a service has already been started"))?;
    service_dispatcher::start(name, ffi_service_main).map_err(anyhow::Error::from)
}

pub fn register(
    name: &str,
    display_name: &str,
    description: Option<&str>,
    exe: std::path::PathBuf,
    args: Vec<OsString>,
) -> Result<()> {
    let scm = ServiceManager::local_computer(
        None::<&str>,
        ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
    )?;
    let info = ServiceInfo {
        name: OsString::from(name),
        display_name: OsString::from(display_name),
        service_type: windows_service::service::ServiceType::OWN_PROCESS,
        start_type: ServiceStartType::AutoStart,
        error_control: ServiceErrorControl::Normal,
        executable_path: exe,
        launch_arguments: args,
        dependencies: vec![],
        account_name: None,
        account_password: None,
    };
    let service = scm.create_service(&info, ServiceAccess::CHANGE_CONFIG)?;
    if let Some(desc) = description {
        service.set_description(desc)?;
    }
    Ok(())
}

pub fn unregister(name: &str) -> Result<()> {
    let scm = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
    let service = scm.open_service(name, ServiceAccess::DELETE)?;
    service.delete()?;
    Ok(())
}

fn translate(control: &ServiceControl) -> Option<ControlKind> {
    let kind = match control {
        ServiceControl::Continue => ControlKind::Continue,
        ServiceControl::Interrogate => ControlKind::Interrogate,
        ServiceControl::NetBindAdd => ControlKind::NetBindAdd,
        ServiceControl::NetBindDisable => ControlKind::NetBindDisable,
        ServiceControl::NetBindEnable => ControlKind::NetBindEnable,
        ServiceControl::NetBindRemove => ControlKind::NetBindRemove,
        ServiceControl::ParamChange => ControlKind::ParamChange,
        ServiceControl::Pause => ControlKind::Pause,
        ServiceControl::Preshutdown => ControlKind::Preshutdown,
        ServiceControl::Shutdown => ControlKind::Shutdown,
        ServiceControl::Stop => ControlKind::Stop,
        _ => return None,
    };
    Some(kind)
}

fn handler_result(code: u32) -> ServiceControlHandlerResult {
    match code {
        codes::NO_ERROR => ServiceControlHandlerResult::NoError,
        codes::ERROR_CALL_NOT_IMPLEMENTED => ServiceControlHandlerResult::NotImplemented,
        code => ServiceControlHandlerResult::Other(code),
    }
}

fn scm_state(state: ServiceState) -> windows_service::service::ServiceState {
    use windows_service::service::ServiceState as Scm;
    match state {
        ServiceState::Stopped => Scm::Stopped,
        ServiceState::StartPending => Scm::StartPending,
        ServiceState::StopPending => Scm::StopPending,
        ServiceState::Running => Scm::Running,
        ServiceState::ContinuePending => Scm::ContinuePending,
        ServiceState::PausePending => Scm::PausePending,
        ServiceState::Paused => Scm::Paused,
    }
}

fn scm_type(service_type: ServiceType) -> windows_service::service::ServiceType {
    match service_type {
        ServiceType::OwnProcess => windows_service::service::ServiceType::OWN_PROCESS,
        ServiceType::ShareProcess => windows_service::service::ServiceType::SHARE_PROCESS,
    }
}

fn error_code(err: &windows_service::Error) -> u32 {
    match err {
        windows_service::Error::Winapi(io) => io
            .raw_os_error()
            .map(|c| c as u32)
            .unwrap_or(codes::ERROR_GEN_FAILURE),
        _ => codes::ERROR_GEN_FAILURE,
    }
}

pub struct ScmSupervisor;

impl Supervisor for ScmSupervisor {
    fn register(
        &self,
        name: &str,
        service_type: ServiceType,
        callback: ControlCallback,
    ) -> crate::error::Result<Arc<dyn StatusReporter>> {
        let handle = service_control_handler::register(name, move |control| {
            match translate(&control) {
                Some(kind) => handler_result(callback(kind.raw(), ControlEvent::default())),
                None => ServiceControlHandlerResult::NotImplemented,
            }
        })
        .map_err(|err| ServiceError::Registration(err.to_string()))?;
        Ok(Arc::new(ScmReporter {
            handle,
            service_type: scm_type(service_type),
        }))
    }
}

struct ScmReporter {
    handle: ServiceStatusHandle,
    service_type: windows_service::service::ServiceType,
}

impl StatusReporter for ScmReporter {
    fn report(&self, status: &ServiceStatus) -> crate::error::Result<()> {
        let exit_code = if status.service_specific_exit_code != codes::NO_ERROR {
            ServiceExitCode::ServiceSpecific(status.service_specific_exit_code)
        } else {
            ServiceExitCode::Win32(status.win32_exit_code)
        };
        self.handle
            .set_service_status(windows_service::service::ServiceStatus {
                service_type: self.service_type,
                current_state: scm_state(status.state),
                controls_accepted: ServiceControlAccept::from_bits_truncate(
                    status.controls_accepted.bits(),
                ),
                exit_code,
                checkpoint: status.checkpoint,
                wait_hint: status.wait_hint,
                process_id: None,
            })
            .map_err(|err| ServiceError::report(error_code(&err), err.to_string()))
    }
}
