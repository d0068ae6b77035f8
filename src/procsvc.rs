//! A service that runs one child process for as long as the service runs.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use shared_child::SharedChild;

use crate::config;
use crate::error::{Result, ServiceError};
use crate::handlers::HandlerEntry;
use crate::status::{codes, ControlKind};
use crate::svc::{Service, ServiceContext};

pub struct ProcessService {
    config: config::Process,
    child: Mutex<Option<Arc<SharedChild>>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_error(err: std::io::Error) -> ServiceError {
    ServiceError::handler(
        err.raw_os_error().map(|c| c as u32).unwrap_or(codes::ERROR_GEN_FAILURE),
        err.to_string(),
    )
}

impl ProcessService {
    pub fn new(config: config::Process) -> Self {
        ProcessService {
            config,
            child: Mutex::new(None),
            waiter: Mutex::new(None),
        }
    }

    /// Pid of the running child, if any.
    pub fn child_id(&self) -> Option<u32> {
        lock(&self.child).as_ref().map(|c| c.id())
    }

    fn output_stream(config: &config::OutputStream) -> Result<Stdio> {
        match config {
            config::OutputStream::Null => Ok(Stdio::null()),
            config::OutputStream::File {
                path,
                exist_behavior,
            } => {
                let mut oo = OpenOptions::new();
                oo.write(true);
                oo.create(true);
                match exist_behavior {
                    config::ExistBehavior::Append => {
                        oo.append(true);
                    }
                    config::ExistBehavior::Truncate => {
                        oo.truncate(true);
                    }
                }
                let f = oo.open(path).map_err(spawn_error)?;
                Ok(Stdio::from(f))
            }
        }
    }

    fn command(&self, extra_args: &[OsString]) -> Result<Command> {
        let mut c = Command::new(&self.config.binary);
        c.args(&self.config.args);
        c.args(extra_args);
        c.envs(&self.config.environment);
        if let Some(wd) = &self.config.working_directory {
            fs::create_dir_all(wd).map_err(spawn_error)?;
            c.current_dir(wd);
        }
        c.stdin(Stdio::null());
        c.stdout(Self::output_stream(&self.config.stdout)?);
        c.stderr(Self::output_stream(&self.config.stderr)?);
        Ok(c)
    }

    /// Kills the child if it is still running and reaps it. A child that
    /// exited unsuccessfully on its own becomes a service-specific failure.
    fn stop_child(&self) -> Result<()> {
        let child = match lock(&self.child).take() {
            Some(child) => child,
            None => return Ok(()),
        };
        let exited_by_itself = child.try_wait().map_err(spawn_error)?.is_some();
        if !exited_by_itself {
            tracing::info!(pid = child.id(), "killing child");
            child.kill().map_err(spawn_error)?;
        }
        let status = child.wait().map_err(spawn_error)?;
        if let Some(waiter) = lock(&self.waiter).take() {
            let _ = waiter.join();
        }
        tracing::info!(pid = child.id(), %status, "child terminated");
        if exited_by_itself && !status.success() {
            let code = status.code().map(|c| c as u32).unwrap_or(codes::ERROR_GEN_FAILURE);
            return Err(ServiceError::service_specific(
                code,
                format!("child process exited with {}", status),
            ));
        }
        Ok(())
    }
}

impl Service for ProcessService {
    fn handlers() -> Vec<HandlerEntry<Self>> {
        vec![
            HandlerEntry::fallible(ControlKind::Stop, ProcessService::stop_child),
            HandlerEntry::plain(ControlKind::Shutdown, |_| {
                tracing::info!("system shutdown, stopping child")
            }),
        ]
    }

    fn start(&self, ctx: &ServiceContext, args: &[OsString]) -> Result<()> {
        let mut c = self.command(args)?;
        let child = Arc::new(SharedChild::spawn(&mut c).map_err(spawn_error)?);
        tracing::info!(pid = child.id(), binary = %self.config.binary, "child started");

        let waiter_child = child.clone();
        let ctx = ctx.clone();
        let waiter = thread::Builder::new()
            .name("svc-child-waiter".into())
            .spawn(move || {
                if let Err(err) = waiter_child.wait() {
                    tracing::error!(error = %err, "failed to wait for child");
                }
                let code = ctx.request_stop();
                tracing::debug!(code, "child exited, stop requested");
            })
            .map_err(spawn_error)?;

        *lock(&self.child) = Some(child);
        *lock(&self.waiter) = Some(waiter);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use crate::status::{ServiceState, StatusTiming};
    use crate::svc::ServiceHost;
    use std::time::Duration;

    fn timing() -> StatusTiming {
        StatusTiming {
            checkpoint_interval: Duration::from_millis(20),
            start_wait_hint: Duration::from_millis(500),
            pending_wait_hint: Duration::from_millis(500),
        }
    }

    fn harness(binary: &str, args: &[&str]) -> Harness<ProcessService> {
        let config = config::Process {
            binary: binary.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let host = ServiceHost::builder(ProcessService::new(config))
            .timing(timing())
            .build();
        Harness::new(host)
    }

    #[test]
    fn stop_kills_a_long_running_child() {
        let mut h = harness("sleep", &["30"]);
        h.start("sleeper", Vec::<OsString>::new()).unwrap();
        assert!(h.host().service().child_id().is_some());
        h.stop().unwrap();
        assert_eq!(h.status().unwrap().state, ServiceState::Stopped);
        assert!(h.host().service().child_id().is_none());
    }

    #[test]
    fn child_exit_stops_the_service() {
        let mut h = harness("true", &[]);
        h.start("oneshot", Vec::<OsString>::new()).unwrap();
        let status = h.wait_for_exit(Duration::from_secs(10)).unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(!status.is_failure());
    }

    #[test]
    fn failing_child_is_a_service_specific_exit() {
        let mut h = harness("sh", &["-c", "exit 3"]);
        h.start("failing", Vec::<OsString>::new()).unwrap();
        let status = h.wait_for_exit(Duration::from_secs(10)).unwrap();
        assert_eq!(status.win32_exit_code, codes::ERROR_SERVICE_SPECIFIC_ERROR);
        assert_eq!(status.service_specific_exit_code, 3);
    }

    #[test]
    fn missing_binary_fails_the_start() {
        let mut h = harness("/nonexistent/svcctl-child", &[]);
        let err = h.start("missing", Vec::<OsString>::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Exited { .. }));
        assert!(!h.states().contains(&ServiceState::Running));
    }

    #[test]
    fn run_arguments_follow_configured_ones() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let config = config::Process {
            binary: "sh".into(),
            args: vec!["-c".into(), "echo \"$0 $1\"".into()],
            stdout: config::OutputStream::File {
                path: out.clone(),
                exist_behavior: config::ExistBehavior::Truncate,
            },
            ..Default::default()
        };
        let host = ServiceHost::builder(ProcessService::new(config))
            .timing(timing())
            .build();
        let mut h = Harness::new(host);
        h.start("echo", ["first", "second"]).unwrap();
        h.wait_for_exit(Duration::from_secs(10)).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap().trim(), "first second");
    }
}
