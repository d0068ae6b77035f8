use std::ffi::OsString;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use svcctl::config::Config;
use svcctl::procsvc::ProcessService;
use svcctl::{codes, logging, ControlKind, Harness, ServiceError, ServiceHost, ServiceState};

#[derive(clap::Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Register a service to run
    Register {
        /// Path to the service config file
        config: PathBuf,
    },
    /// Remove a registered service
    Unregister {
        /// Path to the service config file
        config: PathBuf,
    },
    /// Run a service
    #[command(hide = true)]
    Run {
        /// Path to the service config file
        config: PathBuf,
    },
    /// Run a service in the foreground, reading controls from stdin
    Debug {
        /// Path to the service config file
        config: PathBuf,
    },
    /// Interact with config files
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommand {
    /// Output a config file with default settings
    Default,
}

fn build_host(config: &Config) -> ServiceHost<ProcessService> {
    let builder = ServiceHost::builder(ProcessService::new(config.process.clone()))
        .timing(config.lifecycle);
    #[cfg(windows)]
    let builder = builder.participant(svcctl::jobobjects::JobObjectParticipant::new(
        config.job_object.as_ref(),
    ));
    builder.build()
}

#[cfg(windows)]
fn register_service(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let config_path = std::fs::canonicalize(config_path)
        .with_context(|| format!("failed to resolve {}", config_path.display()))?;
    let exe = std::env::current_exe().context("failed to locate svcctl executable")?;
    svcctl::service_control::register(
        &config.registration.name,
        &config.registration.display_name,
        config.registration.description.as_deref(),
        exe,
        vec![OsString::from("run"), config_path.into_os_string()],
    )?;
    println!("registered {}", config.registration.name);
    Ok(())
}

#[cfg(windows)]
fn unregister_service(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    svcctl::service_control::unregister(&config.registration.name)?;
    println!("unregistered {}", config.registration.name);
    Ok(())
}

#[cfg(windows)]
fn run_service(config_path: &Path) -> Result<()> {
    use std::sync::Arc;
    use svcctl::{ServiceEntry, ServiceTable, ServiceType};

    let config = Config::load(config_path)?;
    logging::init(&config.logging)?;
    tracing::info!(config = %config_path.display(), "starting service dispatcher");
    let host = Arc::new(build_host(&config));
    let mut table = ServiceTable::new();
    table.add(
        config.registration.name.clone(),
        ServiceEntry::new(ServiceType::OwnProcess, host),
    )?;
    svcctl::service_control::start(table)
}

#[cfg(not(windows))]
fn register_service(_config_path: &Path) -> Result<()> {
    anyhow::bail!("register requires the Windows service control manager")
}

#[cfg(not(windows))]
fn unregister_service(_config_path: &Path) -> Result<()> {
    anyhow::bail!("unregister requires the Windows service control manager")
}

#[cfg(not(windows))]
fn run_service(_config_path: &Path) -> Result<()> {
    anyhow::bail!("run requires the Windows service control manager; use debug instead")
}

fn parse_control(line: &str) -> Option<ControlKind> {
    match line.trim().to_ascii_lowercase().as_str() {
        "stop" => Some(ControlKind::Stop),
        "pause" => Some(ControlKind::Pause),
        "continue" | "resume" => Some(ControlKind::Continue),
        "interrogate" => Some(ControlKind::Interrogate),
        "paramchange" => Some(ControlKind::ParamChange),
        "shutdown" => Some(ControlKind::Shutdown),
        _ => None,
    }
}

fn debug_service(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    logging::init(&config.logging)?;
    let name = config.registration.name.clone();
    let mut harness = Harness::new(build_host(&config));
    harness.start(&name, Vec::<OsString>::new())?;
    tracing::info!(service = %name, "running; enter stop, pause or continue");

    let (tx, lines) = crossbeam_channel::unbounded::<String>();
    thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .context("failed to spawn stdin reader")?;

    let mut lines = lines;
    loop {
        let input = crossbeam_channel::select! {
            recv(lines) -> line => Some(line),
            default(Duration::from_millis(200)) => None,
        };
        match input {
            Some(Ok(line)) => match parse_control(&line) {
                Some(kind) => {
                    let code = harness.send_control(kind);
                    if code == codes::NO_ERROR {
                        tracing::info!(control = %kind, "control accepted");
                    } else {
                        tracing::warn!(control = %kind, code, "control rejected");
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::warn!(input = %line.trim(), "unknown control"),
            },
            Some(Err(_)) => {
                // Stdin closed: treat it as a stop request once.
                lines = crossbeam_channel::never();
                harness.send_control(ControlKind::Stop);
            }
            None => {}
        }
        if harness.status().map(|s| s.state) == Some(ServiceState::Stopped) {
            break;
        }
    }

    let status = harness
        .wait_for_exit(Duration::from_secs(30))
        .context("service did not finish")?;
    match ServiceError::from_exit_codes(status.win32_exit_code, status.service_specific_exit_code) {
        Some(err) => Err(err).context(format!("service {} failed", name)),
        None => {
            tracing::info!(service = %name, "service stopped");
            Ok(())
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Register { config } => register_service(&config),
        Command::Unregister { config } => unregister_service(&config),
        Command::Run { config } => run_service(&config),
        Command::Debug { config } => debug_service(&config),
        Command::Config { command } => match command {
            ConfigCommand::Default => {
                println!("{}", Config::default_toml()?);
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn controls_parse_case_insensitively() {
        assert_eq!(parse_control("STOP\n"), Some(ControlKind::Stop));
        assert_eq!(parse_control(" resume "), Some(ControlKind::Continue));
        assert_eq!(parse_control("reboot"), None);
    }

    #[test]
    fn debug_takes_a_config_path() {
        let cli = Cli::try_parse_from(["svcctl", "debug", "svc.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Debug { config } if config == Path::new("svc.toml")));
    }
}
