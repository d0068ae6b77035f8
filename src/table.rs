use std::collections::BTreeMap;
use std::ffi::OsString;
use std::sync::Arc;

use crate::error::{Result, ServiceError};
use crate::gensvc::Supervisor;
use crate::status::{ServiceStatus, ServiceType};
use crate::svc::{Service, ServiceHost};

type Runner = Box<dyn Fn(&dyn Supervisor, &str, Vec<OsString>) -> Result<ServiceStatus> + Send + Sync>;

pub struct ServiceEntry {
    service_type: ServiceType,
    runner: Runner,
}

impl ServiceEntry {
    pub fn new<S: Service>(service_type: ServiceType, host: Arc<ServiceHost<S>>) -> Self {
        ServiceEntry {
            service_type,
            runner: Box::new(move |supervisor: &dyn Supervisor, name: &str, args: Vec<OsString>| {
                host.run(supervisor, name, service_type, args)
            }),
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }
}

#[derive(Default)]
pub struct ServiceTable {
    entries: BTreeMap<String, ServiceEntry>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, entry: ServiceEntry) -> Result<&mut Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServiceError::Registration(
                "service name must not be empty".into(),
            ));
        }
        if self.entries.contains_key(&name) {
            return Err(ServiceError::Registration(format!(
                "service {} is already in the table",
                name
            )));
        }
        self.entries.insert(name, entry);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    /// Runs the named service to completion under `supervisor`.
    pub fn run(&self, name: &str, supervisor: &dyn Supervisor, args: Vec<OsString>) -> Result<ServiceStatus> {
        let entry = self
            .get(name)
            .ok_or_else(|| ServiceError::Registration(format!("no service named {}", name)))?;
        tracing::info!(name, ?entry.service_type, "dispatching service");
        (entry.runner)(supervisor, name, args)
    }
}
