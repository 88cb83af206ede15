use async_trait::async_trait;
use keel_core::Args;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, ActionContext, optional_str, optional_u64, required_str};
use crate::error::ActionError;
use crate::supervisor::{Supervisor, unit_for_service};
use crate::version::VersionMarkers;

/// Unit from `unit`, or derived from `service`.
fn unit_arg(args: &Args) -> Result<String, ActionError> {
    if let Some(unit) = optional_str(args, "unit") {
        return Ok(unit.to_string());
    }
    match optional_str(args, "service") {
        Some(service) => Ok(unit_for_service(service)),
        None => Err(ActionError::invalid("unit or service is required")),
    }
}

/// Passes when the unit is active.
pub struct ServiceActive {
    supervisor: Arc<dyn Supervisor>,
}

impl ServiceActive {
    pub fn new(supervisor: Arc<dyn Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Action for ServiceActive {
    fn name(&self) -> &str {
        "service.active"
    }

    fn validate(&self, args: &Args) -> Result<(), ActionError> {
        unit_arg(args).map(|_| ())
    }

    async fn apply(&self, _ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let unit = unit_arg(args)?;
        if self.supervisor.is_active(&unit).await? {
            Ok(format!("{unit} active"))
        } else {
            Err(ActionError::failed(format!("{unit} not active")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerb {
    Start,
    Stop,
    Restart,
}

/// `service.start`, `service.stop` and `service.restart`.
///
/// Start and restart accept `wait_ms` to block until the unit reports active.
pub struct ServiceControl {
    verb: ServiceVerb,
    name: &'static str,
    supervisor: Arc<dyn Supervisor>,
}

impl ServiceControl {
    pub fn new(verb: ServiceVerb, supervisor: Arc<dyn Supervisor>) -> Self {
        let name = match verb {
            ServiceVerb::Start => "service.start",
            ServiceVerb::Stop => "service.stop",
            ServiceVerb::Restart => "service.restart",
        };
        Self {
            verb,
            name,
            supervisor,
        }
    }
}

#[async_trait]
impl Action for ServiceControl {
    fn name(&self) -> &str {
        self.name
    }

    fn validate(&self, args: &Args) -> Result<(), ActionError> {
        unit_arg(args)?;
        optional_u64(args, "wait_ms")?;
        Ok(())
    }

    async fn apply(&self, ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let unit = unit_arg(args)?;
        match self.verb {
            ServiceVerb::Start => self.supervisor.start(&unit).await?,
            ServiceVerb::Stop => self.supervisor.stop(&unit).await?,
            ServiceVerb::Restart => self.supervisor.restart(&unit).await?,
        }
        if self.verb != ServiceVerb::Stop {
            if let Some(wait_ms) = optional_u64(args, "wait_ms")? {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(ActionError::Cancelled),
                    res = self.supervisor.wait_active(&unit, Duration::from_millis(wait_ms)) => res?,
                }
            }
        }
        let verb = match self.verb {
            ServiceVerb::Start => "started",
            ServiceVerb::Stop => "stopped",
            ServiceVerb::Restart => "restarted",
        };
        Ok(format!("{unit} {verb}"))
    }
}

/// Passes when the service's version marker equals `version`.
pub struct ServiceVersion {
    markers: VersionMarkers,
}

impl ServiceVersion {
    pub fn new(markers: VersionMarkers) -> Self {
        Self { markers }
    }
}

#[async_trait]
impl Action for ServiceVersion {
    fn name(&self) -> &str {
        "service.version"
    }

    fn validate(&self, args: &Args) -> Result<(), ActionError> {
        required_str(args, "service")?;
        required_str(args, "version")?;
        Ok(())
    }

    async fn apply(&self, _ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let service = required_str(args, "service")?;
        let want = required_str(args, "version")?;
        match self.markers.read(service).await? {
            Some(have) if have == want => Ok(format!("{service} at {have}")),
            Some(have) => Err(ActionError::failed(format!(
                "{service} version mismatch: have {have} want {want}"
            ))
            .with_outcome(format!("{service} at {have}"))),
            None => Err(ActionError::failed(format!(
                "{service} version marker missing"
            ))),
        }
    }
}
