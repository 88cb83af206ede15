//! Process supervisor collaborator.
//!
//! `SystemctlSupervisor` shells out to `systemctl`; `MemorySupervisor` keeps
//! unit state in a table and is used for dry runs and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ActionError;

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn is_active(&self, unit: &str) -> Result<bool, ActionError>;
    async fn start(&self, unit: &str) -> Result<(), ActionError>;
    async fn stop(&self, unit: &str) -> Result<(), ActionError>;
    async fn restart(&self, unit: &str) -> Result<(), ActionError>;
    async fn enable(&self, unit: &str) -> Result<(), ActionError>;
    async fn disable(&self, unit: &str) -> Result<(), ActionError>;

    /// Poll `is_active` until the unit is active or `timeout` elapses.
    async fn wait_active(&self, unit: &str, timeout: Duration) -> Result<(), ActionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_active(unit).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ActionError::Supervisor(format!(
                    "{unit} not active after {}ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Systemd unit name for a service: `<name>.service` unless already suffixed.
pub fn unit_for_service(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() || name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

/// Supervisor backed by the `systemctl` binary.
pub struct SystemctlSupervisor {
    binary: PathBuf,
}

impl Default for SystemctlSupervisor {
    fn default() -> Self {
        Self::new("systemctl")
    }
}

impl SystemctlSupervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, verb: &str, unit: &str) -> Result<(), ActionError> {
        let output = Command::new(&self.binary)
            .arg(verb)
            .arg(unit)
            .output()
            .await
            .map_err(|e| ActionError::Supervisor(format!("systemctl {verb} {unit}: {e}")))?;
        if output.status.success() {
            tracing::debug!(verb, unit, "systemctl succeeded");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ActionError::Supervisor(format!(
            "systemctl {verb} {unit}: {} {}",
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl Supervisor for SystemctlSupervisor {
    async fn is_active(&self, unit: &str) -> Result<bool, ActionError> {
        let status = Command::new(&self.binary)
            .args(["is-active", "--quiet", unit])
            .status()
            .await
            .map_err(|e| ActionError::Supervisor(format!("systemctl is-active {unit}: {e}")))?;
        Ok(status.success())
    }

    async fn start(&self, unit: &str) -> Result<(), ActionError> {
        self.run("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<(), ActionError> {
        self.run("stop", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<(), ActionError> {
        self.run("restart", unit).await
    }

    async fn enable(&self, unit: &str) -> Result<(), ActionError> {
        self.run("enable", unit).await
    }

    async fn disable(&self, unit: &str) -> Result<(), ActionError> {
        self.run("disable", unit).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitState {
    pub active: bool,
    pub enabled: bool,
}

/// In-memory supervisor. Unknown units read as inactive.
#[derive(Debug, Default)]
pub struct MemorySupervisor {
    units: RwLock<HashMap<String, UnitState>>,
}

impl MemorySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a unit as active.
    pub fn with_active(self, unit: &str) -> Self {
        self.set_active(unit, true);
        self
    }

    pub fn set_active(&self, unit: &str, active: bool) {
        if let Ok(mut units) = self.units.write() {
            units.entry(unit.to_string()).or_default().active = active;
        }
    }

    pub fn state(&self, unit: &str) -> UnitState {
        self.units
            .read()
            .ok()
            .and_then(|units| units.get(unit).copied())
            .unwrap_or_default()
    }

    fn update(&self, unit: &str, f: impl FnOnce(&mut UnitState)) -> Result<(), ActionError> {
        let mut units = self
            .units
            .write()
            .map_err(|_| ActionError::Supervisor("unit table poisoned".to_string()))?;
        f(units.entry(unit.to_string()).or_default());
        Ok(())
    }
}

#[async_trait]
impl Supervisor for MemorySupervisor {
    async fn is_active(&self, unit: &str) -> Result<bool, ActionError> {
        Ok(self.state(unit).active)
    }

    async fn start(&self, unit: &str) -> Result<(), ActionError> {
        self.update(unit, |s| s.active = true)
    }

    async fn stop(&self, unit: &str) -> Result<(), ActionError> {
        self.update(unit, |s| s.active = false)
    }

    async fn restart(&self, unit: &str) -> Result<(), ActionError> {
        self.update(unit, |s| s.active = true)
    }

    async fn enable(&self, unit: &str) -> Result<(), ActionError> {
        self.update(unit, |s| s.enabled = true)
    }

    async fn disable(&self, unit: &str) -> Result<(), ActionError> {
        self.update(unit, |s| s.enabled = false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_for_service() {
        assert_eq!(unit_for_service("gateway"), "gateway.service");
        assert_eq!(unit_for_service("envoy.service"), "envoy.service");
        assert_eq!(unit_for_service("keel.timer"), "keel.timer");
        assert_eq!(unit_for_service(" "), "");
    }

    #[tokio::test]
    async fn test_memory_supervisor_lifecycle() {
        let sup = MemorySupervisor::new();
        assert!(!sup.is_active("a.service").await.unwrap());

        sup.start("a.service").await.unwrap();
        sup.enable("a.service").await.unwrap();
        assert!(sup.is_active("a.service").await.unwrap());
        assert!(sup.state("a.service").enabled);

        sup.stop("a.service").await.unwrap();
        assert!(!sup.is_active("a.service").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_active_times_out() {
        let sup = MemorySupervisor::new();
        let err = sup
            .wait_active("never.service", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Supervisor(_)));

        sup.set_active("up.service", true);
        sup.wait_active("up.service", Duration::from_secs(1))
            .await
            .unwrap();
    }
}
