//! Desired-state check.
//!
//! Order is fixed: success probes, then desired services, then desired files.
//! The first failing check is returned and nothing is mutated.

use keel_actions::builtin::parse_mode;
use keel_actions::{ActionContext, ActionRegistry, Supervisor, VersionMarkers, unit_for_service};
use keel_core::{DesiredFile, DesiredService, PlanSpec};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use crate::condition::evaluate_condition;
use crate::error::InvariantError;

#[derive(Clone)]
pub struct InvariantChecker {
    registry: Arc<ActionRegistry>,
    supervisor: Arc<dyn Supervisor>,
    markers: VersionMarkers,
}

impl InvariantChecker {
    pub fn new(
        registry: Arc<ActionRegistry>,
        supervisor: Arc<dyn Supervisor>,
        markers: VersionMarkers,
    ) -> Self {
        Self {
            registry,
            supervisor,
            markers,
        }
    }

    pub async fn evaluate(&self, ctx: &ActionContext, spec: &PlanSpec) -> Result<(), InvariantError> {
        for probe in &spec.success_probes {
            evaluate_condition(&self.registry, ctx, probe)
                .await
                .map_err(|source| InvariantError::Probe {
                    kind: probe.kind.clone(),
                    source,
                })?;
        }
        for service in &spec.desired.services {
            self.check_service(service).await?;
        }
        for file in &spec.desired.files {
            check_file(file).await?;
        }
        Ok(())
    }

    async fn check_service(&self, service: &DesiredService) -> Result<(), InvariantError> {
        let unit = match service.unit.as_deref().map(str::trim) {
            Some(unit) if !unit.is_empty() => unit.to_string(),
            _ => unit_for_service(&service.name),
        };
        if unit.is_empty() {
            return Err(InvariantError::MissingUnit {
                name: service.name.clone(),
            });
        }
        let active = self
            .supervisor
            .is_active(&unit)
            .await
            .map_err(|source| InvariantError::ServiceCheck {
                unit: unit.clone(),
                source,
            })?;
        if !active {
            return Err(InvariantError::ServiceInactive { unit });
        }

        let Some(want) = service.version.as_deref().map(str::trim).filter(|v| !v.is_empty())
        else {
            return Ok(());
        };
        let have = self
            .markers
            .read(&service.name)
            .await
            .map_err(|source| InvariantError::VersionRead {
                service: service.name.clone(),
                source,
            })?
            .ok_or_else(|| InvariantError::VersionMissing {
                service: service.name.clone(),
            })?;
        if have != want {
            return Err(InvariantError::VersionMismatch {
                service: service.name.clone(),
                have,
                want: want.to_string(),
            });
        }
        Ok(())
    }
}

// Owner and content_ref are carried in the model but not checked yet.
async fn check_file(file: &DesiredFile) -> Result<(), InvariantError> {
    let path = file.path.trim();
    if path.is_empty() {
        return Err(InvariantError::MissingPath);
    }
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|source| InvariantError::FileMissing {
            path: path.to_string(),
            source,
        })?;
    let Some(mode) = file.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(());
    };
    let want = parse_mode(mode).ok_or_else(|| InvariantError::InvalidMode {
        path: path.to_string(),
        mode: mode.to_string(),
    })?;
    let have = meta.permissions().mode() & 0o7777;
    if have != want {
        return Err(InvariantError::ModeMismatch {
            path: path.to_string(),
            have,
            want,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_actions::MemorySupervisor;
    use keel_actions::builtin::{ProbeFail, ProbeSuccess};
    use keel_core::{Condition, DesiredState};

    fn checker(sup: MemorySupervisor, markers: VersionMarkers) -> InvariantChecker {
        let registry = ActionRegistry::new().with(ProbeSuccess).with(ProbeFail);
        InvariantChecker::new(Arc::new(registry), Arc::new(sup), markers)
    }

    fn service(name: &str, version: Option<&str>) -> DesiredService {
        DesiredService {
            name: name.to_string(),
            unit: None,
            version: version.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_empty_spec_holds() {
        let dir = tempfile::tempdir().unwrap();
        let check = checker(MemorySupervisor::new(), VersionMarkers::new(dir.path()));
        let ctx = ActionContext::detached();
        assert!(check.evaluate(&ctx, &PlanSpec::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let check = checker(MemorySupervisor::new(), VersionMarkers::new(dir.path()));
        let spec = PlanSpec {
            success_probes: vec![Condition {
                kind: "probe.fail".into(),
                ..Default::default()
            }],
            desired: DesiredState {
                services: vec![service("gateway", None)],
                ..Default::default()
            },
            ..Default::default()
        };
        let err = check
            .evaluate(&ActionContext::detached(), &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, InvariantError::Probe { .. }));
    }

    #[tokio::test]
    async fn test_service_unit_fallback_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let markers = VersionMarkers::new(dir.path());
        let sup = MemorySupervisor::new().with_active("gateway.service");
        let check = checker(sup, markers.clone());
        let ctx = ActionContext::detached();

        let spec = |v: &str| PlanSpec {
            desired: DesiredState {
                services: vec![service("gateway", Some(v))],
                ..Default::default()
            },
            ..Default::default()
        };

        let err = check.evaluate(&ctx, &spec("1.2.0")).await.unwrap_err();
        assert!(matches!(err, InvariantError::VersionMissing { .. }));

        markers.write("gateway", "1.2.0").await.unwrap();
        check.evaluate(&ctx, &spec("1.2.0")).await.unwrap();

        let err = check.evaluate(&ctx, &spec("1.3.0")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "service gateway version mismatch: have 1.2.0 want 1.3.0"
        );
    }

    #[tokio::test]
    async fn test_inactive_service() {
        let dir = tempfile::tempdir().unwrap();
        let check = checker(MemorySupervisor::new(), VersionMarkers::new(dir.path()));
        let spec = PlanSpec {
            desired: DesiredState {
                services: vec![DesiredService {
                    name: "db".into(),
                    unit: Some("postgresql.service".into()),
                    version: None,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let err = check
            .evaluate(&ActionContext::detached(), &spec)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "service postgresql.service not active");
    }

    #[tokio::test]
    async fn test_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tls.key");
        std::fs::write(&path, b"k").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        let check = checker(MemorySupervisor::new(), VersionMarkers::new(dir.path()));
        let ctx = ActionContext::detached();

        let spec = |mode: &str| PlanSpec {
            desired: DesiredState {
                files: vec![DesiredFile {
                    path: path.to_string_lossy().into_owned(),
                    mode: Some(mode.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        check.evaluate(&ctx, &spec("0600")).await.unwrap();
        assert!(matches!(
            check.evaluate(&ctx, &spec("0644")).await,
            Err(InvariantError::ModeMismatch { .. })
        ));
        assert!(matches!(
            check.evaluate(&ctx, &spec("rw-------")).await,
            Err(InvariantError::InvalidMode { .. })
        ));
    }
}
