//! Built-in handlers.
//!
//! Small, generic actions used as probes, pre/post conditions and simple
//! steps. Domain actions (DNS, TLS, keepalived, object store) register
//! themselves alongside these at startup.

mod file;
mod probe;
mod service;

use std::sync::Arc;

pub use file::{FileExists, FileMode, parse_mode};
pub use probe::{ProbeFail, ProbeSuccess};
pub use service::{ServiceActive, ServiceControl, ServiceVersion, ServiceVerb};

use crate::registry::ActionRegistry;
use crate::supervisor::Supervisor;
use crate::version::VersionMarkers;

/// Register every built-in handler.
pub fn register_builtins(
    registry: &mut ActionRegistry,
    supervisor: Arc<dyn Supervisor>,
    markers: VersionMarkers,
) {
    registry.register(Arc::new(ProbeSuccess));
    registry.register(Arc::new(ProbeFail));
    registry.register(Arc::new(FileExists));
    registry.register(Arc::new(FileMode));
    registry.register(Arc::new(ServiceActive::new(supervisor.clone())));
    for verb in [ServiceVerb::Start, ServiceVerb::Stop, ServiceVerb::Restart] {
        registry.register(Arc::new(ServiceControl::new(verb, supervisor.clone())));
    }
    registry.register(Arc::new(ServiceVersion::new(markers)));
}
