//! Static plan checks run before a plan is stored.

use keel_actions::ActionRegistry;
use keel_actions::builtin::parse_mode;
use keel_core::{Args, NodePlan};
use std::collections::HashSet;
use std::fmt;

/// One problem found in a plan, located by a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanIssue {
    pub path: String,
    pub message: String,
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Check every step, condition and probe against `registry`.
///
/// An empty result means every handler the plan names is registered and
/// accepts its arguments, step ids are unique and desired file modes parse.
pub fn check_plan(registry: &ActionRegistry, plan: &NodePlan) -> Vec<PlanIssue> {
    let mut issues = Vec::new();

    for (section, steps) in [("steps", &plan.spec.steps), ("rollback", &plan.spec.rollback)] {
        let mut seen = HashSet::new();
        for (i, step) in steps.iter().enumerate() {
            let path = format!("{section}[{i}]");
            if step.id.trim().is_empty() {
                push(&mut issues, &path, "step id is empty");
            } else if !seen.insert(step.id.as_str()) {
                push(&mut issues, &path, format!("duplicate step id {}", step.id));
            }
            check_handler(registry, &mut issues, &path, &step.action, &step.args);
            for (j, cond) in step.pre.iter().enumerate() {
                check_handler(registry, &mut issues, &format!("{path}.pre[{j}]"), &cond.kind, &cond.args);
            }
            for (j, cond) in step.post.iter().enumerate() {
                check_handler(registry, &mut issues, &format!("{path}.post[{j}]"), &cond.kind, &cond.args);
            }
        }
    }

    for (i, probe) in plan.spec.success_probes.iter().enumerate() {
        check_handler(
            registry,
            &mut issues,
            &format!("success_probes[{i}]"),
            &probe.kind,
            &probe.args,
        );
    }

    for (i, svc) in plan.spec.desired.services.iter().enumerate() {
        if svc.name.trim().is_empty() {
            push(&mut issues, &format!("desired.services[{i}]"), "service name is empty");
        }
    }
    for (i, file) in plan.spec.desired.files.iter().enumerate() {
        let path = format!("desired.files[{i}]");
        if file.path.trim().is_empty() {
            push(&mut issues, &path, "file path is empty");
        }
        if let Some(mode) = &file.mode {
            if parse_mode(mode).is_none() {
                push(&mut issues, &path, format!("invalid mode {mode:?}"));
            }
        }
    }

    issues
}

fn check_handler(
    registry: &ActionRegistry,
    issues: &mut Vec<PlanIssue>,
    path: &str,
    name: &str,
    args: &Args,
) {
    match registry.get(name) {
        None => push(issues, path, format!("action {name:?} is not registered")),
        Some(handler) => {
            if let Err(e) = handler.validate(args) {
                push(issues, path, e.to_string());
            }
        }
    }
}

fn push(issues: &mut Vec<PlanIssue>, path: &str, message: impl Into<String>) {
    issues.push(PlanIssue {
        path: path.to_string(),
        message: message.into(),
    });
}
