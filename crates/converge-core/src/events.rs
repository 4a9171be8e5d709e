use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::op::StepOp;
use crate::policy::{EnforcementLevel, PolicySeverity};
use crate::property::PropertyMap;
use crate::urn::Urn;

/// A single policy diagnostic as shown to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyViolationEvent {
    pub urn: Option<Urn>,
    pub policy_name: String,
    pub policy_pack_name: String,
    pub policy_pack_version: String,
    pub message: String,
    pub enforcement_level: EnforcementLevel,
    pub severity: Option<PolicySeverity>,
}

/// Per resource, per pack: which policies passed and which failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySummaryEvent {
    pub urn: Option<Urn>,
    pub policy_pack_name: String,
    pub policy_pack_version: String,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

/// One property rewrite applied by a remediation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRemediationEvent {
    pub urn: Urn,
    pub policy_name: String,
    pub policy_pack_name: String,
    pub policy_pack_version: String,
    pub before: PropertyMap,
    pub after: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStepEvent {
    pub urn: Urn,
    pub op: StepOp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PolicyViolation(PolicyViolationEvent),
    PolicyAnalyzeSummary(PolicySummaryEvent),
    PolicyAnalyzeStackSummary(PolicySummaryEvent),
    PolicyRemediation(PolicyRemediationEvent),
    PolicyRemediateSummary(PolicySummaryEvent),
    ResourcePre(ResourceStepEvent),
    ResourceOutputs(ResourceStepEvent),
    ResourceOperationFailed {
        urn: Urn,
        op: StepOp,
        message: String,
    },
}

/// Consumer of engine events (display, telemetry, tests).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Logs each event via `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::PolicyViolation(v) => warn!(
                policy.pack = %v.policy_pack_name,
                policy.name = %v.policy_name,
                policy.level = ?v.enforcement_level,
                urn = ?v.urn.as_ref().map(Urn::as_str),
                "policy violation: {}",
                v.message
            ),
            EngineEvent::PolicyRemediation(r) => info!(
                policy.pack = %r.policy_pack_name,
                policy.name = %r.policy_name,
                urn = %r.urn,
                "policy remediation applied"
            ),
            EngineEvent::ResourcePre(s) => info!(urn = %s.urn, op = %s.op, "step started"),
            EngineEvent::ResourceOutputs(s) => info!(urn = %s.urn, op = %s.op, "step completed"),
            EngineEvent::ResourceOperationFailed { urn, op, message } => {
                warn!(urn = %urn, op = %op, error = %message, "step failed")
            }
            EngineEvent::PolicyAnalyzeSummary(_)
            | EngineEvent::PolicyAnalyzeStackSummary(_)
            | EngineEvent::PolicyRemediateSummary(_) => {}
        }
    }
}

/// Collects every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<EngineEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn violations(&self) -> Vec<PolicyViolationEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::PolicyViolation(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn remediations(&self) -> Vec<PolicyRemediationEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::PolicyRemediation(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Operations started for the resource named `name`, in order.
    pub fn ops_for(&self, name: &str) -> Vec<StepOp> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::ResourcePre(s) if s.urn.name() == name => Some(s.op),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fans each event out to several sinks.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
