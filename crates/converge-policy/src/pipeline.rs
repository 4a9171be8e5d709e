use std::sync::Arc;

use converge_core::events::{EngineEvent, EventSink, PolicyRemediationEvent, PolicyViolationEvent};
use converge_core::{EnforcementLevel, PolicySeverity, PropertyMap};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::analyzer::{
    Analyzer, AnalyzerInfo, AnalyzerLoader, AnalyzerOptions, AnalyzerResource, AnalyzeResponse,
    Diagnostic, RequiredPolicy,
};
use crate::error::PolicyError;
use crate::summary;

struct LoadedPack {
    info: AnalyzerInfo,
    analyzer: Arc<dyn Analyzer>,
}

impl LoadedPack {
    fn declared_severity(&self, policy_name: &str) -> Option<PolicySeverity> {
        self.info
            .policies
            .iter()
            .find(|p| p.name == policy_name)
            .and_then(|p| p.severity)
    }

    fn is_disabled(&self, policy_name: &str) -> bool {
        self.info
            .policies
            .iter()
            .any(|p| p.name == policy_name && !p.enforcement_level.is_enabled())
    }
}

/// Violations raised by one `analyze` or `analyze_stack` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyReport {
    pub violations: Vec<PolicyViolationEvent>,
}

impl PolicyReport {
    pub fn mandatory(&self) -> impl Iterator<Item = &PolicyViolationEvent> {
        self.violations
            .iter()
            .filter(|v| v.enforcement_level.is_blocking())
    }

    pub fn is_blocking(&self) -> bool {
        self.mandatory().next().is_some()
    }

    /// One line per mandatory violation, `pack/policy: message`.
    pub fn blocking_summary(&self) -> String {
        self.mandatory()
            .map(|v| format!("{}/{}: {}", v.policy_pack_name, v.policy_name, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Runs the required policy packs, in order, over each resource and over
/// the stack as a whole.
pub struct PolicyPipeline {
    packs: Vec<LoadedPack>,
    events: Arc<dyn EventSink>,
}

impl PolicyPipeline {
    /// A pipeline with no packs; every pass is a no-op.
    pub fn empty(events: Arc<dyn EventSink>) -> Self {
        Self {
            packs: Vec::new(),
            events,
        }
    }

    /// Instantiate every required pack from `loaders`, in the listed order.
    pub async fn load(
        required: &[RequiredPolicy],
        loaders: &[AnalyzerLoader],
        base: &AnalyzerOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, PolicyError> {
        let mut packs = Vec::with_capacity(required.len());

        for req in required {
            let loader = loaders
                .iter()
                .find(|l| l.name == req.name)
                .ok_or_else(|| PolicyError::Load {
                    name: req.name.clone(),
                    message: "no analyzer registered under this name".to_string(),
                })?;

            let options = AnalyzerOptions {
                config: req.config.clone(),
                ..base.clone()
            };
            let analyzer = loader.load(&options)?;

            let mut info = match analyzer.info().await {
                Ok(info) => info,
                Err(e) if e.is_unsupported() => AnalyzerInfo::default(),
                Err(e) => {
                    return Err(PolicyError::Load {
                        name: req.name.clone(),
                        message: e.to_string(),
                    });
                }
            };
            if info.name.is_empty() {
                info.name = req.name.clone();
            }
            if info.version.is_empty() {
                info.version = req.version.clone().unwrap_or_default();
            }
            if let Some(wanted) = &req.version {
                if wanted != &info.version {
                    return Err(PolicyError::Load {
                        name: req.name.clone(),
                        message: format!("requested version {wanted}, found {}", info.version),
                    });
                }
            }

            info!(
                pack = %info.name,
                version = %info.version,
                policies = info.policies.len(),
                "policy pack loaded"
            );
            packs.push(LoadedPack { info, analyzer });
        }

        Ok(Self { packs, events })
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn packs(&self) -> impl Iterator<Item = &AnalyzerInfo> {
        self.packs.iter().map(|p| &p.info)
    }

    /// Apply every pack's remediations, in pack order then remediation
    /// order, and return the resulting properties.
    ///
    /// A remediation's properties replace the whole working map; the next
    /// remediation sees the result. Any analyzer error aborts.
    pub async fn remediate(&self, resource: &AnalyzerResource) -> Result<PropertyMap, PolicyError> {
        let mut working = resource.clone();

        for pack in &self.packs {
            let response = match pack.analyzer.remediate(&working).await {
                Ok(response) => response,
                Err(e) if e.is_unsupported() => continue,
                Err(e) => {
                    return Err(PolicyError::RemediationFailed {
                        pack: pack.info.name.clone(),
                        urn: resource.urn.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            for remediation in &response.remediations {
                let pack_name = or_default(&remediation.policy_pack_name, &pack.info.name);
                let pack_version = or_default(&remediation.policy_pack_version, &pack.info.version);

                if let Some(properties) = &remediation.properties {
                    let before = std::mem::replace(&mut working.properties, properties.clone());
                    debug!(
                        urn = %resource.urn,
                        policy = %remediation.policy_name,
                        "remediation rewrote properties"
                    );
                    self.events
                        .emit(EngineEvent::PolicyRemediation(PolicyRemediationEvent {
                            urn: resource.urn.clone(),
                            policy_name: remediation.policy_name.clone(),
                            policy_pack_name: pack_name.clone(),
                            policy_pack_version: pack_version.clone(),
                            before,
                            after: working.properties.clone(),
                        }));
                }

                if let Some(message) = &remediation.diagnostic {
                    self.events
                        .emit(EngineEvent::PolicyViolation(PolicyViolationEvent {
                            urn: Some(resource.urn.clone()),
                            policy_name: remediation.policy_name.clone(),
                            policy_pack_name: pack_name,
                            policy_pack_version: pack_version,
                            message: message.clone(),
                            enforcement_level: EnforcementLevel::Advisory,
                            severity: pack.declared_severity(&remediation.policy_name),
                        }));
                }
            }

            self.events.emit(EngineEvent::PolicyRemediateSummary(
                summary::remediate_summary(&resource.urn, &pack.info, &response),
            ));
        }

        Ok(working.properties)
    }

    /// Run every pack's per-resource checks.
    ///
    /// `Remediate` diagnostics are reported (and enforced) as `Mandatory`.
    pub async fn analyze(&self, resource: &AnalyzerResource) -> Result<PolicyReport, PolicyError> {
        let mut report = PolicyReport::default();

        for pack in &self.packs {
            let Some(response) = self.call(pack, pack.analyzer.analyze(resource)).await? else {
                continue;
            };
            for diagnostic in &response.diagnostics {
                self.record(pack, diagnostic, Some(&resource.urn), &mut report);
            }
            self.events.emit(EngineEvent::PolicyAnalyzeSummary(
                summary::analyze_summary(&resource.urn, &pack.info, &response),
            ));
        }

        Ok(report)
    }

    /// Run every pack's stack-level checks over all registered resources.
    pub async fn analyze_stack(
        &self,
        resources: &[AnalyzerResource],
    ) -> Result<PolicyReport, PolicyError> {
        let mut report = PolicyReport::default();

        for pack in &self.packs {
            let Some(response) = self.call(pack, pack.analyzer.analyze_stack(resources)).await?
            else {
                continue;
            };
            for diagnostic in &response.diagnostics {
                self.record(pack, diagnostic, None, &mut report);
            }
            self.events.emit(EngineEvent::PolicyAnalyzeStackSummary(
                summary::analyze_stack_summary(&pack.info, &response),
            ));
        }

        Ok(report)
    }

    /// Signal every loaded pack to shut down. Errors are logged, not returned.
    pub async fn cancel(&self) {
        let results = join_all(self.packs.iter().map(|p| p.analyzer.cancel())).await;
        for (pack, result) in self.packs.iter().zip(results) {
            match result {
                Ok(()) => debug!(pack = %pack.info.name, "analyzer canceled"),
                Err(e) if e.is_unsupported() => {}
                Err(e) => warn!(pack = %pack.info.name, error = %e, "analyzer cancel failed"),
            }
        }
    }

    async fn call(
        &self,
        pack: &LoadedPack,
        fut: crate::analyzer::BoxFuture<'_, Result<AnalyzeResponse, PolicyError>>,
    ) -> Result<Option<AnalyzeResponse>, PolicyError> {
        match fut.await {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_unsupported() => Ok(None),
            Err(e) => Err(PolicyError::Analyzer {
                pack: pack.info.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn record(
        &self,
        pack: &LoadedPack,
        diagnostic: &Diagnostic,
        default_urn: Option<&converge_core::Urn>,
        report: &mut PolicyReport,
    ) {
        if !diagnostic.enforcement_level.is_enabled() || pack.is_disabled(&diagnostic.policy_name) {
            return;
        }

        let violation = PolicyViolationEvent {
            urn: diagnostic.urn.clone().or_else(|| default_urn.cloned()),
            policy_name: diagnostic.policy_name.clone(),
            policy_pack_name: pack.info.name.clone(),
            policy_pack_version: pack.info.version.clone(),
            message: diagnostic.message.clone(),
            enforcement_level: diagnostic.enforcement_level.for_analysis(),
            severity: diagnostic
                .severity
                .or_else(|| pack.declared_severity(&diagnostic.policy_name)),
        };
        self.events
            .emit(EngineEvent::PolicyViolation(violation.clone()));
        report.violations.push(violation);
    }
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
