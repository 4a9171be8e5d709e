//! Pass/fail bookkeeping for the per-pack summary events.
//!
//! A policy counts as *failed* when it produced a diagnostic (or a
//! remediation), as *passed* when it was a candidate and neither failed nor
//! reported itself not applicable. Disabled policies are never candidates.

use converge_core::Urn;
use converge_core::events::PolicySummaryEvent;

use crate::analyzer::{AnalyzeResponse, AnalyzerInfo, PolicyInfo, RemediateResponse};

/// Summary of a per-resource `analyze` call.
pub fn analyze_summary(
    urn: &Urn,
    info: &AnalyzerInfo,
    response: &AnalyzeResponse,
) -> PolicySummaryEvent {
    let failed = response.diagnostics.iter().map(|d| d.policy_name.as_str());
    build(
        Some(urn.clone()),
        info,
        |p| p.kind.applies_to_resources(),
        failed,
        &response.not_applicable,
    )
}

/// Summary of an `analyze_stack` call.
pub fn analyze_stack_summary(info: &AnalyzerInfo, response: &AnalyzeResponse) -> PolicySummaryEvent {
    let failed = response.diagnostics.iter().map(|d| d.policy_name.as_str());
    build(
        None,
        info,
        |p| p.kind.applies_to_stack(),
        failed,
        &response.not_applicable,
    )
}

/// Summary of a `remediate` call. Every remediation counts as a failure of
/// its policy, whether it rewrote properties or only reported a diagnostic.
pub fn remediate_summary(
    urn: &Urn,
    info: &AnalyzerInfo,
    response: &RemediateResponse,
) -> PolicySummaryEvent {
    let failed = response.remediations.iter().map(|r| r.policy_name.as_str());
    build(
        Some(urn.clone()),
        info,
        |p| p.kind.applies_to_resources(),
        failed,
        &response.not_applicable,
    )
}

fn build<'a>(
    urn: Option<Urn>,
    info: &AnalyzerInfo,
    applies: impl Fn(&PolicyInfo) -> bool,
    failed_names: impl Iterator<Item = &'a str>,
    not_applicable: &[String],
) -> PolicySummaryEvent {
    let disabled = |name: &str| {
        info.policies
            .iter()
            .any(|p| p.name == name && !p.enforcement_level.is_enabled())
    };

    let mut failed: Vec<String> = Vec::new();
    for name in failed_names {
        if !disabled(name) && !failed.iter().any(|f| f == name) {
            failed.push(name.to_string());
        }
    }

    let passed = info
        .policies
        .iter()
        .filter(|p| p.enforcement_level.is_enabled() && applies(p))
        .filter(|p| !failed.contains(&p.name) && !not_applicable.contains(&p.name))
        .map(|p| p.name.clone())
        .collect();

    PolicySummaryEvent {
        urn,
        policy_pack_name: info.name.clone(),
        policy_pack_version: info.version.clone(),
        passed,
        failed,
    }
}
