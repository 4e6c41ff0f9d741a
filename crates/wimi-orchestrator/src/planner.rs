use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::types::SequenceProposal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use wimi_core::DataToken;

/// Knobs of the ordering policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerPolicy {
    /// Tokens available before any agent runs. The inquiry always names
    /// the vendor, so `VENDOR_INFO` is present from the start.
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: Vec<DataToken>,
    /// Agent pinned to position 0 when present.
    #[serde(default = "default_coordinator")]
    pub coordinator: Option<String>,
    /// Agent whose `ALL_DATA` dependency is satisfied by a quorum of
    /// data providers instead of every data source.
    #[serde(default = "default_aggregator")]
    pub aggregator: Option<String>,
    /// Data providers the aggregator needs at minimum.
    #[serde(default = "default_min_data_providers")]
    pub min_data_providers: usize,
    /// Also schedule the analyzer's optional agents.
    #[serde(default)]
    pub include_optional: bool,
}

fn default_initial_tokens() -> Vec<DataToken> {
    vec![DataToken::VendorInfo]
}

fn default_coordinator() -> Option<String> {
    Some("planner".into())
}

fn default_aggregator() -> Option<String> {
    Some("analysis".into())
}

fn default_min_data_providers() -> usize {
    2
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            initial_tokens: default_initial_tokens(),
            coordinator: default_coordinator(),
            aggregator: default_aggregator(),
            min_data_providers: default_min_data_providers(),
            include_optional: false,
        }
    }
}

/// A dependency that is not available at the position an agent runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    /// Agent missing the token.
    pub agent_id: String,
    /// Position of that agent in the sequence.
    pub position: usize,
    /// Token no earlier agent provides.
    pub token: DataToken,
}

/// Outcome of checking a sequence against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No missing, unknown or duplicate agents.
    pub valid: bool,
    /// Tokens not available where they are needed.
    pub missing_dependencies: Vec<MissingDependency>,
    /// Names that matched no agent.
    #[serde(default)]
    pub unknown_agents: Vec<String>,
    /// Agents listed more than once.
    #[serde(default)]
    pub duplicate_agents: Vec<String>,
    /// Tokens available once the whole sequence has run.
    pub available_data_after_sequence: Vec<DataToken>,
    /// Suggestions shown to the reviewer.
    pub recommendations: Vec<String>,
}

/// Result of [`SequencePlanner::plan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Agent ids in execution order.
    pub sequence: Vec<String>,
    /// Canonical ids the caller asked for that resolved to a known agent.
    pub resolved_required: Vec<String>,
    /// Requested names that matched no agent; dropped from the plan.
    pub unknown_agents: Vec<String>,
    /// Problems that did not stop planning.
    pub warnings: Vec<String>,
    /// Validation of `sequence`.
    pub validation: ValidationReport,
}

/// Orders agents so each runs after the agents producing its inputs.
pub struct SequencePlanner {
    registry: Arc<AgentRegistry>,
    policy: PlannerPolicy,
}

impl SequencePlanner {
    /// Planner over `registry` applying `policy`.
    pub fn new(registry: Arc<AgentRegistry>, policy: PlannerPolicy) -> Self {
        Self { registry, policy }
    }

    /// Agent catalogue.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Sequencing rules.
    pub fn policy(&self) -> &PlannerPolicy {
        &self.policy
    }

    /// Build an ordering for the required (and, if allowed, optional) agents.
    ///
    /// Among agents whose dependencies are met, the lowest priority number
    /// goes first; ties fall back to id order. When no remaining agent is
    /// ready the lowest-priority one is placed anyway and a warning is
    /// recorded, so planning always terminates.
    pub fn plan(&self, required: &[String], optional: &[String]) -> PlanOutcome {
        let mut warnings = Vec::new();
        let mut unknown_agents = Vec::new();
        let mut resolved_required = Vec::new();
        let mut selected: BTreeSet<String> = BTreeSet::new();

        for name in required {
            match self.registry.resolve_alias(name) {
                Ok(id) => {
                    if !resolved_required.contains(&id) {
                        resolved_required.push(id.clone());
                    }
                    selected.insert(id);
                }
                Err(_) => {
                    warnings.push(format!("unknown agent '{name}' dropped from plan"));
                    unknown_agents.push(name.clone());
                }
            }
        }
        if self.policy.include_optional {
            for name in optional {
                match self.registry.resolve_alias(name) {
                    Ok(id) => {
                        selected.insert(id);
                    }
                    Err(_) => warnings.push(format!("unknown optional agent '{name}' ignored")),
                }
            }
        }
        for descriptor in self.registry.required_agents() {
            selected.insert(descriptor.id.clone());
        }

        let mut remaining: Vec<&AgentDescriptor> = selected
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        let mut sequence: Vec<String> = Vec::with_capacity(remaining.len());
        let mut placed: Vec<&AgentDescriptor> = Vec::with_capacity(remaining.len());
        let mut available: BTreeSet<DataToken> =
            self.policy.initial_tokens.iter().copied().collect();

        if let Some(coordinator) = &self.policy.coordinator {
            if let Some(pos) = remaining.iter().position(|d| &d.id == coordinator) {
                let d = remaining.remove(pos);
                available.extend(d.provides.iter().copied());
                sequence.push(d.id.clone());
                placed.push(d);
            }
        }

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .enumerate()
                .filter(|(_, d)| self.is_ready(d, &available, &placed, &remaining))
                .min_by(|(_, a), (_, b)| rank(a, b))
                .map(|(i, _)| i);

            let index = match ready {
                Some(i) => i,
                None => {
                    let Some((i, stuck)) = remaining.iter().enumerate().min_by(|(_, a), (_, b)| rank(a, b))
                    else {
                        break;
                    };
                    let unmet: Vec<String> = stuck
                        .dependencies
                        .iter()
                        .filter(|t| !self.token_met(stuck, **t, &available, &placed, &remaining))
                        .map(ToString::to_string)
                        .collect();
                    let message = format!(
                        "dependency deadlock: placing '{}' with unmet dependencies [{}]",
                        stuck.id,
                        unmet.join(", ")
                    );
                    warn!(agent = %stuck.id, "{message}");
                    warnings.push(message);
                    i
                }
            };

            let d = remaining.remove(index);
            available.extend(d.provides.iter().copied());
            sequence.push(d.id.clone());
            placed.push(d);
        }

        debug!(sequence = ?sequence, "Sequence planned");
        let validation = self.validate(&sequence);
        PlanOutcome {
            sequence,
            resolved_required,
            unknown_agents,
            warnings,
            validation,
        }
    }

    /// Check that every agent's dependencies are available at its position.
    pub fn validate(&self, sequence: &[String]) -> ValidationReport {
        let mut available: BTreeSet<DataToken> =
            self.policy.initial_tokens.iter().copied().collect();
        let mut missing_dependencies = Vec::new();
        let mut unknown_agents = Vec::new();
        let mut duplicate_agents = Vec::new();
        let mut recommendations = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut providers_so_far = 0usize;

        for (position, id) in sequence.iter().enumerate() {
            if !seen.insert(id.as_str()) {
                duplicate_agents.push(id.clone());
                recommendations.push(format!("Remove the repeated '{id}' at position {position}"));
                continue;
            }
            let Some(descriptor) = self.registry.get(id) else {
                unknown_agents.push(id.clone());
                recommendations.push(format!("Drop unknown agent '{id}' or register it"));
                continue;
            };

            for token in &descriptor.dependencies {
                let met = match token {
                    DataToken::None => true,
                    DataToken::AllData if self.is_aggregator(descriptor) => {
                        providers_so_far >= self.policy.min_data_providers
                    }
                    DataToken::AllData => DataToken::DATA_SOURCES.iter().all(|t| available.contains(t)),
                    t => available.contains(t),
                };
                if !met {
                    missing_dependencies.push(MissingDependency {
                        agent_id: id.clone(),
                        position,
                        token: *token,
                    });
                    recommendations.push(self.recommend(descriptor, *token));
                }
            }

            if descriptor.is_data_provider() {
                providers_so_far += 1;
            }
            available.extend(descriptor.provides.iter().copied());
        }

        if let Some(coordinator) = &self.policy.coordinator {
            if let Some(pos) = sequence.iter().position(|id| id == coordinator) {
                if pos != 0 {
                    recommendations.push(format!(
                        "Move '{coordinator}' to the front of the sequence"
                    ));
                }
            }
        }

        if providers_so_far >= self.policy.min_data_providers {
            available.insert(DataToken::AllData);
        }

        ValidationReport {
            valid: missing_dependencies.is_empty()
                && unknown_agents.is_empty()
                && duplicate_agents.is_empty(),
            missing_dependencies,
            unknown_agents,
            duplicate_agents,
            available_data_after_sequence: available.into_iter().collect(),
            recommendations,
        }
    }

    /// Approval payload for `sequence`, with a reasoning line per agent.
    pub fn proposal(&self, sequence: &[String]) -> SequenceProposal {
        let mut reasoning = BTreeMap::new();
        let mut estimated = 0.0;
        for (position, id) in sequence.iter().enumerate() {
            let line = match self.registry.get(id) {
                Some(d) => {
                    estimated += d.estimated_duration_seconds;
                    let needs = if d.dependencies.is_empty() {
                        "no inputs".to_string()
                    } else {
                        format!(
                            "needs {}",
                            d.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                        )
                    };
                    let yields = d
                        .provides
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("step {}: {}; {needs}, provides {yields}", position + 1, d.description)
                }
                None => format!("step {}: unknown agent", position + 1),
            };
            reasoning.insert(id.clone(), line);
        }
        SequenceProposal {
            agents: sequence.to_vec(),
            reasoning,
            estimated_duration_seconds: estimated,
        }
    }

    pub(crate) fn is_aggregator(&self, descriptor: &AgentDescriptor) -> bool {
        self.policy.aggregator.as_deref() == Some(descriptor.id.as_str())
    }

    fn is_ready(
        &self,
        descriptor: &AgentDescriptor,
        available: &BTreeSet<DataToken>,
        placed: &[&AgentDescriptor],
        remaining: &[&AgentDescriptor],
    ) -> bool {
        descriptor
            .dependencies
            .iter()
            .all(|t| self.token_met(descriptor, *t, available, placed, remaining))
    }

    fn token_met(
        &self,
        descriptor: &AgentDescriptor,
        token: DataToken,
        available: &BTreeSet<DataToken>,
        placed: &[&AgentDescriptor],
        remaining: &[&AgentDescriptor],
    ) -> bool {
        match token {
            DataToken::None => true,
            DataToken::AllData if self.is_aggregator(descriptor) => {
                let providers = placed
                    .iter()
                    .chain(remaining.iter())
                    .filter(|d| d.id != descriptor.id && d.is_data_provider())
                    .count();
                providers >= self.policy.min_data_providers
            }
            DataToken::AllData => DataToken::DATA_SOURCES.iter().all(|t| available.contains(t)),
            t => available.contains(&t),
        }
    }

    fn recommend(&self, descriptor: &AgentDescriptor, token: DataToken) -> String {
        if token == DataToken::AllData {
            return format!(
                "Schedule at least {} data providers before '{}'",
                self.policy.min_data_providers, descriptor.id
            );
        }
        let providers: Vec<&str> = self
            .registry
            .providers_of(token)
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        if providers.is_empty() {
            format!("No registered agent provides {token} for '{}'", descriptor.id)
        } else {
            format!(
                "Run {} before '{}' to provide {token}",
                providers.join(" or "),
                descriptor.id
            )
        }
    }
}

fn rank(a: &AgentDescriptor, b: &AgentDescriptor) -> std::cmp::Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::AgentCategory;

    fn planner() -> SequencePlanner {
        SequencePlanner::new(Arc::new(AgentRegistry::default_catalog()), PlannerPolicy::default())
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_email_invoice_analysis_ordering() {
        let outcome = planner().plan(&ids(&["email", "accounts_payable", "analysis"]), &[]);
        assert_eq!(outcome.sequence, ids(&["planner", "gmail", "invoice", "analysis"]));
        assert!(outcome.validation.valid);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.resolved_required, ids(&["gmail", "invoice", "analysis"]));
    }

    #[test]
    fn test_full_catalog_ordering() {
        let outcome = planner().plan(&ids(&["analysis", "crm", "invoice", "gmail"]), &[]);
        assert_eq!(
            outcome.sequence,
            ids(&["planner", "gmail", "invoice", "salesforce", "analysis"])
        );
        assert!(outcome.validation.valid);
        assert!(outcome
            .validation
            .available_data_after_sequence
            .contains(&DataToken::AllData));
    }

    #[test]
    fn test_unknown_agents_are_dropped_with_warning() {
        let outcome = planner().plan(&ids(&["gmail", "fax_machine"]), &[]);
        assert_eq!(outcome.sequence, ids(&["planner", "gmail"]));
        assert_eq!(outcome.unknown_agents, ids(&["fax_machine"]));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_unmet_dependency_is_placed_with_warning() {
        let outcome = planner().plan(&ids(&["invoice"]), &[]);
        assert_eq!(outcome.sequence, ids(&["planner", "invoice"]));
        assert!(outcome.warnings.iter().any(|w| w.contains("deadlock")));
        assert!(!outcome.validation.valid);
        assert_eq!(
            outcome.validation.missing_dependencies,
            vec![MissingDependency {
                agent_id: "invoice".into(),
                position: 1,
                token: DataToken::EmailData,
            }]
        );
        assert!(outcome.validation.recommendations[0].contains("gmail"));
    }

    #[test]
    fn test_optional_agents_respect_policy() {
        let required = ids(&["gmail"]);
        let optional = ids(&["crm"]);
        assert_eq!(planner().plan(&required, &optional).sequence, ids(&["planner", "gmail"]));

        let policy = PlannerPolicy {
            include_optional: true,
            ..PlannerPolicy::default()
        };
        let with_optional =
            SequencePlanner::new(Arc::new(AgentRegistry::default_catalog()), policy);
        assert_eq!(
            with_optional.plan(&required, &optional).sequence,
            ids(&["planner", "gmail", "salesforce"])
        );
    }

    #[test]
    fn test_validate_rejects_aggregator_before_providers() {
        let report = planner().validate(&ids(&["planner", "analysis", "gmail", "salesforce"]));
        assert!(!report.valid);
        assert_eq!(report.missing_dependencies[0].token, DataToken::AllData);
        assert_eq!(report.missing_dependencies[0].agent_id, "analysis");
    }

    #[test]
    fn test_validate_flags_unknown_and_duplicates() {
        let report = planner().validate(&ids(&["planner", "gmail", "gmail", "teleport"]));
        assert!(!report.valid);
        assert_eq!(report.duplicate_agents, ids(&["gmail"]));
        assert_eq!(report.unknown_agents, ids(&["teleport"]));
        assert_eq!(report.recommendations.len(), 2);
    }

    #[test]
    fn test_validate_recommends_coordinator_first() {
        let report = planner().validate(&ids(&["gmail", "planner"]));
        assert!(report.valid);
        assert!(report.recommendations.iter().any(|r| r.contains("front")));
    }

    #[test]
    fn test_non_aggregator_all_data_needs_every_source() {
        let registry = AgentRegistry::builder()
            .agent(AgentDescriptor::new("email", AgentCategory::Email).provides([DataToken::EmailData]))
            .agent(AgentDescriptor::new("ap", AgentCategory::AccountsPayable).provides([DataToken::ApData]))
            .agent(
                AgentDescriptor::new("audit", AgentCategory::Analysis)
                    .depends_on([DataToken::AllData])
                    .priority(1),
            )
            .build()
            .unwrap();
        let planner = SequencePlanner::new(Arc::new(registry), PlannerPolicy::default());
        let report = planner.validate(&ids(&["email", "ap", "audit"]));
        assert!(!report.valid);
        assert_eq!(report.missing_dependencies[0].agent_id, "audit");
    }

    #[test]
    fn test_proposal_reasoning() {
        let p = planner();
        let proposal = p.proposal(&ids(&["planner", "gmail"]));
        assert_eq!(proposal.agents, ids(&["planner", "gmail"]));
        assert_eq!(proposal.reasoning.len(), 2);
        assert!(proposal.reasoning["gmail"].contains("EMAIL_DATA"));
        assert!((proposal.estimated_duration_seconds - 25.0).abs() < f64::EPSILON);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const OPTIONAL: [&str; 4] = ["gmail", "invoice", "salesforce", "analysis"];

        /// Closed under dependencies: invoice needs gmail, analysis needs two providers.
        fn closed(set: &[String]) -> bool {
            let has = |id: &str| set.iter().any(|s| s == id);
            let providers = ["gmail", "invoice", "salesforce"].iter().filter(|p| has(p)).count();
            (!has("invoice") || has("gmail")) && (!has("analysis") || providers >= 2)
        }

        proptest! {
            #[test]
            fn closed_sets_plan_valid(mask in 0u8..16) {
                let set: Vec<String> = OPTIONAL
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, s)| s.to_string())
                    .collect();
                prop_assume!(closed(&set));

                let outcome = planner().plan(&set, &[]);
                prop_assert!(outcome.validation.valid, "{:?}", outcome.validation);
                prop_assert!(outcome.warnings.is_empty());
                prop_assert_eq!(outcome.sequence.first().map(String::as_str), Some("planner"));

                let mut expected: BTreeSet<String> = set.into_iter().collect();
                expected.insert("planner".into());
                let got: BTreeSet<String> = outcome.sequence.iter().cloned().collect();
                prop_assert_eq!(got.len(), outcome.sequence.len());
                prop_assert_eq!(got, expected);
            }

            #[test]
            fn planning_always_terminates_with_every_known_agent(
                names in proptest::collection::vec(
                    prop_oneof![
                        Just("gmail"), Just("email"), Just("invoice"), Just("ap"),
                        Just("crm"), Just("analysis"), Just("unknown"),
                    ],
                    0..8,
                )
            ) {
                let names: Vec<String> = names.into_iter().map(String::from).collect();
                let outcome = planner().plan(&names, &[]);
                let known = names.iter().filter(|n| n.as_str() != "unknown").count();
                prop_assert!(outcome.sequence.len() <= known + 1);
                prop_assert_eq!(outcome.sequence[0].as_str(), "planner");
                prop_assert_eq!(
                    outcome.unknown_agents.len(),
                    names.iter().filter(|n| n.as_str() == "unknown").count()
                );
            }
        }
    }
}
