use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use wimi_core::{DataToken, WimiError, WimiResult};

/// Functional area an agent covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    /// The planner.
    Coordination,
    /// Mailbox search.
    Email,
    /// Invoice and payment lookup.
    AccountsPayable,
    /// Customer records.
    Crm,
    /// Aggregation and reporting.
    Analysis,
}

impl AgentCategory {
    /// Wire name, also accepted as an alias for the single agent of that category.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCategory::Coordination => "coordination",
            AgentCategory::Email => "email",
            AgentCategory::AccountsPayable => "accounts_payable",
            AgentCategory::Crm => "crm",
            AgentCategory::Analysis => "analysis",
        }
    }
}

/// Static description of an agent: what it needs, what it yields, and
/// where it ranks among agents that are ready at the same time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Canonical id.
    pub id: String,
    /// Functional area.
    pub category: AgentCategory,
    /// Shown to reviewers as reasoning.
    pub description: String,
    /// Tokens that must be available before the agent runs.
    pub dependencies: Vec<DataToken>,
    /// Tokens the agent produces.
    pub provides: Vec<DataToken>,
    /// Lower runs first when several agents are ready.
    pub priority: u32,
    /// Rough run time, summed into the plan estimate.
    pub estimated_duration_seconds: f64,
    /// Always included in a plan, even if the analyzer did not ask for it.
    #[serde(default)]
    pub required: bool,
    /// External integration backing this agent; keys the mock-fallback switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<String>,
}

impl AgentDescriptor {
    /// Descriptor with no dependencies or outputs.
    pub fn new(id: impl Into<String>, category: AgentCategory) -> Self {
        Self {
            id: id.into(),
            category,
            description: String::new(),
            dependencies: Vec::new(),
            provides: Vec::new(),
            priority: 100,
            estimated_duration_seconds: 10.0,
            required: false,
            integration: None,
        }
    }

    /// Set the description.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Set the tokens the agent needs.
    pub fn depends_on(mut self, tokens: impl IntoIterator<Item = DataToken>) -> Self {
        self.dependencies = tokens.into_iter().collect();
        self
    }

    /// Set the tokens the agent produces.
    pub fn provides(mut self, tokens: impl IntoIterator<Item = DataToken>) -> Self {
        self.provides = tokens.into_iter().collect();
        self
    }

    /// Set the ordering rank.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the duration estimate.
    pub fn duration(mut self, seconds: f64) -> Self {
        self.estimated_duration_seconds = seconds;
        self
    }

    /// Include the agent in every plan.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Name the backing integration.
    pub fn integration(mut self, name: impl Into<String>) -> Self {
        self.integration = Some(name.into());
        self
    }

    /// Whether the agent produces one of the data-source tokens.
    pub fn is_data_provider(&self) -> bool {
        self.provides.iter().any(|t| t.is_data_source())
    }

    /// Whether the agent consumes the aggregate of all data sources.
    pub fn needs_all_data(&self) -> bool {
        self.dependencies.contains(&DataToken::AllData)
    }
}

/// Immutable catalog of known agents plus the alias table used to resolve
/// free-form names coming from the task analyzer.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDescriptor>,
    aliases: HashMap<String, String>,
}

impl AgentRegistry {
    /// Start an empty registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Descriptor by canonical id.
    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(id)
    }

    /// Descriptor by canonical id, as an error when unknown.
    pub fn lookup(&self, id: &str) -> WimiResult<&AgentDescriptor> {
        self.agents
            .get(id)
            .ok_or_else(|| WimiError::NotFound(format!("agent '{id}'")))
    }

    /// Whether `id` is a canonical agent id.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Map an alias, category name or canonical id onto a canonical id.
    /// Matching ignores case and surrounding whitespace.
    pub fn resolve_alias(&self, name: &str) -> WimiResult<String> {
        let key = normalize(name);
        if self.agents.contains_key(&key) {
            return Ok(key);
        }
        self.aliases
            .get(&key)
            .cloned()
            .ok_or_else(|| WimiError::NotFound(format!("no agent matches '{name}'")))
    }

    /// All descriptors ordered by priority, then id.
    pub fn list(&self) -> Vec<&AgentDescriptor> {
        let mut all: Vec<&AgentDescriptor> = self.agents.values().collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Agents that every plan must contain.
    pub fn required_agents(&self) -> Vec<&AgentDescriptor> {
        self.list().into_iter().filter(|a| a.required).collect()
    }

    /// Agents that produce `token`, in priority order.
    pub fn providers_of(&self, token: DataToken) -> Vec<&AgentDescriptor> {
        self.list()
            .into_iter()
            .filter(|a| a.provides.contains(&token))
            .collect()
    }

    /// Number of agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether there are no agents.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The vendor-inquiry catalog: planner, gmail, invoice, salesforce, analysis.
    pub fn default_catalog() -> Self {
        let builder = Self::builder()
            .agent(planner_agent())
            .agent(gmail_agent())
            .agent(invoice_agent())
            .agent(salesforce_agent())
            .agent(analysis_agent())
            .alias("planning", "planner")
            .alias("mail", "gmail")
            .alias("ap", "invoice")
            .alias("coupa", "invoice")
            .alias("erp", "invoice")
            .alias("salesforce_crm", "salesforce")
            .alias("analyze", "analysis")
            .alias("summary", "analysis");
        match builder.build() {
            Ok(registry) => registry,
            // Every alias above targets a catalog id.
            Err(_) => Self {
                agents: BTreeMap::new(),
                aliases: HashMap::new(),
            },
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::default_catalog()
    }
}

/// Collects descriptors and aliases, then freezes them into a registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    agents: Vec<AgentDescriptor>,
    aliases: Vec<(String, String)>,
}

impl RegistryBuilder {
    /// Add a descriptor.
    pub fn agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.agents.push(descriptor);
        self
    }

    /// Map `alias` onto the canonical id `target`.
    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.push((alias.into(), target.into()));
        self
    }

    /// Fails on duplicate ids, empty ids or aliases pointing at unknown agents.
    pub fn build(self) -> WimiResult<AgentRegistry> {
        let mut agents = BTreeMap::new();
        for mut descriptor in self.agents {
            descriptor.id = normalize(&descriptor.id);
            if descriptor.id.is_empty() {
                return Err(WimiError::Config("agent id must not be empty".into()));
            }
            if agents.contains_key(&descriptor.id) {
                return Err(WimiError::Config(format!(
                    "duplicate agent id '{}'",
                    descriptor.id
                )));
            }
            agents.insert(descriptor.id.clone(), descriptor);
        }

        let mut aliases = HashMap::new();

        // A category name resolves to its agent when the category is unambiguous.
        let mut by_category: HashMap<&'static str, Vec<&str>> = HashMap::new();
        for d in agents.values() {
            by_category.entry(d.category.as_str()).or_default().push(&d.id);
        }
        for (category, ids) in by_category {
            if let [only] = ids.as_slice() {
                if !agents.contains_key(category) {
                    aliases.insert(category.to_string(), (*only).to_string());
                }
            }
        }

        for (alias, target) in self.aliases {
            let target = normalize(&target);
            if !agents.contains_key(&target) {
                return Err(WimiError::Config(format!(
                    "alias '{alias}' targets unknown agent '{target}'"
                )));
            }
            aliases.insert(normalize(&alias), target);
        }

        Ok(AgentRegistry { agents, aliases })
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

fn planner_agent() -> AgentDescriptor {
    AgentDescriptor::new("planner", AgentCategory::Coordination)
        .describe("Breaks the inquiry into an execution plan for the other agents")
        .provides([DataToken::ExecutionPlan])
        .priority(1)
        .duration(5.0)
        .required()
}

fn gmail_agent() -> AgentDescriptor {
    AgentDescriptor::new("gmail", AgentCategory::Email)
        .describe("Searches vendor correspondence for invoice and payment threads")
        .depends_on([DataToken::VendorInfo])
        .provides([DataToken::EmailData])
        .priority(2)
        .duration(20.0)
        .integration("gmail")
}

fn invoice_agent() -> AgentDescriptor {
    AgentDescriptor::new("invoice", AgentCategory::AccountsPayable)
        .describe("Looks up invoices and payment status in the accounts-payable system")
        .depends_on([DataToken::VendorInfo, DataToken::EmailData])
        .provides([DataToken::ApData])
        .priority(3)
        .duration(25.0)
        .integration("coupa")
}

fn salesforce_agent() -> AgentDescriptor {
    AgentDescriptor::new("salesforce", AgentCategory::Crm)
        .describe("Fetches account ownership and open cases from the CRM")
        .depends_on([DataToken::VendorInfo])
        .provides([DataToken::CrmData])
        .priority(4)
        .duration(15.0)
        .integration("salesforce")
}

fn analysis_agent() -> AgentDescriptor {
    AgentDescriptor::new("analysis", AgentCategory::Analysis)
        .describe("Correlates the gathered data into a single answer for the requester")
        .depends_on([DataToken::AllData])
        .provides([DataToken::AnalysisReport])
        .priority(5)
        .duration(30.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let registry = AgentRegistry::default_catalog();
        assert_eq!(registry.len(), 5);
        let ids: Vec<&str> = registry.list().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["planner", "gmail", "invoice", "salesforce", "analysis"]);
        assert_eq!(registry.required_agents().len(), 1);
        assert!(registry.get("analysis").unwrap().needs_all_data());
        assert!(registry.get("invoice").unwrap().is_data_provider());
        assert!(!registry.get("planner").unwrap().is_data_provider());
    }

    #[test]
    fn test_alias_resolution() {
        let registry = AgentRegistry::default_catalog();
        assert_eq!(registry.resolve_alias("email").unwrap(), "gmail");
        assert_eq!(registry.resolve_alias("Mail").unwrap(), "gmail");
        assert_eq!(registry.resolve_alias(" accounts_payable ").unwrap(), "invoice");
        assert_eq!(registry.resolve_alias("Accounts Payable").unwrap(), "invoice");
        assert_eq!(registry.resolve_alias("crm").unwrap(), "salesforce");
        assert_eq!(registry.resolve_alias("summary").unwrap(), "analysis");
        assert_eq!(registry.resolve_alias("invoice").unwrap(), "invoice");
        assert!(matches!(
            registry.resolve_alias("fax"),
            Err(WimiError::NotFound(_))
        ));
    }

    #[test]
    fn test_providers_of() {
        let registry = AgentRegistry::default_catalog();
        let providers: Vec<&str> = registry
            .providers_of(DataToken::EmailData)
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(providers, vec!["gmail"]);
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let result = AgentRegistry::builder()
            .agent(AgentDescriptor::new("crm", AgentCategory::Crm))
            .agent(AgentDescriptor::new("CRM", AgentCategory::Crm))
            .build();
        assert!(matches!(result, Err(WimiError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_dangling_alias() {
        let result = AgentRegistry::builder()
            .agent(AgentDescriptor::new("crm", AgentCategory::Crm))
            .alias("sales", "sales_cloud")
            .build();
        assert!(matches!(result, Err(WimiError::Config(_))));
    }

    #[test]
    fn test_ambiguous_category_has_no_alias() {
        let registry = AgentRegistry::builder()
            .agent(AgentDescriptor::new("gmail", AgentCategory::Email))
            .agent(AgentDescriptor::new("outlook", AgentCategory::Email))
            .build()
            .unwrap();
        assert!(registry.resolve_alias("email").is_err());
        assert_eq!(registry.resolve_alias("outlook").unwrap(), "outlook");
    }
}
