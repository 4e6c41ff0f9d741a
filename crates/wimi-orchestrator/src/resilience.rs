use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use wimi_core::{
    span_secs, Clock, ErrorCategory, Notification, NotificationChannel, NotificationKind, Severity,
    WimiError,
};
use wimi_telemetry::{EventType, LogEvent, TelemetryLog};

/// Bounds and thresholds of the resilience manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Errors per window above which the system reports UNSTABLE.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Length of the rolling error window.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Errors kept per plan.
    #[serde(default = "default_plan_history")]
    pub plan_history: usize,
    /// Errors kept across all plans.
    #[serde(default = "default_global_history")]
    pub global_history: usize,
    /// Initial mock-fallback switches per integration, all off unless listed.
    #[serde(default)]
    pub mock_fallback: HashMap<String, bool>,
}

fn default_error_threshold() -> u32 {
    50
}

fn default_window_secs() -> u64 {
    3600
}

fn default_plan_history() -> usize {
    100
}

fn default_global_history() -> usize {
    1000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            window_secs: default_window_secs(),
            plan_history: default_plan_history(),
            global_history: default_global_history(),
            mock_fallback: HashMap::new(),
        }
    }
}

/// A recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Event id.
    pub id: String,
    /// Plan the error belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Taxonomy category.
    pub category: ErrorCategory,
    /// Severity of the category.
    pub severity: Severity,
    /// Agent that failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// Extra details, e.g. the step index.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Fixture data replaced the failed output.
    pub mock_fallback_used: bool,
}

/// Aggregate health over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityStatus {
    /// Within the error budget.
    Stable,
    /// A critical error occurred in the current window.
    Degraded,
    /// More errors than the threshold in the current window.
    Unstable,
}

/// Runtime-readable mock-fallback switches, one per integration.
///
/// Read on every failure, never cached, so operators can flip a switch
/// while plans are running.
pub trait FallbackSwitches: Send + Sync {
    /// Whether fixture data may replace a failed call to `integration`.
    fn mock_enabled(&self, integration: &str) -> bool;
}

/// In-process switches, changeable at runtime.
#[derive(Debug, Default)]
pub struct StaticFallbackSwitches {
    switches: RwLock<HashMap<String, bool>>,
}

impl StaticFallbackSwitches {
    /// Switches keyed by integration name, case-insensitive.
    pub fn new(initial: HashMap<String, bool>) -> Self {
        let switches = initial
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            switches: RwLock::new(switches),
        }
    }

    /// Turn one integration's fallback on or off.
    pub fn set(&self, integration: &str, enabled: bool) {
        info!(integration, enabled, "Mock fallback switch changed");
        self.switches
            .write()
            .insert(integration.to_ascii_lowercase(), enabled);
    }
}

impl FallbackSwitches for StaticFallbackSwitches {
    fn mock_enabled(&self, integration: &str) -> bool {
        self.switches
            .read()
            .get(&integration.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }
}

/// Switches read from `WIMI_MOCK_<INTEGRATION>` environment variables.
/// `1`, `true`, `yes` and `on` enable the fallback.
#[derive(Debug, Clone)]
pub struct EnvFallbackSwitches {
    prefix: String,
}

impl EnvFallbackSwitches {
    /// Read `WIMI_MOCK_*` variables.
    pub fn new() -> Self {
        Self::with_prefix("WIMI_MOCK_")
    }

    /// Read variables named `<prefix><INTEGRATION>`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn variable(&self, integration: &str) -> String {
        format!("{}{}", self.prefix, integration.to_ascii_uppercase().replace('-', "_"))
    }
}

impl Default for EnvFallbackSwitches {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackSwitches for EnvFallbackSwitches {
    fn mock_enabled(&self, integration: &str) -> bool {
        std::env::var(self.variable(integration))
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

/// A failed agent step as reported to [`ResilienceManager::handle_step_failure`].
#[derive(Debug, Clone)]
pub struct StepFailure<'a> {
    /// Plan being executed.
    pub plan_id: &'a str,
    /// Agent that failed.
    pub agent_id: &'a str,
    /// Integration backing the agent.
    pub integration: Option<&'a str>,
    /// Classified failure.
    pub category: ErrorCategory,
    /// Error text.
    pub message: String,
    /// The executor has a fixture for the agent.
    pub fixture_available: bool,
    /// Extra details recorded with the event.
    pub context: BTreeMap<String, serde_json::Value>,
}

/// Returned by [`ResilienceManager::handle_step_failure`].
#[derive(Debug, Clone)]
pub struct FallbackDecision {
    /// The recorded error.
    pub event: ErrorEvent,
    /// Substitute fixture data for the failed step.
    pub use_mock: bool,
}

struct ResilienceState {
    per_plan: HashMap<String, VecDeque<ErrorEvent>>,
    global: VecDeque<ErrorEvent>,
    window_start: DateTime<Utc>,
    window_count: u32,
    critical_in_window: bool,
    last_status: StabilityStatus,
}

/// Classifies failures, keeps bounded error histories, escalates HIGH and
/// CRITICAL errors and decides on mock fallback.
pub struct ResilienceManager {
    state: Mutex<ResilienceState>,
    config: ResilienceConfig,
    switches: Arc<dyn FallbackSwitches>,
    escalation: Option<Arc<dyn NotificationChannel>>,
    telemetry: Arc<TelemetryLog>,
    clock: Arc<dyn Clock>,
}

impl ResilienceManager {
    /// Manager with an empty history and a window starting now.
    pub fn new(
        config: ResilienceConfig,
        switches: Arc<dyn FallbackSwitches>,
        telemetry: Arc<TelemetryLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(ResilienceState {
                per_plan: HashMap::new(),
                global: VecDeque::new(),
                window_start: now,
                window_count: 0,
                critical_in_window: false,
                last_status: StabilityStatus::Stable,
            }),
            config,
            switches,
            escalation: None,
            telemetry,
            clock,
        }
    }

    /// Send HIGH and CRITICAL errors to `channel`.
    pub fn with_escalation(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.escalation = Some(channel);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Category and severity of an error.
    pub fn classify(err: &WimiError) -> (ErrorCategory, Severity) {
        let category = err.category();
        (category, category.severity())
    }

    /// Record an error that has no fallback path.
    pub fn handle(
        &self,
        plan_id: Option<&str>,
        category: ErrorCategory,
        message: impl Into<String>,
        source_agent: Option<&str>,
        context: BTreeMap<String, serde_json::Value>,
    ) -> ErrorEvent {
        self.record(plan_id, category, message.into(), source_agent, context, false)
    }

    /// Record a failed agent step and decide whether fixture data may stand
    /// in for it. Only external-service failures of an agent backed by an
    /// integration whose switch is on qualify, and only when the executor
    /// actually has a fixture.
    pub fn handle_step_failure(&self, failure: StepFailure<'_>) -> FallbackDecision {
        let use_mock = failure.category.is_external_service_failure()
            && failure.fixture_available
            && failure
                .integration
                .is_some_and(|i| self.switches.mock_enabled(i));
        let event = self.record(
            Some(failure.plan_id),
            failure.category,
            failure.message,
            Some(failure.agent_id),
            failure.context,
            use_mock,
        );
        if use_mock {
            warn!(
                plan_id = failure.plan_id,
                agent = failure.agent_id,
                "Substituting fixture data for failed agent"
            );
            self.telemetry.log(
                LogEvent::new(
                    EventType::MockFallback,
                    format!("fixture data used for {}", failure.agent_id),
                )
                .plan(failure.plan_id)
                .agent(failure.agent_id)
                .severity(Severity::Medium)
                .meta("error_event_id", event.id.clone()),
            );
        }
        FallbackDecision { event, use_mock }
    }

    /// Aggregate health as of now.
    pub fn stability(&self) -> StabilityStatus {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll_window(&mut state, now);
        self.evaluate(&state)
    }

    /// Errors recorded in the current window.
    pub fn errors_in_window(&self) -> u32 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll_window(&mut state, now);
        state.window_count
    }

    /// Errors of one plan, oldest first.
    pub fn plan_errors(&self, plan_id: &str) -> Vec<ErrorEvent> {
        self.state
            .lock()
            .per_plan
            .get(plan_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `limit` most recent errors across all plans, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEvent> {
        self.state
            .lock()
            .global
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop the per-plan history of `plan_id`. The global history and the
    /// window count are untouched.
    pub fn forget_plan(&self, plan_id: &str) {
        self.state.lock().per_plan.remove(plan_id);
    }

    /// Number of plans with a per-plan history.
    pub fn tracked_plans(&self) -> usize {
        self.state.lock().per_plan.len()
    }

    /// Look an error event up by id in the global history.
    pub fn find(&self, event_id: &str) -> Option<ErrorEvent> {
        self.state
            .lock()
            .global
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
    }

    fn record(
        &self,
        plan_id: Option<&str>,
        category: ErrorCategory,
        message: String,
        source_agent: Option<&str>,
        context: BTreeMap<String, serde_json::Value>,
        mock_fallback_used: bool,
    ) -> ErrorEvent {
        let now = self.clock.now();
        let severity = category.severity();
        let event = ErrorEvent {
            id: format!("err_{}", Uuid::new_v4().simple()),
            plan_id: plan_id.map(str::to_string),
            category,
            severity,
            source_agent: source_agent.map(str::to_string),
            message,
            timestamp: now,
            context,
            mock_fallback_used,
        };

        let (previous, current) = {
            let mut state = self.state.lock();
            self.roll_window(&mut state, now);
            state.window_count += 1;
            if severity == Severity::Critical {
                state.critical_in_window = true;
            }

            if let Some(plan_id) = plan_id {
                let history = state.per_plan.entry(plan_id.to_string()).or_default();
                history.push_back(event.clone());
                while history.len() > self.config.plan_history {
                    history.pop_front();
                }
            }
            state.global.push_back(event.clone());
            while state.global.len() > self.config.global_history {
                state.global.pop_front();
            }

            let previous = state.last_status;
            let current = self.evaluate(&state);
            state.last_status = current;
            (previous, current)
        };

        if current != previous {
            warn!(from = ?previous, to = ?current, "System stability changed");
        }

        let mut log = LogEvent::new(EventType::ErrorRecorded, event.message.clone())
            .severity(severity)
            .meta("error_type", category.to_string())
            .meta("error_event_id", event.id.clone())
            .meta("mock_fallback_used", mock_fallback_used);
        if let Some(plan_id) = plan_id {
            log = log.plan(plan_id);
        }
        if let Some(agent) = source_agent {
            log = log.agent(agent);
        }
        self.telemetry.log(log);

        if severity.escalates() {
            error!(
                error_event_id = %event.id,
                category = %category,
                severity = %severity,
                "Escalating error: {}", event.message
            );
            self.escalate(&event);
        }
        event
    }

    fn escalate(&self, event: &ErrorEvent) {
        let Some(channel) = &self.escalation else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(error_event_id = %event.id, "No runtime for escalation delivery");
            return;
        };
        let channel = Arc::clone(channel);
        let notification = Notification::new(
            event.plan_id.clone().unwrap_or_default(),
            NotificationKind::Escalation,
            format!("[{}] {}: {}", event.severity, event.category, event.message),
        )
        .with_payload(serde_json::to_value(event).unwrap_or_default());
        handle.spawn(async move {
            if let Err(e) = channel.send(notification).await {
                warn!(error = %e, "Escalation delivery failed");
            }
        });
    }

    fn roll_window(&self, state: &mut ResilienceState, now: DateTime<Utc>) {
        let window = span_secs(self.config.window_secs);
        if now - state.window_start >= window {
            state.window_start = now;
            state.window_count = 0;
            state.critical_in_window = false;
        }
    }

    fn evaluate(&self, state: &ResilienceState) -> StabilityStatus {
        if state.window_count > self.config.error_threshold {
            StabilityStatus::Unstable
        } else if state.critical_in_window {
            StabilityStatus::Degraded
        } else {
            StabilityStatus::Stable
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wimi_core::ManualClock;
    use wimi_telemetry::TelemetryConfig;

    fn manager(clock: Arc<ManualClock>, switches: Arc<dyn FallbackSwitches>) -> ResilienceManager {
        manager_with(ResilienceConfig::default(), clock, switches)
    }

    fn manager_with(
        config: ResilienceConfig,
        clock: Arc<ManualClock>,
        switches: Arc<dyn FallbackSwitches>,
    ) -> ResilienceManager {
        let telemetry = Arc::new(TelemetryLog::with_clock(TelemetryConfig::default(), clock.clone()));
        ResilienceManager::new(config, switches, telemetry, clock)
    }

    fn step<'a>(
        agent_id: &'a str,
        integration: Option<&'a str>,
        category: ErrorCategory,
        fixture_available: bool,
    ) -> StepFailure<'a> {
        StepFailure {
            plan_id: "p1",
            agent_id,
            integration,
            category,
            message: format!("{agent_id} failed"),
            fixture_available,
            context: BTreeMap::new(),
        }
    }

    fn off() -> Arc<dyn FallbackSwitches> {
        Arc::new(StaticFallbackSwitches::default())
    }

    #[test]
    fn test_errors_are_classified() {
        let clock = Arc::new(ManualClock::starting_now());
        let m = manager(clock, off());
        let event = m.handle(Some("p1"), ErrorCategory::Network, "reset", Some("gmail"), BTreeMap::new());
        assert_eq!(event.severity, Severity::High);
        assert!(event.id.starts_with("err_"));
        assert_eq!(m.plan_errors("p1").len(), 1);
        assert_eq!(m.find(&event.id).unwrap().source_agent.as_deref(), Some("gmail"));
        assert_eq!(
            ResilienceManager::classify(&WimiError::Resource("oom".into())),
            (ErrorCategory::Resource, Severity::Critical)
        );
    }

    #[test]
    fn test_threshold_crossing_and_window_reset() {
        let clock = Arc::new(ManualClock::starting_now());
        let m = manager(clock.clone(), off());
        for _ in 0..50 {
            m.handle(None, ErrorCategory::Validation, "bad", None, BTreeMap::new());
        }
        assert_eq!(m.stability(), StabilityStatus::Stable);
        m.handle(None, ErrorCategory::Validation, "bad", None, BTreeMap::new());
        assert_eq!(m.errors_in_window(), 51);
        assert_eq!(m.stability(), StabilityStatus::Unstable);

        clock.advance(chrono::Duration::seconds(3601));
        assert_eq!(m.stability(), StabilityStatus::Stable);
        assert_eq!(m.errors_in_window(), 0);
    }

    #[test]
    fn test_critical_error_degrades() {
        let clock = Arc::new(ManualClock::starting_now());
        let m = manager(clock.clone(), off());
        m.handle(None, ErrorCategory::System, "panic", None, BTreeMap::new());
        assert_eq!(m.stability(), StabilityStatus::Degraded);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(m.stability(), StabilityStatus::Stable);
    }

    #[test]
    fn test_histories_are_bounded() {
        let clock = Arc::new(ManualClock::starting_now());
        let m = manager(clock, off());
        for i in 0..120 {
            m.handle(Some("p1"), ErrorCategory::UserInput, format!("e{i}"), None, BTreeMap::new());
        }
        let history = m.plan_errors("p1");
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].message, "e20");
        assert_eq!(m.recent_errors(1)[0].message, "e119");
    }

    #[test]
    fn test_mock_fallback_requires_switch_and_fixture() {
        let clock = Arc::new(ManualClock::starting_now());
        let switches = Arc::new(StaticFallbackSwitches::default());
        let m = manager(clock, switches.clone());

        let d = m.handle_step_failure(step("gmail", Some("gmail"), ErrorCategory::Network, true));
        assert!(!d.use_mock);
        assert!(!d.event.mock_fallback_used);

        switches.set("GMAIL", true);
        let d = m.handle_step_failure(step("gmail", Some("gmail"), ErrorCategory::Network, true));
        assert!(d.use_mock);
        assert!(d.event.mock_fallback_used);

        let d = m.handle_step_failure(step("gmail", Some("gmail"), ErrorCategory::Network, false));
        assert!(!d.use_mock);

        let d = m.handle_step_failure(step("gmail", Some("gmail"), ErrorCategory::Timeout, true));
        assert!(!d.use_mock);

        let d = m.handle_step_failure(step("analysis", None, ErrorCategory::AgentFailure, true));
        assert!(!d.use_mock);
    }

    #[test]
    fn test_env_switches() {
        let switches = EnvFallbackSwitches::with_prefix("WIMI_TEST_MOCK_RESILIENCE_");
        assert!(!switches.mock_enabled("coupa"));
        std::env::set_var("WIMI_TEST_MOCK_RESILIENCE_COUPA", "Yes");
        assert!(switches.mock_enabled("coupa"));
        std::env::set_var("WIMI_TEST_MOCK_RESILIENCE_COUPA", "0");
        assert!(!switches.mock_enabled("coupa"));
        std::env::remove_var("WIMI_TEST_MOCK_RESILIENCE_COUPA");
    }

    #[test]
    fn test_errors_reach_telemetry() {
        let clock = Arc::new(ManualClock::starting_now());
        let telemetry = Arc::new(TelemetryLog::with_clock(TelemetryConfig::default(), clock.clone()));
        let m = ResilienceManager::new(ResilienceConfig::default(), off(), telemetry.clone(), clock);
        m.handle(Some("p1"), ErrorCategory::Timeout, "late", None, BTreeMap::new());
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.top_errors[0].error_type, "TIMEOUT");
    }

    #[test]
    fn test_unbounded_window_keeps_counting() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = ResilienceConfig {
            window_secs: u64::MAX,
            error_threshold: 1,
            ..ResilienceConfig::default()
        };
        let rm = manager_with(config, clock.clone(), off());
        rm.handle(Some("p1"), ErrorCategory::Network, "down", None, BTreeMap::new());
        clock.advance(chrono::Duration::days(3650));
        rm.handle(Some("p1"), ErrorCategory::Network, "down", None, BTreeMap::new());
        assert_eq!(rm.errors_in_window(), 2);
        assert_eq!(rm.stability(), StabilityStatus::Unstable);
    }

    #[test]
    fn test_forget_plan_keeps_global_history() {
        let rm = manager(Arc::new(ManualClock::starting_now()), off());
        rm.handle(Some("p1"), ErrorCategory::Network, "down", None, BTreeMap::new());
        rm.handle(Some("p2"), ErrorCategory::Network, "down", None, BTreeMap::new());
        assert_eq!(rm.tracked_plans(), 2);

        rm.forget_plan("p1");
        assert_eq!(rm.tracked_plans(), 1);
        assert!(rm.plan_errors("p1").is_empty());
        assert_eq!(rm.recent_errors(10).len(), 2);
        assert_eq!(rm.errors_in_window(), 2);
    }
}
