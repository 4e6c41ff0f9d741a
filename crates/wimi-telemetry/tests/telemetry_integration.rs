#![allow(clippy::unwrap_used, clippy::expect_used)]

use wimi_core::Severity;
use wimi_telemetry::*;

fn populate(log: &TelemetryLog) -> String {
    let corr = log.start_correlation("plan");
    log.bind_plan("plan_1", &corr);
    log.log(LogEvent::new(EventType::WorkflowStarted, "task submitted").plan("plan_1"));
    log.log(
        LogEvent::new(EventType::AgentCompleted, "gmail finished")
            .plan("plan_1")
            .agent("gmail")
            .success(true)
            .duration(1.5)
            .meta("tokens", serde_json::json!(["EMAIL_DATA"])),
    );
    log.log(LogEvent::new(EventType::WorkflowStarted, "unrelated").plan("plan_2"));
    log.log(
        LogEvent::new(EventType::ErrorRecorded, "invoice lookup failed")
            .plan("plan_1")
            .agent("invoice")
            .severity(Severity::High)
            .meta("error_type", "NETWORK"),
    );
    corr
}

// ---------------------------------------------------------------------------
// Export → import reconstructs the same ordered sequence
// ---------------------------------------------------------------------------

#[test]
fn plan_log_roundtrip_json_and_jsonl() {
    let log = TelemetryLog::default();
    populate(&log);

    let original = log.query(&LogQuery::Plan("plan_1".into()));
    assert_eq!(original.len(), 3);

    for format in [ExportFormat::Json, ExportFormat::Jsonl] {
        let data = log
            .export_query(&LogQuery::Plan("plan_1".into()), format)
            .unwrap();
        let restored = import(&data, format).unwrap();
        assert_eq!(restored, original);
    }
}

#[test]
fn measured_durations_survive_export() {
    let log = TelemetryLog::default();
    for k in 1..=200u32 {
        log.log(
            LogEvent::new(EventType::AgentCompleted, "step finished")
                .plan("plan_1")
                .agent("gmail")
                .success(true)
                .duration(f64::from(k) / 3.0 + 1e-9 * f64::from(k)),
        );
    }
    let started = std::time::Instant::now();
    log.log(
        LogEvent::new(EventType::WorkflowCompleted, "done")
            .plan("plan_1")
            .duration(started.elapsed().as_secs_f64() + 0.1),
    );

    let query = LogQuery::Plan("plan_1".into());
    let original = log.query(&query);
    for format in [ExportFormat::Json, ExportFormat::Jsonl] {
        let restored = import(&log.export_query(&query, format).unwrap(), format).unwrap();
        assert_eq!(restored, original);
    }
}

mod float_export {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_finite_duration_reimports_exactly(secs in 0.0f64..1.0e9) {
            let log = TelemetryLog::default();
            log.log(
                LogEvent::new(EventType::AgentCompleted, "step finished")
                    .plan("plan_1")
                    .success(true)
                    .duration(secs),
            );
            let query = LogQuery::Plan("plan_1".into());
            for format in [ExportFormat::Json, ExportFormat::Jsonl] {
                let restored = import(&log.export_query(&query, format).unwrap(), format).unwrap();
                prop_assert_eq!(restored[0].duration_seconds, Some(secs));
            }
        }
    }
}

#[test]
fn full_export_preserves_arrival_order() {
    let log = TelemetryLog::default();
    let corr = populate(&log);

    let restored = import(&log.export(ExportFormat::Jsonl).unwrap(), ExportFormat::Jsonl).unwrap();
    let seqs: Vec<u64> = restored.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    // plan_2 was never bound, so it inherits the active correlation
    assert!(restored.iter().all(|e| e.correlation_id == corr));
}

#[test]
fn export_format_parsing() {
    assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
    assert_eq!("NDJSON".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
    assert!("xml".parse::<ExportFormat>().is_err());
}

#[test]
fn import_rejects_garbage() {
    assert!(import("not json", ExportFormat::Json).is_err());
    assert!(import("{\"sequence\": 1}\n", ExportFormat::Jsonl).is_err());
}
