use fleet_model::*;
use serde_json::json;
use std::time::Duration;

#[test]
fn job_round_trip() {
    let mut job = Job::new(
        "uname -a",
        vec!["web-1".into(), "web-2".into()],
        Duration::from_secs(5),
        Duration::from_millis(30_500),
    );
    job.transition(JobStatus::Running).expect("running");

    let serialized = serde_json::to_string_pretty(&job).expect("serialize job");
    let value: serde_json::Value = serde_json::from_str(&serialized).expect("json");
    assert_eq!(value["status"], json!("running"));
    assert_eq!(value["per_host_timeout"], json!(5000));
    assert_eq!(value["overall_timeout"], json!(30500));

    let restored: Job = serde_json::from_str(&serialized).expect("deserialize job");
    assert_eq!(restored.id, job.id);
    assert_eq!(restored.hosts, vec!["web-1", "web-2"]);
    assert_eq!(restored.overall_timeout, Duration::from_millis(30_500));
    assert!(restored.completed_at.is_none());
}

#[test]
fn job_id_is_transparent_text() {
    let id: JobId = "job-42".parse().expect("parse");
    assert_eq!(serde_json::to_value(&id).unwrap(), json!("job-42"));
    assert!("   ".parse::<JobId>().is_err());
}

#[test]
fn host_result_yaml_round_trip() {
    let result = HostResult::timeout(
        "db-1",
        "partial output".into(),
        "timed out after 1s",
        chrono::Utc::now(),
        Duration::from_millis(1002),
    );

    let yaml = serde_yaml::to_string(&result).expect("serialize result");
    assert!(yaml.contains("status: timeout"));
    let loaded: HostResult = serde_yaml::from_str(&yaml).expect("deserialize result");
    assert_eq!(loaded.status, HostStatus::Timeout);
    assert_eq!(loaded.exit_code, None);
    assert_eq!(loaded.duration, Duration::from_millis(1002));
}

#[test]
fn record_orders_results_by_host_order() {
    let job = Job::new(
        "true",
        vec!["a".into(), "b".into(), "c".into()],
        Duration::from_secs(1),
        Duration::from_secs(2),
    );
    let mut record = JobRecord {
        job,
        results: vec![
            HostResult::cancelled("c", "stopped"),
            HostResult::cancelled("a", "stopped"),
            HostResult::cancelled("b", "stopped"),
        ],
    };
    record.sort_by_host_order();
    let order: Vec<_> = record.results.iter().map(|r| r.host.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(record.count(HostStatus::Cancelled), 3);
    assert!(record.result_for("b").is_some());
}
