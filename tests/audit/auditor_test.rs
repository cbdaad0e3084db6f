//! Tests for `src/audit.rs`.

use callsift::audit::{AuditFinding, IntegrityAuditor, Verdict};
use callsift::checkpoint::{CallState, FailureKind, StateMap};
use callsift::transcript::{SourceSnapshot, TranscriptRecord};
use serde_json::{json, Value};

fn record(id: &str, text: &str) -> TranscriptRecord {
    TranscriptRecord {
        call_id: id.to_owned(),
        transcript: text.to_owned(),
        customer_name: None,
        phone_numbers: Vec::new(),
        case_ids: Vec::new(),
    }
}

fn done(id: &str, result: Value) -> (String, CallState) {
    let mut state = CallState::pending(id, "digest");
    state.complete(result);
    (id.to_owned(), state)
}

fn snapshot(records: Vec<TranscriptRecord>) -> SourceSnapshot {
    match SourceSnapshot::from_records(records) {
        Ok(s) => s,
        Err(err) => panic!("snapshot should build: {err}"),
    }
}

fn finding<'a>(findings: &'a [AuditFinding], field: &str) -> &'a AuditFinding {
    match findings.iter().find(|f| f.field == field) {
        Some(f) => f,
        None => panic!("no finding for {field}: {findings:?}"),
    }
}

#[test]
fn present_case_id_is_consistent_and_invented_one_is_fabricated() {
    let source = snapshot(vec![record(
        "CALL-0001",
        "Customer: my case ID CASE-4471 is still open.",
    )]);
    let states = StateMap::from([done(
        "CALL-0001",
        json!({
            "call_id": "CALL-0001",
            "entities": { "case_ids": ["CASE-4471", "CASE-9999"] }
        }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);

    assert_eq!(
        finding(&report.findings, "entities.case_ids[0]").verdict,
        Verdict::Consistent
    );
    let fabricated = finding(&report.findings, "entities.case_ids[1]");
    assert_eq!(fabricated.verdict, Verdict::Fabricated);
    assert_eq!(fabricated.claimed_value, "CASE-9999");
    assert_eq!(report.summary.fabricated, 1);
    assert_eq!(report.summary.calls_audited, 1);
}

#[test]
fn normalization_matches_spoken_and_lowercase_forms() {
    let source = snapshot(vec![record(
        "CALL-0002",
        "Agent: I have raised ticket TK 20931 for you.",
    )]);
    let states = StateMap::from([done(
        "CALL-0002",
        json!({ "ticket_id": "tk-20931" }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    assert_eq!(
        finding(&report.findings, "ticket_id").verdict,
        Verdict::Consistent
    );
}

#[test]
fn date_or_amount_in_id_field_is_fabricated() {
    let source = snapshot(vec![record(
        "CALL-0003",
        "Visit on 2026-03-02, plan costs 1499.00 rupees.",
    )]);
    let states = StateMap::from([done(
        "CALL-0003",
        json!({ "entities": { "case_ids": ["2026-03-02", "₹1,499"] } }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    let date = finding(&report.findings, "entities.case_ids[0]");
    assert_eq!(date.verdict, Verdict::Fabricated);
    assert!(date.reason.contains("date"));
    let amount = finding(&report.findings, "entities.case_ids[1]");
    assert_eq!(amount.verdict, Verdict::Fabricated);
    assert!(amount.reason.contains("amount"));
}

#[test]
fn free_text_in_id_field_is_unverifiable() {
    let source = snapshot(vec![record("CALL-0004", "Customer refers to an older ticket.")]);
    let states = StateMap::from([done(
        "CALL-0004",
        json!({ "reference": "the previous ticket" }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    assert_eq!(
        finding(&report.findings, "reference").verdict,
        Verdict::Unverifiable
    );
}

#[test]
fn missing_transcript_makes_claims_unverifiable() {
    let source = snapshot(Vec::new());
    let states = StateMap::from([done(
        "CALL-0005",
        json!({ "entities": { "case_ids": ["CASE-1234"] } }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    assert_eq!(
        finding(&report.findings, "entities.case_ids[0]").verdict,
        Verdict::Unverifiable
    );
    assert_eq!(report.summary.unverifiable, 1);
}

#[test]
fn identifiers_inside_free_text_are_checked() {
    let source = snapshot(vec![record(
        "CALL-0006",
        "Customer: my case is CASE-4471.",
    )]);
    let states = StateMap::from([done(
        "CALL-0006",
        json!({ "summary": "Follow-up on CASE-4471, escalated as ESC-5555." }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    assert_eq!(finding(&report.findings, "summary").verdict, Verdict::Consistent);
    let second = finding(&report.findings, "summary#1");
    assert_eq!(second.claimed_value, "ESC-5555");
    assert_eq!(second.verdict, Verdict::Fabricated);
}

#[test]
fn call_id_is_checked_against_the_record() {
    let source = snapshot(vec![record("CALL-0007", "hello")]);
    let states = StateMap::from([
        done("CALL-0007", json!({ "call_id": "1" })),
        done("CALL-0008", json!({ "call_id": "call-0008" })),
    ]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    let by_call = |id: &str| {
        report
            .findings
            .iter()
            .find(|f| f.call_id == id && f.field == "call_id")
            .map(|f| f.verdict)
    };
    assert_eq!(by_call("CALL-0007"), Some(Verdict::Fabricated));
    assert_eq!(by_call("CALL-0008"), Some(Verdict::Consistent));
}

#[test]
fn identifiers_glued_to_punctuation_are_found() {
    let source = snapshot(vec![record(
        "CALL-0010",
        "Agent: opened ref:CASE-4471 yesterday, also CASE-5000/CASE-5001.",
    )]);
    let states = StateMap::from([done(
        "CALL-0010",
        json!({ "entities": { "case_ids": ["CASE-4471", "CASE-5001", "CASE-4470"] } }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    let verdict = |field: &str| finding(&report.findings, field).verdict;
    assert_eq!(verdict("entities.case_ids[0]"), Verdict::Consistent);
    assert_eq!(verdict("entities.case_ids[1]"), Verdict::Consistent);
    assert_eq!(verdict("entities.case_ids[2]"), Verdict::Fabricated);
    assert_eq!(report.summary.fabricated, 1);
}

#[test]
fn own_call_id_in_free_text_is_consistent() {
    let source = snapshot(vec![record("CALL-0001", "Customer: the internet is down.")]);
    let states = StateMap::from([done(
        "CALL-0001",
        json!({ "summary": "In CALL-0001 the customer reported an outage, see CALL-0002." }),
    )]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    let own = finding(&report.findings, "summary");
    assert_eq!(own.claimed_value, "CALL-0001");
    assert_eq!(own.verdict, Verdict::Consistent);
    assert_eq!(finding(&report.findings, "summary#1").verdict, Verdict::Fabricated);
}

#[test]
fn only_done_results_are_audited() {
    let source = snapshot(vec![record("CALL-0009", "nothing")]);
    let mut failed = CallState::pending("CALL-0009", "digest");
    failed.fail(FailureKind::Fatal, "HTTP 400");
    let states = StateMap::from([("CALL-0009".to_owned(), failed)]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    assert!(report.findings.is_empty());
    assert_eq!(report.summary.calls_audited, 0);
}

#[test]
fn findings_are_ordered_and_audit_is_idempotent() {
    let source = snapshot(vec![
        record("CALL-A", "case CASE-1111"),
        record("CALL-B", "case CASE-2222"),
    ]);
    let states = StateMap::from([
        done("CALL-B", json!({ "case_id": "CASE-2222", "call_id": "CALL-B" })),
        done("CALL-A", json!({ "case_id": "CASE-0000", "call_id": "CALL-A" })),
    ]);

    let auditor = IntegrityAuditor::default();
    let first = auditor.audit(&states, &source);
    let second = auditor.audit(&states, &source);
    assert_eq!(first.findings, second.findings);

    let keys: Vec<(&str, &str)> = first
        .findings
        .iter()
        .map(|f| (f.call_id.as_str(), f.field.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("CALL-A", "call_id"),
            ("CALL-A", "case_id"),
            ("CALL-B", "call_id"),
            ("CALL-B", "case_id"),
        ]
    );
}

#[test]
fn report_is_written_atomically_as_json() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("reports/audit_report.json");
    let source = snapshot(vec![record("CALL-1", "case CASE-4471")]);
    let states = StateMap::from([done("CALL-1", json!({ "case_ids": ["CASE-4471"] }))]);

    let report = IntegrityAuditor::default().audit(&states, &source);
    report.write(&path).expect("report should be written");

    let raw = std::fs::read_to_string(&path).expect("report readable");
    let parsed: Value = serde_json::from_str(&raw).expect("report is JSON");
    assert_eq!(parsed["summary"]["consistent"], 1);
    assert_eq!(parsed["findings"][0]["verdict"], "consistent");
    assert!(parsed["generated_at"].is_string());
}
