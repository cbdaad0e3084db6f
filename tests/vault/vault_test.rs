//! Tests for `src/vault/`: tokenization, determinism and rehydration.

use callsift::vault::{Category, Vault, VaultError};
use serde_json::json;

const TRANSCRIPT: &str = "Agent: Thanks for calling. Customer: Hi, this is Priya Sharma. \
My number is +91 9876543210 and my email is priya@example.com. \
The case ID is CASE-4471. Priya Sharma again, please call +91 9876543210.";

fn seeded_vault() -> Vault {
    Vault::with_known_values(vec![(Category::Person, "Priya Sharma".to_owned())])
}

#[test]
fn tokenize_removes_every_sensitive_value() {
    let mut vault = seeded_vault();
    let tokenized = vault.tokenize(TRANSCRIPT);

    assert!(!tokenized.text.contains("Priya Sharma"));
    assert!(!tokenized.text.contains("9876543210"));
    assert!(!tokenized.text.contains("priya@example.com"));
    assert!(!tokenized.text.contains("CASE-4471"));

    assert!(tokenized.text.contains("[REF_PERSON_1]"));
    assert!(tokenized.text.contains("[REF_PHONE_1]"));
    assert!(tokenized.text.contains("[REF_EMAIL_1]"));
    assert!(tokenized.text.contains("[REF_CASE_ID_1]"));
}

#[test]
fn repeated_values_share_one_token() {
    let mut vault = seeded_vault();
    let tokenized = vault.tokenize(TRANSCRIPT);

    assert_eq!(tokenized.text.matches("[REF_PERSON_1]").count(), 2);
    assert_eq!(tokenized.text.matches("[REF_PHONE_1]").count(), 2);
    assert!(!tokenized.text.contains("[REF_PHONE_2]"));
    assert_eq!(tokenized.added.len(), 4, "one entry per distinct value");
    assert_eq!(vault.len(), 4);
}

#[test]
fn tokenize_then_rehydrate_restores_original_text() {
    let mut vault = seeded_vault();
    let tokenized = vault.tokenize(TRANSCRIPT);
    let restored = vault.rehydrate(&tokenized.text);
    assert_eq!(restored, Ok(TRANSCRIPT.to_owned()));
}

#[test]
fn fresh_vaults_issue_identical_tokens() {
    let first = seeded_vault().tokenize(TRANSCRIPT);
    let second = seeded_vault().tokenize(TRANSCRIPT);
    assert_eq!(first.text, second.text);
}

#[test]
fn sequence_follows_first_seen_order() {
    let mut vault = Vault::new();
    let tokenized = vault.tokenize("Tickets TK-2002 and AB-1001, then TK-2002 again.");
    assert_eq!(
        tokenized.text,
        "Tickets [REF_CASE_ID_1] and [REF_CASE_ID_2], then [REF_CASE_ID_1] again."
    );
    assert_eq!(vault.resolve("[REF_CASE_ID_2]"), Some("AB-1001"));
}

#[test]
fn later_calls_extend_the_mapping() {
    let mut vault = Vault::new();
    let first = vault.tokenize("ref CASE-1000");
    let second = vault.tokenize("ref CASE-1000 and CASE-2000");
    assert_eq!(first.added.len(), 1);
    assert_eq!(second.added.len(), 1, "only the new value is reported");
    assert_eq!(second.text, "ref [REF_CASE_ID_1] and [REF_CASE_ID_2]");
}

#[test]
fn unknown_token_is_an_error() {
    let mut vault = Vault::new();
    let _ = vault.tokenize("case CASE-4471");

    let result = vault.rehydrate("see [REF_CASE_ID_1] and [REF_CASE_ID_7]");
    assert_eq!(
        result,
        Err(VaultError::UnknownToken {
            token: "[REF_CASE_ID_7]".to_owned()
        })
    );
}

#[test]
fn tokens_from_another_vault_do_not_resolve() {
    let mut a = Vault::new();
    let mut b = Vault::new();
    let _ = a.tokenize("email a@example.com");
    let _ = b.tokenize("case CASE-1000");

    assert!(b.rehydrate("[REF_EMAIL_1]").is_err());
}

#[test]
fn rehydrate_value_walks_nested_json() {
    let mut vault = seeded_vault();
    let _ = vault.tokenize(TRANSCRIPT);

    let analysis = json!({
        "call_id": "CALL-0001",
        "summary": "[REF_PERSON_1] asked about [REF_CASE_ID_1].",
        "entities": {
            "case_ids": ["[REF_CASE_ID_1]"],
            "plan_prices_inr": [499.0]
        },
        "confidence": 0.9
    });

    let restored = vault.rehydrate_value(&analysis);
    assert_eq!(
        restored,
        Ok(json!({
            "call_id": "CALL-0001",
            "summary": "Priya Sharma asked about CASE-4471.",
            "entities": {
                "case_ids": ["CASE-4471"],
                "plan_prices_inr": [499.0]
            },
            "confidence": 0.9
        }))
    );
}

#[test]
fn rehydrate_value_rejects_unknown_token_anywhere() {
    let vault = Vault::new();
    let analysis = json!({"entities": {"case_ids": ["[REF_CASE_ID_3]"]}});
    assert!(matches!(
        vault.rehydrate_value(&analysis),
        Err(VaultError::UnknownToken { .. })
    ));
}

#[test]
fn text_without_pii_is_unchanged() {
    let mut vault = Vault::new();
    let tokenized = vault.tokenize("The router keeps dropping the connection.");
    assert_eq!(tokenized.text, "The router keeps dropping the connection.");
    assert!(tokenized.added.is_empty());
    assert!(vault.is_empty());
}

#[test]
fn structured_values_outrank_patterns() {
    let mut vault = Vault::with_known_values(vec![(Category::CaseId, "SR-00042".to_owned())]);
    let tokenized = vault.tokenize("Service request SR-00042 opened.");
    assert_eq!(tokenized.text, "Service request [REF_CASE_ID_1] opened.");
    assert_eq!(tokenized.added[0].category, Category::CaseId);
}

#[test]
fn common_phone_formats_are_tokenized() {
    for phone in [
        "+91 98765 43210",
        "98765-43210",
        "+91 9876543210",
        "9876543210",
        "(555) 123-4567",
        "+1 555-123-4567",
    ] {
        let mut vault = Vault::new();
        let tokenized = vault.tokenize(&format!("call {phone} now"));
        assert_eq!(tokenized.text, "call [REF_PHONE_1] now", "format {phone}");
        assert_eq!(vault.resolve("[REF_PHONE_1]"), Some(phone));
    }
}

