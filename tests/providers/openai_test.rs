//! OpenAI-compatible provider wire format tests.

use std::time::Duration;

use callsift::credentials::ApiKey;
use callsift::providers::openai::{build_request, parse_response, OpenAiProvider, ResponseFormat};
use callsift::providers::{CompletionRequest, LlmProvider, Message, Role, StopReason};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn simple_request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message {
            role: Role::User,
            content: "Call ID: CALL-1".to_owned(),
        }],
        system: Some("Extract JSON.".to_owned()),
        max_tokens: Some(256),
        temperature: Some(0.0),
        json_output: true,
    }
}

#[test]
fn build_request_sets_model_system_and_json_mode() {
    let req = build_request("gpt-4o-mini", &simple_request());
    assert_eq!(req.model, "gpt-4o-mini");
    assert_eq!(req.max_tokens, Some(256));
    assert_eq!(req.temperature, Some(0.0));
    assert_eq!(
        req.response_format,
        Some(ResponseFormat {
            kind: "json_object".to_owned()
        })
    );
    assert_eq!(req.messages.len(), 2);
    assert_eq!(req.messages[0].role, "system");
    assert_eq!(req.messages[0].content, "Extract JSON.");
    assert_eq!(req.messages[1].role, "user");
}

#[test]
fn build_request_serializes_response_format_type() {
    let req = build_request("gpt-4o-mini", &simple_request());
    let body = serde_json::to_value(&req).expect("serialize");
    assert_eq!(body["response_format"]["type"], "json_object");
}

#[test]
fn build_request_without_json_mode_omits_format() {
    let mut request = simple_request();
    request.json_output = false;
    request.system = None;
    request.max_tokens = None;
    request.temperature = None;

    let req = build_request("gpt-4o-mini", &request);
    assert!(req.response_format.is_none());
    assert_eq!(req.max_tokens, Some(2048));
    assert_eq!(req.messages.len(), 1);

    let body = serde_json::to_value(&req).expect("serialize");
    assert!(body.get("response_format").is_none());
    assert!(body.get("temperature").is_none());
}

#[test]
fn parse_response_text_and_usage() {
    let body = json!({
        "choices": [{
            "message": {"role": "assistant", "content": "{\"summary\": \"ok\"}"},
            "finish_reason": "stop"
        }],
        "model": "gpt-4o-mini",
        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
    });

    let resp = parse_response(&body.to_string()).expect("should parse");
    assert_eq!(resp.stop_reason, StopReason::EndTurn);
    assert_eq!(resp.model, "gpt-4o-mini");
    assert_eq!(resp.text, "{\"summary\": \"ok\"}");
    let usage = resp.usage.expect("usage reported");
    assert_eq!(usage.total(), 15);
}

#[test]
fn parse_response_without_usage_reports_none() {
    let body = json!({
        "choices": [{"message": {"content": "{}"}, "finish_reason": "stop"}],
        "model": "gpt-4o-mini"
    });
    let resp = parse_response(&body.to_string()).expect("should parse");
    assert!(resp.usage.is_none());
}

#[test]
fn parse_response_maps_finish_reasons() {
    for (reason, expected) in [
        ("length", StopReason::MaxTokens),
        ("content_filter", StopReason::ContentFilter),
        ("tool_calls", StopReason::Other("tool_calls".to_owned())),
    ] {
        let body = json!({
            "choices": [{"message": {"content": ""}, "finish_reason": reason}],
            "model": "gpt-4o-mini"
        });
        let resp = parse_response(&body.to_string()).expect("should parse");
        assert_eq!(resp.stop_reason, expected, "finish_reason {reason}");
    }
}

#[test]
fn parse_response_without_choices_is_error() {
    let body = json!({"choices": [], "model": "gpt-4o-mini"});
    assert!(parse_response(&body.to_string()).is_err());
}

#[test]
fn parse_response_rejects_non_json() {
    assert!(parse_response("not json at all").is_err());
}

#[test]
fn provider_reports_model_id() {
    let provider = OpenAiProvider::new(
        "https://api.groq.com/openai/v1/chat/completions".to_owned(),
        "llama-3.3-70b-versatile".to_owned(),
        ApiKey::new("test-key"),
        Duration::from_secs(30),
    )
    .expect("client builds");
    assert_eq!(provider.model_id(), "llama-3.3-70b-versatile");
}

/// Accept one HTTP request, hand its raw text back, and answer with `body`.
async fn serve_json_once(body: String) -> (String, oneshot::Receiver<String>) {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => panic!("listener should bind: {err}"),
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => panic!("listener should expose local addr: {err}"),
    };
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end.saturating_add(4).saturating_add(content_length) {
                    break;
                }
            }
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
    });

    (format!("http://{addr}/v1/chat/completions"), rx)
}

#[tokio::test]
async fn complete_posts_bearer_json_request() {
    let reply = json!({
        "choices": [{"message": {"content": "{\"call_id\": \"CALL-1\"}"}, "finish_reason": "stop"}],
        "model": "gpt-4o-mini",
        "usage": {"prompt_tokens": 40, "completion_tokens": 12}
    })
    .to_string();
    let (url, seen) = serve_json_once(reply).await;

    let provider = OpenAiProvider::new(
        url,
        "gpt-4o-mini".to_owned(),
        ApiKey::new("sk-test-key"),
        Duration::from_secs(5),
    )
    .expect("client builds");

    let resp = provider
        .complete(simple_request())
        .await
        .expect("completion succeeds");
    assert_eq!(resp.text, "{\"call_id\": \"CALL-1\"}");
    assert_eq!(resp.usage.map(|u| u.total()), Some(52));

    let raw = seen.await.expect("request captured");
    let lower = raw.to_ascii_lowercase();
    assert!(raw.starts_with("POST /v1/chat/completions"));
    assert!(lower.contains("authorization: bearer sk-test-key"));
    assert!(raw.contains("\"json_object\""));
    assert!(raw.contains("\"model\":\"gpt-4o-mini\""));
}
