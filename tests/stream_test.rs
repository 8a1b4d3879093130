//! Streaming integrity tests against a live proxy.
//!
//! Usage:
//!   cargo test --test stream_test -- --nocapture
//!
//! Environment:
//!   RELAY_TEST_HOST  (default http://127.0.0.1:1188)
//!   RELAY_TEST_KEY   (default sk-test)
//!
//! These tests exercise a running instance end to end and skip themselves
//! when no server (or no valid upstream credential) is reachable:
//!   1. single streaming request — SSE stream is well formed and ends
//!      with message_stop
//!   2. single non-streaming request — JSON envelope shape
//!   3. concurrent streams — every stream completes independently

use std::time::Duration;

fn base_url() -> String {
    std::env::var("RELAY_TEST_HOST").unwrap_or_else(|_| "http://127.0.0.1:1188".to_string())
}

fn api_key() -> String {
    std::env::var("RELAY_TEST_KEY").unwrap_or_else(|_| "sk-test".to_string())
}

fn make_request_body(stream: bool, prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "stream": stream,
        "messages": [
            {
                "role": "user",
                "content": prompt
            }
        ]
    })
}

/// Consume an SSE response. Returns (text content, event-name sequence).
async fn consume_sse_stream(
    response: reqwest::Response,
) -> Result<(String, Vec<String>), String> {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut raw = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("stream chunk error: {e}"))?;
        raw.extend_from_slice(&chunk);
    }

    let text = String::from_utf8_lossy(&raw).to_string();
    let mut content = String::new();
    let mut names = Vec::new();

    for line in text.lines() {
        if let Some(name) = line.strip_prefix("event: ") {
            names.push(name.to_string());
        }
        if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(data.trim()) {
                if json.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
                    if let Some(t) = json["delta"].get("text").and_then(|v| v.as_str()) {
                        content.push_str(t);
                    }
                }
            }
        }
    }

    Ok((content, names))
}

fn assert_well_formed_sequence(names: &[String]) {
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));

    let starts = names.iter().filter(|n| *n == "content_block_start").count();
    let stops = names.iter().filter(|n| *n == "content_block_stop").count();
    assert_eq!(starts, stops, "unbalanced content blocks");

    let pings = names.iter().filter(|n| *n == "ping").count();
    if starts > 0 {
        assert_eq!(pings, 1, "ping must appear exactly once");
        let first_start = names.iter().position(|n| n == "content_block_start").unwrap();
        assert_eq!(names[first_start + 1], "ping", "ping must follow the first block start");
    }

    assert!(
        names.iter().any(|n| n == "message_delta"),
        "missing message_delta"
    );
}

#[tokio::test]
async fn test_single_stream_completeness() {
    let client = reqwest::Client::new();
    let url = format!("{}/v1/messages", base_url());

    let body = make_request_body(true, "Reply with a short greeting.");

    let resp = match client
        .post(&url)
        .header("x-api-key", api_key())
        .header("Content-Type", "application/json")
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .timeout(Duration::from_secs(120))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            println!("request failed (server not running?): {e}");
            println!("skipping; expected server at {}", base_url());
            return;
        }
    };

    let status = resp.status().as_u16();
    if status != 200 {
        let body = resp.text().await.unwrap_or_default();
        println!("non-200 response ({status}): {body}");
        println!("skipping (likely no valid upstream credential)");
        return;
    }

    let (content, names) = consume_sse_stream(resp).await.expect("SSE parse failed");

    println!("events: {}, content: {} chars", names.len(), content.len());
    assert!(!names.is_empty(), "expected at least one SSE event");
    assert_well_formed_sequence(&names);
}

#[tokio::test]
async fn test_single_non_stream() {
    let client = reqwest::Client::new();
    let url = format!("{}/v1/messages", base_url());

    let body = make_request_body(false, "Reply with one word.");

    let resp = match client
        .post(&url)
        .header("x-api-key", api_key())
        .header("Content-Type", "application/json")
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .timeout(Duration::from_secs(120))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            println!("request failed (server not running?): {e}");
            return;
        }
    };

    let status = resp.status().as_u16();
    if status != 200 {
        let body = resp.text().await.unwrap_or_default();
        println!("non-200 response ({status}): {body}");
        return;
    }

    let json: serde_json::Value = resp.json().await.expect("JSON parse failed");

    assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("message"));
    assert_eq!(json.get("role").and_then(|v| v.as_str()), Some("assistant"));

    let content = json
        .get("content")
        .and_then(|v| v.as_array())
        .expect("content must be an array");
    assert!(!content.is_empty(), "content must not be empty");

    let usage = json.get("usage").expect("usage must be present");
    let input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
    println!("tokens: input={input_tokens}, output={output_tokens}");
    assert!(input_tokens >= 1);
    assert!(output_tokens >= 1);
}

#[tokio::test]
async fn test_concurrent_streams_completeness() {
    let client = reqwest::Client::new();
    let url = format!("{}/v1/messages", base_url());

    let prompts = [
        "Name three colors.",
        "Name three animals.",
        "Name three countries.",
    ];

    let mut handles = Vec::new();
    for (i, prompt) in prompts.iter().enumerate() {
        let client = client.clone();
        let url = url.clone();
        let key = api_key();
        let body = make_request_body(true, prompt);

        handles.push(tokio::spawn(async move {
            let resp = client
                .post(&url)
                .header("x-api-key", key)
                .header("Content-Type", "application/json")
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .timeout(Duration::from_secs(120))
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => return (i, Err(format!("request failed: {e}"))),
            };

            let status = resp.status().as_u16();
            if status != 200 {
                let body = resp.text().await.unwrap_or_default();
                return (i, Err(format!("status {status}: {body}")));
            }

            match consume_sse_stream(resp).await {
                Ok(result) => (i, Ok(result)),
                Err(e) => (i, Err(e)),
            }
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("task panic"));
    }

    let mut successes = 0;
    for (i, result) in &results {
        match result {
            Ok((content, names)) => {
                println!("request #{i}: {} events, {} chars", names.len(), content.len());
                assert_well_formed_sequence(names);
                successes += 1;
            }
            Err(e) => println!("request #{i}: {e}"),
        }
    }

    if successes == 0 {
        println!("all requests failed (server or credential unavailable), skipping assertions");
    }
}
