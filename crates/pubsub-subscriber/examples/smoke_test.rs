//! Smoke test: publish a set of payloads through the in-process backend and
//! verify each arrives once, in order, on the right channel.
//!
//! ```sh
//! cargo run -p pubsub-subscriber --example smoke_test
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pubsub_subscriber::memory::MemoryBackend;
use pubsub_subscriber::{
    Callbacks, Client, ClientConfig, Envelope, EventKind, StatusCategory, SubscribeOptions,
    UnsubscribeOptions, wait,
};

/// A test case: publish `data` on `channel`, expect it back unchanged.
struct TestCase {
    label: &'static str,
    channel: &'static str,
    data: serde_json::Value,
    signal: bool,
}

fn test_cases() -> Vec<TestCase> {
    vec![
        TestCase {
            label: "json-object",
            channel: "ch1",
            data: serde_json::json!({"key": "value"}),
            signal: false,
        },
        TestCase {
            label: "json-array",
            channel: "ch2",
            data: serde_json::json!([1, 2, 3]),
            signal: false,
        },
        TestCase {
            label: "string",
            channel: "ch1",
            data: serde_json::json!("hello world"),
            signal: false,
        },
        TestCase {
            label: "unicode",
            channel: "ch3",
            data: serde_json::json!("héllo wörld 🌍"),
            signal: false,
        },
        TestCase {
            label: "number",
            channel: "ch2",
            data: serde_json::json!(42.5),
            signal: false,
        },
        TestCase {
            label: "null",
            channel: "ch3",
            data: serde_json::Value::Null,
            signal: false,
        },
        TestCase {
            label: "signal",
            channel: "ch1",
            data: serde_json::json!({"typing": true}),
            signal: true,
        },
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let backend = MemoryBackend::new();
    let client = Client::new(backend.transport("smoke-reader"), ClientConfig::default())?;

    let received: Arc<Mutex<Vec<Envelope>>> = Arc::default();
    let sink = Arc::clone(&received);
    client.add_listener(Callbacks::new().on_message(move |_, env| {
        if let Ok(mut r) = sink.lock() {
            r.push(env.clone());
        }
    }));

    let subscribed = client.wait_for(
        wait::status(StatusCategory::Subscribed),
        Duration::from_secs(5),
    );
    client.subscribe(SubscribeOptions::channels(["ch1", "ch2", "ch3"]));
    let status = subscribed.await?;
    eprintln!("[subscribed] {:?}", status.status_payload().map(|s| &s.channels));

    let cases = test_cases();
    let last = cases.len();
    let done = client.wait_for(
        {
            let received = Arc::clone(&received);
            move |env: &Envelope| {
                env.message().is_some()
                    && received.lock().map(|r| r.len() >= last).unwrap_or(false)
            }
        },
        Duration::from_secs(5),
    );
    for case in &cases {
        if case.signal {
            backend.signal("smoke-writer", case.channel, case.data.clone());
        } else {
            client.publish(case.channel, &case.data).await?;
        }
    }
    done.await?;

    let received = received.lock().map_err(|_| "listener panicked")?.clone();
    let mut failures = 0;
    for (case, env) in cases.iter().zip(&received) {
        let expected_kind = if case.signal {
            EventKind::Signal
        } else {
            EventKind::Message
        };
        let ok = env.channel == case.channel
            && env.kind() == expected_kind
            && env.message().map(|m| &m.data) == Some(&case.data);
        if ok {
            eprintln!("  PASS {}", case.label);
        } else {
            eprintln!("  FAIL {}: got {:?}", case.label, env);
            failures += 1;
        }
    }
    if received.len() != cases.len() {
        eprintln!("  FAIL expected {} envelopes, got {}", cases.len(), received.len());
        failures += 1;
    }

    let unsubscribed = client.wait_for(
        wait::status(StatusCategory::Unsubscribed),
        Duration::from_secs(5),
    );
    client.unsubscribe(UnsubscribeOptions::channels(["ch1", "ch2", "ch3"]));
    unsubscribed.await?;
    client.stop();

    if failures > 0 {
        return Err(format!("{failures} check(s) failed").into());
    }
    eprintln!("all {} cases passed", cases.len());
    Ok(())
}
