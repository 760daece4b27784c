use std::cell::RefCell;
use std::time::Duration;

use assert_matches::assert_matches;

use boundary_vault::error::{FailureKind, VaultError};
use boundary_vault::overpass::{AttemptError, HttpReply, RetryPolicy, fetch_with_rotation};

fn endpoints() -> Vec<String> {
    vec![
        "https://primary.example/api/interpreter".to_string(),
        "https://mirror.example/api/interpreter".to_string(),
    ]
}

fn reply(status: u16, content_type: &str, body: &str) -> HttpReply {
    HttpReply {
        status,
        content_type: Some(content_type.to_string()),
        body: body.to_string(),
    }
}

const OK_BODY: &str = r#"{"version":0.6,"elements":[{"type":"relation","id":1}]}"#;

#[test]
fn transient_status_is_retried_on_same_endpoint() {
    let calls = RefCell::new(Vec::new());
    let sleeps = RefCell::new(Vec::new());
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 100,
    };

    let response = fetch_with_rotation(
        &endpoints(),
        &policy,
        |endpoint| {
            calls.borrow_mut().push(endpoint.to_string());
            if calls.borrow().len() == 1 {
                Ok(reply(503, "text/html", "<html>busy</html>"))
            } else {
                Ok(reply(200, "application/json", OK_BODY))
            }
        },
        |delay| sleeps.borrow_mut().push(delay),
    )
    .unwrap();

    assert_eq!(response.endpoint, endpoints()[0]);
    assert_eq!(response.raw_text, OK_BODY);
    assert_eq!(response.elements().len(), 1);
    assert_eq!(calls.borrow().as_slice(), &[endpoints()[0].clone(), endpoints()[0].clone()]);
    assert_eq!(sleeps.borrow().as_slice(), &[Duration::from_millis(100)]);
}

#[test]
fn exhausted_endpoint_rotates_to_mirror() {
    let calls = RefCell::new(Vec::new());
    let sleeps = RefCell::new(Vec::new());
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
    };

    let response = fetch_with_rotation(
        &endpoints(),
        &policy,
        |endpoint| {
            calls.borrow_mut().push(endpoint.to_string());
            if endpoint.contains("primary") {
                Err(AttemptError::new(FailureKind::Transient, "connection refused"))
            } else {
                Ok(reply(200, "application/json", OK_BODY))
            }
        },
        |delay| sleeps.borrow_mut().push(delay),
    )
    .unwrap();

    assert_eq!(response.endpoint, endpoints()[1]);
    assert_eq!(calls.borrow().len(), 4);
    assert_eq!(
        sleeps.borrow().as_slice(),
        &[Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[test]
fn backoff_sequence_doubles_and_surfaces_last_error() {
    let sleeps = RefCell::new(Vec::new());
    let policy = RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 50,
    };
    let attempt = RefCell::new(0);

    let err = fetch_with_rotation(
        &endpoints(),
        &policy,
        |_| {
            *attempt.borrow_mut() += 1;
            if *attempt.borrow() == 8 {
                Ok(reply(200, "text/html", "<html>rate limited</html>"))
            } else {
                Ok(reply(429, "application/json", "{}"))
            }
        },
        |delay| sleeps.borrow_mut().push(delay.as_millis()),
    )
    .unwrap_err();

    assert_eq!(*attempt.borrow(), 8);
    assert_eq!(
        sleeps.borrow().as_slice(),
        &[50, 100, 200, 50, 100, 200]
    );
    assert_matches!(
        err,
        VaultError::FetchFailed { ref endpoint, kind: FailureKind::Malformed, .. }
            if endpoint.contains("mirror")
    );
}

#[test]
fn out_of_memory_remark_fails_as_too_large() {
    let body = r#"{"elements":[],"remark":"runtime error: Query run out of memory using about 2048 MB of RAM."}"#;
    let err = fetch_with_rotation(
        &endpoints(),
        &RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
        },
        |_| Ok(reply(200, "application/json", body)),
        |_| {},
    )
    .unwrap_err();

    assert_eq!(err.failure_kind(), Some(FailureKind::TooLarge));
}
