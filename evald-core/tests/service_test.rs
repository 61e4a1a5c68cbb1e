use std::time::{Duration, Instant};

use evald_core::codec::{Protocol, Request, Response};
use evald_core::config::{DaemonConfig, RegistryConfig, SupervisorConfig, TimeoutPolicy};
use evald_core::service::EvalService;
use evald_core::supervisor::{CONTINUE_MARKER, PROBABLY_TIMED_OUT_MARKER, TIMED_OUT_MARKER};
use pretty_assertions::assert_eq;

fn service_with(supervisor: SupervisorConfig, registry: RegistryConfig) -> EvalService {
    EvalService::from_config(&DaemonConfig {
        supervisor,
        registry,
        ..Default::default()
    })
}

fn service() -> EvalService {
    service_with(SupervisorConfig::default(), RegistryConfig::default())
}

async fn eval(service: &EvalService, key: &str, code: &str) -> Response {
    service.handle(Request::new(0, key, code)).await
}

#[tokio::test]
async fn test_continuation_matches_single_submission() {
    let programs = [
        vec!["let t = 0; let i = 0; while i < 4 {", "t = t + i;", "i = i + 1", "} t"],
        vec!["if 1 < 2 {", "print(\"yes\")", "} else {", "print(\"no\")", "}"],
        vec!["[1,", "2,", "3]"],
        vec!["#{ \"a\":", "1 }"],
        vec!["len(range(", "10))"],
        vec!["1 +", "2 *", "3"],
    ];

    for lines in programs {
        let whole = eval(&service(), "k", &lines.join("\n")).await;

        let split = service();
        let (last, prefix) = lines.split_last().unwrap();
        for line in prefix {
            assert_eq!(eval(&split, "k", line).await.text, CONTINUE_MARKER, "{line}");
        }
        assert_eq!(eval(&split, "k", last).await, whole, "{lines:?}");
    }
}

#[tokio::test]
async fn test_multiline_block_reports_continue_until_closed() {
    let service = service();
    assert_eq!(eval(&service, "k", "let i = 0;").await.text, "");
    assert_eq!(eval(&service, "k", "while i < 3 {").await.text, CONTINUE_MARKER);
    assert_eq!(eval(&service, "k", "print(i);").await.text, CONTINUE_MARKER);
    assert_eq!(eval(&service, "k", "i = i + 1").await.text, CONTINUE_MARKER);
    assert_eq!(eval(&service, "k", "}").await.text, "0\n1\n2\n");
    assert_eq!(eval(&service, "k", "i").await.text, "3");
}

#[tokio::test]
async fn test_context_isolation() {
    let service = service();
    eval(&service, "alice", "let name = \"alice\";").await;
    eval(&service, "bob", "let name = 'b';").await;
    eval(&service, "bob", "if true {").await;

    assert_eq!(eval(&service, "alice", "name").await.text, "\"alice\"");
    assert_eq!(eval(&service, "carol", "name").await.text, "error: undefined variable `name`");
    // Bob's open block does not leak into the other sessions.
    assert_eq!(eval(&service, "bob", "name }").await.text, "");
    assert_eq!(eval(&service, "bob", "name").await.text, "'b'");
}

#[tokio::test]
async fn test_empty_input_leaves_pending_alone() {
    let service = service();
    assert_eq!(eval(&service, "k", "[1,").await.text, CONTINUE_MARKER);
    for _ in 0..3 {
        assert_eq!(eval(&service, "k", "  \n ").await, Response::success(""));
    }
    assert_eq!(eval(&service, "k", "2]").await.text, "{ 1, 2 }");
}

#[tokio::test]
async fn test_value_rendering() {
    let service = service();
    let cases = [
        ("null", "null"),
        ("[1, \"a\"]", "{ 1, \"a\" }"),
        ("[]", "{  }"),
        ("'\\n'", "'\\n'"),
        ("#{1: 'x', \"k\": [true]}", "{{ 1, 'x' }, { \"k\", { true } }}"),
        ("print(\"out\"); 1 + 1", "out\n2"),
        ("\"say \\\"hi\\\"\"", "\"say \\\"hi\\\"\""),
        ("PI > 3.14 && PI < 3.15", "true"),
    ];
    for (code, expected) in cases {
        assert_eq!(eval(&service, "k", code).await.text, expected, "{code}");
    }
}

#[tokio::test]
async fn test_errors_keep_output_and_clear_pending() {
    let service = service();
    assert_eq!(
        eval(&service, "k", "print(\"before\"); error(\"boom\")").await.text,
        "before\nerror: boom"
    );
    assert_eq!(eval(&service, "k", "(1 +").await.text, CONTINUE_MARKER);
    assert!(eval(&service, "k", ")").await.text.starts_with("syntax error:"));
    assert_eq!(eval(&service, "k", "1").await.text, "1");
}

#[tokio::test]
async fn test_cooperative_timeout_is_deterministic() {
    let grace = Duration::from_millis(500);
    let service = service_with(
        SupervisorConfig {
            cancel_grace: grace,
            ..Default::default()
        },
        RegistryConfig::default(),
    );

    let started = Instant::now();
    let response = service.handle(Request::new(100, "k", "sleep(60000)")).await;
    let elapsed = started.elapsed();

    assert_eq!(response.text, TIMED_OUT_MARKER);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(100) + grace, "{elapsed:?}");
    // The session is usable straight away.
    assert_eq!(eval(&service, "k", "1 + 1").await.text, "2");
}

#[tokio::test]
async fn test_blocking_code_is_abandoned() {
    let service = service_with(
        SupervisorConfig {
            cancel_grace: Duration::from_millis(50),
            ..Default::default()
        },
        RegistryConfig::default(),
    );

    let response = service.handle(Request::new(50, "k", "block(400); print(\"late\")")).await;
    assert_eq!(response.text, PROBABLY_TIMED_OUT_MARKER);

    // Other keys are unaffected while the worker is stuck.
    assert_eq!(eval(&service, "other", "7").await.text, "7");
    // The same key waits for the worker and never sees its output.
    assert_eq!(eval(&service, "k", "8").await.text, "8");
}

async fn timeout_after_prefix(policy: TimeoutPolicy) -> (String, String) {
    let service = service_with(
        SupervisorConfig {
            cancel_grace: Duration::from_millis(500),
            timeout_policy: policy,
            ..Default::default()
        },
        RegistryConfig::default(),
    );

    assert_eq!(eval(&service, "k", "if true {").await.text, CONTINUE_MARKER);
    let timed_out = service.handle(Request::new(30, "k", "sleep(60000) }")).await;
    assert_eq!(timed_out.text, TIMED_OUT_MARKER);

    let retried = eval(&service, "k", "print(\"retry\") }").await.text;
    let fresh = eval(&service, "k", "1").await.text;
    (retried, fresh)
}

#[tokio::test]
async fn test_timeout_discards_pending_source() {
    let (retried, fresh) = timeout_after_prefix(TimeoutPolicy::Discard).await;
    // The open block was dropped, so the stray brace is an error.
    assert!(retried.starts_with("syntax error:"), "{retried}");
    assert_eq!(fresh, "1");
}

#[tokio::test]
async fn test_timeout_preserves_pending_source() {
    let (retried, fresh) = timeout_after_prefix(TimeoutPolicy::Preserve).await;
    // The open block is still pending and the retry completes it.
    assert_eq!(retried, "retry\n");
    assert_eq!(fresh, "1");
}

#[tokio::test]
async fn test_timeout_cap_bounds_unlimited_requests() {
    let service = service_with(
        SupervisorConfig {
            timeout_cap: Some(Duration::from_millis(50)),
            ..Default::default()
        },
        RegistryConfig::default(),
    );
    let response = service.handle(Request::new(0, "k", "while true { }")).await;
    assert_eq!(response, Response::failure(TIMED_OUT_MARKER));
}

#[tokio::test]
async fn test_requests_for_one_key_run_in_order() {
    let service = service();
    eval(&service, "k", "let log = [];").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            eval(&service, "k", &format!("sleep(5); log = push(log, {i});")).await
        }));
        // Let each request queue before the next one is issued.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }
    assert_eq!(
        eval(&service, "k", "log").await.text,
        "{ 0, 1, 2, 3, 4, 5, 6, 7 }"
    );
}

#[tokio::test]
async fn test_lru_eviction_forgets_state() {
    let service = service_with(
        SupervisorConfig::default(),
        RegistryConfig {
            max_sessions: Some(2),
            ..Default::default()
        },
    );
    eval(&service, "a", "let v = 1;").await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    eval(&service, "b", "let v = 2;").await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    eval(&service, "a", "v").await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    eval(&service, "c", "let v = 3;").await;

    assert_eq!(service.registry().len(), 2);
    assert_eq!(eval(&service, "a", "v").await.text, "1");
    assert_eq!(eval(&service, "b", "v").await.text, "error: undefined variable `v`");
}

#[tokio::test]
async fn test_legacy_protocol_shares_one_session() {
    let service = EvalService::from_config(&DaemonConfig {
        protocol: Protocol::Legacy,
        ..Default::default()
    });
    service.handle(Request::new(0, "", "let shared = 1;")).await;
    let response = service.handle(Request::new(0, "", "shared + 1")).await;
    assert_eq!(response, Response::success("2"));
}

#[tokio::test]
async fn test_deeply_nested_input_is_an_error_not_a_crash() {
    let service = service();

    let negations = format!("{}1", "-".repeat(200_000));
    let response = service.handle(Request::new(2000, "k", negations)).await;
    assert!(response.success);
    assert!(response.text.starts_with("syntax error: nesting deeper than"), "{}", response.text);

    let wrapping = "let x = []; let i = 0; while i < 60000 { x = [x]; i = i + 1 } x";
    let response = service.handle(Request::new(2000, "k", wrapping)).await;
    assert!(response.text.starts_with("error: values nested deeper than"), "{}", response.text);

    // The session survives both and keeps its bindings.
    assert_eq!(eval(&service, "k", "i").await.text, "127");
}
