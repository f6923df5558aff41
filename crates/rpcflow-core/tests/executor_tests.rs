//! End-to-end scheduler tests: ordering, parallelism, retries, timeouts,
//! stop propagation, and failure handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use rpcflow_core::error::FlowError;
use rpcflow_core::{ExecutorOptions, FlowExecutor, handler_fn};
use rpcflow_core::definition::parse_flow_yaml;
use rpcflow_types::error::ErrorKind;
use rpcflow_types::event::FlowEvent;

/// Drain every event currently buffered on a subscription.
fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Linear chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let flow = parse_flow_yaml(
        r#"
name: chain
description: a feeds b feeds c
steps:
  - name: a
    request:
      method: test.a
      params: {}
  - name: b
    request:
      method: test.b
      params:
        from: "${a.result}"
  - name: c
    request:
      method: test.c
      params:
        from: "${b.result}"
"#,
    )
    .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let calls_ref = Arc::clone(&calls);
    let handler = handler_fn(move |request, _signal| {
        let calls = Arc::clone(&calls_ref);
        async move {
            calls.lock().unwrap().push((request.method.clone(), request.params.clone()));
            Ok(json!({ "result": request.method }))
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let mut rx = executor.subscribe();
    let results = executor.execute().await.unwrap();

    let recorded = calls.lock().unwrap().clone();
    let methods: Vec<&str> = recorded.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(methods, vec!["test.a", "test.b", "test.c"]);
    assert_eq!(recorded[1].1, json!({ "from": "test.a" }));
    assert_eq!(results["b"].result, json!("test.b"));
    assert_eq!(results.len(), 3);

    // Per-correlation ordering: STEP_START strictly precedes the matching
    // terminal event.
    let events = drain_events(&mut rx);
    let mut started: Vec<&str> = Vec::new();
    for event in &events {
        match event {
            FlowEvent::StepStart { correlation_id, .. } => started.push(correlation_id),
            FlowEvent::StepComplete { correlation_id, .. }
            | FlowEvent::StepError { correlation_id, .. } => {
                assert!(
                    started.contains(&correlation_id.as_str()),
                    "terminal event before start for {correlation_id}"
                );
            }
            _ => {}
        }
    }
    assert!(matches!(events.first(), Some(FlowEvent::FlowStart { .. })));
    assert!(matches!(
        events.last(),
        Some(FlowEvent::FlowFinish { .. }) | Some(FlowEvent::FlowComplete { .. })
    ));
}

// ---------------------------------------------------------------------------
// Parallel branches
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn independent_branches_start_together() {
    let flow = parse_flow_yaml(
        r#"
name: fanout
description: a and b run concurrently, c joins them
steps:
  - name: a
    request: { method: test.a, params: {} }
  - name: b
    request: { method: test.b, params: {} }
  - name: c
    request:
      method: test.c
      params:
        left: "${a.result}"
        right: "${b.result}"
"#,
    )
    .unwrap();

    let starts = Arc::new(Mutex::new(HashMap::new()));
    let starts_ref = Arc::clone(&starts);
    let handler = handler_fn(move |request, _signal| {
        let starts = Arc::clone(&starts_ref);
        async move {
            starts
                .lock()
                .unwrap()
                .insert(request.method.clone(), tokio::time::Instant::now());
            if request.method != "test.c" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(json!({ "result": request.method }))
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let results = executor.execute().await.unwrap();
    assert_eq!(results["c"].result, json!("test.c"));

    let starts = starts.lock().unwrap();
    let start_a = starts["test.a"];
    let start_b = starts["test.b"];
    let start_c = starts["test.c"];
    let gap = if start_a > start_b {
        start_a - start_b
    } else {
        start_b - start_a
    };
    assert!(gap <= Duration::from_millis(5), "a and b start together: {gap:?}");
    assert!(
        start_c >= start_a + Duration::from_millis(50),
        "c waits for both branches"
    );
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn flaky_request_retries_until_success() {
    let flow = parse_flow_yaml(
        r#"
name: retrying
description: a flaky request succeeds on the third attempt
steps:
  - name: flaky
    policies:
      retryPolicy:
        maxAttempts: 3
        backoff:
          initial: 10
        retryableErrors: [network]
    request:
      method: svc.flaky
      params: {}
"#,
    )
    .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_ref = Arc::clone(&attempts);
    let handler = handler_fn(move |_request, _signal| {
        let attempts = Arc::clone(&attempts_ref);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FlowError::Network {
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(json!({ "result": "ok" }))
            }
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let results = executor.execute().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3, "handler invoked exactly 3 times");
    assert_eq!(results["flaky"].result, json!("ok"));
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_raises_max_retries() {
    let flow = parse_flow_yaml(
        r#"
name: exhausted
description: the flaky request never recovers
steps:
  - name: flaky
    policies:
      retryPolicy:
        maxAttempts: 2
        backoff:
          initial: 10
        retryableErrors: [network]
    request:
      method: svc.flaky
      params: {}
"#,
    )
    .unwrap();

    let handler = handler_fn(|_request, _signal| async {
        Err(FlowError::Network {
            message: "still down".to_string(),
        })
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let err = executor.execute().await.unwrap_err();

    // Aggregated as the run's execution error; the per-step failure is the
    // retries-exceeded value.
    match err {
        FlowError::Execution { failed_steps, cause, .. } => {
            assert_eq!(failed_steps, vec!["flaky"]);
            let cause = cause.expect("cause preserved");
            assert_eq!(cause.kind(), ErrorKind::MaxRetriesExceeded);
        }
        other => panic!("expected execution error, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Global timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn global_timeout_cancels_the_run() {
    let flow = parse_flow_yaml(
        r#"
name: deadline
description: two slow sequential steps against a 100ms flow budget
policies:
  global:
    timeout:
      timeout: 100
steps:
  - name: s1
    policies: { timeout: { timeout: 10000 } }
    request: { method: svc.slow, params: {} }
  - name: s2
    policies: { timeout: { timeout: 10000 } }
    request:
      method: svc.after
      params:
        prev: "${s1.result}"
"#,
    )
    .unwrap();

    let handler = handler_fn(|request, signal| async move {
        if request.method == "svc.slow" {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(150)) => {}
                _ = signal.cancelled() => {
                    return Err(FlowError::cancelled_with(signal.cause()));
                }
            }
        }
        Ok(json!({ "result": request.method }))
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let mut rx = executor.subscribe();
    let err = executor.execute().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.to_string().contains("timed out"), "got: {err}");

    let events = drain_events(&mut rx);
    assert!(
        !events.iter().any(|e| matches!(
            e,
            FlowEvent::StepComplete { step_name, .. } if step_name == "s2"
        )),
        "s2 never completes"
    );
    let skip_reason = events.iter().find_map(|e| match e {
        FlowEvent::StepSkip { step_name, reason, .. } if step_name == "s2" => Some(reason.clone()),
        _ => None,
    });
    assert!(
        skip_reason.expect("s2 is skipped").contains("timed out"),
        "skip reason names the timeout"
    );
}

#[tokio::test(start_paused = true)]
async fn per_step_timeout_fails_only_that_step() {
    let flow = parse_flow_yaml(
        r#"
name: slow-step
description: one slow branch times out, the other completes
steps:
  - name: slow
    policies: { timeout: { timeout: 50 } }
    request: { method: svc.slow, params: {} }
  - name: quick
    request: { method: svc.quick, params: {} }
"#,
    )
    .unwrap();

    let handler = handler_fn(|request, signal| async move {
        if request.method == "svc.slow" {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = signal.cancelled() => {
                    return Err(FlowError::cancelled_with(signal.cause()));
                }
            }
        }
        Ok(json!({ "result": request.method }))
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let err = executor.execute().await.unwrap_err();

    match err {
        FlowError::Execution { failed_steps, cause, .. } => {
            assert_eq!(failed_steps, vec!["slow"]);
            assert_eq!(cause.unwrap().kind(), ErrorKind::Timeout);
        }
        other => panic!("expected execution error, got {other}"),
    }
    // The independent branch still completed and kept its result.
    let state = executor.export_state();
    assert_eq!(state.step_results["quick"].result, json!("svc.quick"));
    assert!(!state.step_results.contains_key("slow"));
}

// ---------------------------------------------------------------------------
// Stop propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_step_ends_the_flow_without_error() {
    let flow = parse_flow_yaml(
        r#"
name: stopping
description: a stop between two requests
steps:
  - name: s1
    request: { method: svc.one, params: {} }
  - name: halt
    stop:
      endWorkflow: true
  - name: s2
    request: { method: svc.two, params: {} }
"#,
    )
    .unwrap();

    let called = Arc::new(Mutex::new(Vec::new()));
    let called_ref = Arc::clone(&called);
    let handler = handler_fn(move |request, _signal| {
        let called = Arc::clone(&called_ref);
        async move {
            called.lock().unwrap().push(request.method.clone());
            Ok(json!({ "result": request.method }))
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let mut rx = executor.subscribe();
    let results = executor.execute().await.unwrap();

    assert!(results.contains_key("s1"));
    assert!(results.contains_key("halt"));
    assert!(!results.contains_key("s2"), "s2 must not run after the stop");
    assert_eq!(*called.lock().unwrap(), vec!["svc.one"]);

    let events = drain_events(&mut rx);
    let skip = events.iter().find_map(|e| match e {
        FlowEvent::StepSkip { step_name, reason, .. } if step_name == "s2" => Some(reason.clone()),
        _ => None,
    });
    assert_eq!(skip.as_deref(), Some("flow stopped"));
}

#[tokio::test]
async fn branch_stop_does_not_end_the_flow() {
    let flow = parse_flow_yaml(
        r#"
name: soft-stop
description: a non-terminal stop
steps:
  - name: halt
    stop: {}
  - name: after
    request: { method: svc.after, params: {} }
"#,
    )
    .unwrap();

    let handler = handler_fn(|request, _signal| async move { Ok(json!({ "result": request.method })) });
    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let results = executor.execute().await.unwrap();

    assert_eq!(results["halt"].result, json!({ "endWorkflow": false }));
    assert_eq!(results["after"].result, json!("svc.after"));
}

// ---------------------------------------------------------------------------
// Cycle rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_flow_rejected_before_any_call() {
    let flow = parse_flow_yaml(
        r#"
name: cyclic
description: a and b reference each other
steps:
  - name: a
    request:
      method: svc.a
      params: { from: "${b.result}" }
  - name: b
    request:
      method: svc.b
      params: { from: "${a.result}" }
"#,
    )
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls_ref = Arc::clone(&calls);
    let handler = handler_fn(move |_request, _signal| {
        let calls = Arc::clone(&calls_ref);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    let err = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap_err();
    match err {
        FlowError::CircularDependency { path } => assert_eq!(path, vec!["a", "b", "a"]),
        other => panic!("expected circular dependency, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "handler never invoked");
}

// ---------------------------------------------------------------------------
// Concurrency bound
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn max_concurrency_strictly_bounds_inflight_steps() {
    let flow = parse_flow_yaml(
        r#"
name: bounded
description: four independent requests through a gate of two
policies:
  global:
    execution:
      maxConcurrency: 2
steps:
  - name: w1
    request: { method: svc.work, params: {} }
  - name: w2
    request: { method: svc.work, params: {} }
  - name: w3
    request: { method: svc.work, params: {} }
  - name: w4
    request: { method: svc.work, params: {} }
"#,
    )
    .unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let in_flight_ref = Arc::clone(&in_flight);
    let peak_ref = Arc::clone(&peak);
    let handler = handler_fn(move |_request, _signal| {
        let in_flight = Arc::clone(&in_flight_ref);
        let peak = Arc::clone(&peak_ref);
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "result": "done" }))
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let results = executor.execute().await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "at most 2 steps in flight, saw {}",
        peak.load(Ordering::SeqCst)
    );
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continue_on_failure_aggregates_and_skips_dependents() {
    let flow = parse_flow_yaml(
        r#"
name: partial
description: a failing branch and an independent one
steps:
  - name: bad
    request: { method: svc.bad, params: {} }
  - name: downstream
    request:
      method: svc.downstream
      params: { from: "${bad.result}" }
  - name: independent
    request: { method: svc.fine, params: {} }
"#,
    )
    .unwrap();

    let handler = handler_fn(|request, _signal| async move {
        if request.method == "svc.bad" {
            Err(FlowError::JsonRpc {
                code: -32000,
                message: "backend exploded".to_string(),
                data: None,
            })
        } else {
            Ok(json!({ "result": request.method }))
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let mut rx = executor.subscribe();
    let err = executor.execute().await.unwrap_err();

    match &err {
        FlowError::Execution { failed_steps, .. } => {
            assert_eq!(failed_steps, &vec!["bad".to_string()]);
        }
        other => panic!("expected execution error, got {other}"),
    }

    // The independent branch still ran.
    let state = executor.export_state();
    assert_eq!(state.step_results["independent"].result, json!("svc.fine"));
    assert_eq!(state.last_failed_step_name.as_deref(), Some("bad"));

    let events = drain_events(&mut rx);
    let skip = events.iter().find_map(|e| match e {
        FlowEvent::StepSkip { step_name, reason, .. } if step_name == "downstream" => {
            Some(reason.clone())
        }
        _ => None,
    });
    assert_eq!(skip.as_deref(), Some("dependency failed: bad"));
}

#[tokio::test(start_paused = true)]
async fn abort_flow_cancels_remaining_work() {
    let flow = parse_flow_yaml(
        r#"
name: aborting
description: first failure cancels the slow branch
policies:
  step:
    execution:
      onFailure: abort-flow
steps:
  - name: bad
    request: { method: svc.bad, params: {} }
  - name: slow
    request: { method: svc.slow, params: {} }
"#,
    )
    .unwrap();

    let handler = handler_fn(|request, signal| async move {
        match request.method.as_str() {
            "svc.bad" => Err(FlowError::JsonRpc {
                code: -32000,
                message: "nope".to_string(),
                data: None,
            }),
            _ => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10_000)) => {}
                    _ = signal.cancelled() => {
                        return Err(FlowError::cancelled_with(signal.cause()));
                    }
                }
                Ok(json!({ "result": "too late" }))
            }
        }
    });

    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let started = tokio::time::Instant::now();
    let err = executor.execute().await.unwrap_err();

    // The primary error is the failure itself, not an aggregate.
    assert_eq!(err.kind(), ErrorKind::JsonRpc);
    assert!(
        started.elapsed() < Duration::from_millis(10_000),
        "slow branch was cancelled, not awaited to completion"
    );
}

// ---------------------------------------------------------------------------
// Bodies without executors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aggregate_body_fails_at_execution() {
    let flow = parse_flow_yaml(
        r#"
name: legacy
description: carries an aggregate body
steps:
  - name: agg
    aggregate:
      from: [a, b]
"#,
    )
    .unwrap();

    let handler = handler_fn(|_request, _signal| async move { Ok(Value::Null) });
    let executor = FlowExecutor::new(flow, handler, ExecutorOptions::default()).unwrap();
    let err = executor.execute().await.unwrap_err();
    assert!(
        err.describe(true).contains("no step executor found for step 'agg'"),
        "got: {}",
        err.describe(true)
    );
}
