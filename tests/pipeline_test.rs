//! End-to-end pipeline behaviour
//!
//! These tests drive the whole engine through its public surface and verify:
//! 1. Single-task requests complete with their callback's response
//! 2. Retry budgets produce the right attempt counts, and the final errored
//!    attempt is recorded when the budget runs out
//! 3. Stage timeouts and context cancellation are terminal, preserving the
//!    responses recorded so far
//! 4. Bridges feed each stage's payload into the next, and a bridge error
//!    short-circuits every remaining stage
//! 5. Replica fan-out records the fastest response
//! 6. Requests spread across workers least-loaded first

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use seira::core::{task_data, BridgeConnection, FutureTask, Request, ResponseError, TaskResponse};
use seira::executor::Balancer;
use seira::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Honours `RUST_LOG` so a failing run can be re-examined with engine logs.
/// `try_init` because every test in this binary shares the process.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn ok_task(data: &'static str) -> FutureTask {
    FutureTask::new(move |_conn| async move { TaskResponse::ok(200, data) })
        .with_second_timeout(1)
}

fn forward(data: seira::TaskData) -> BridgeConnection {
    BridgeConnection::carrying(vec![data])
}

#[tokio::test]
async fn single_task_success() {
    init_tracing();
    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), ok_task("R3"));

    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    let responses = request.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, 200);
    assert_eq!(responses[0].data_as::<&str>(), Some(&"R3"));
    assert!(responses[0].error.is_none());

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_record_the_final_errored_attempt() {
    init_tracing();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let task = FutureTask::new(move |_conn| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            TaskResponse {
                code: 404,
                data: Some(task_data("R1")),
                error: Some(Arc::new(std::io::Error::other("service down"))),
            }
        }
    })
    .with_second_timeout(1)
    .with_retry(2);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), task);
    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    // retry = 2 means one initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let response = request.only_response().unwrap();
    assert_eq!(response.code, 404);
    assert_eq!(response.data_as::<&str>(), Some(&"R1"));
    assert!(response.error.is_some());

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn retry_zero_means_a_single_attempt() {
    init_tracing();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let task = FutureTask::new(move |_conn| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            TaskResponse::fail(500, "nope")
        }
    })
    .with_second_timeout(1);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), task);
    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(request.only_response().unwrap().error.is_some());

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn a_success_within_the_retry_budget_looks_like_a_clean_run() {
    init_tracing();
    // Budget idempotence: the final response is the successful one no
    // matter how many earlier attempts errored.
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let task = FutureTask::new(move |_conn| {
        let seen = seen.clone();
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                TaskResponse::fail(503, "warming up")
            } else {
                TaskResponse::ok(200, "finally")
            }
        }
    })
    .with_second_timeout(1)
    .with_retry(3);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), task);
    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let response = request.only_response().unwrap();
    assert_eq!(response.code, 200);
    assert!(response.error.is_none());
    assert_eq!(response.data_as::<&str>(), Some(&"finally"));

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn stage_timeout_is_terminal_with_no_retry() {
    init_tracing();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let task = FutureTask::new(move |_conn| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            TaskResponse::ok(200, "too late")
        }
    })
    .with_millisecond_timeout(100)
    .with_retry(2);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), task);
    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    // The timer fired before the callback published; the retry budget does
    // not apply to timeouts.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(request.response(0), Err(ResponseError::Empty)));

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn four_stage_chain_delivers_in_stage_order() {
    init_tracing();
    let stage = |data: &'static str| {
        FutureTask::named(data, move |_conn| async move { TaskResponse::ok(200, data) })
            .with_second_timeout(1)
    };

    let balancer = Balancer::new(2, 4);
    let request = Request::new(CancellationToken::new(), stage("R1"))
        .followed_by(forward, stage("R2"))
        .followed_by(forward, stage("R3"))
        .followed_by(forward, stage("R4"));

    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    let responses = request.responses();
    assert_eq!(responses.len(), 4);
    for (index, expected) in ["R1", "R2", "R3", "R4"].iter().enumerate() {
        assert_eq!(responses[index].data_as::<&str>(), Some(expected));
    }

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn chain_composition_feeds_the_bridged_payload_forward() {
    init_tracing();
    let observed = Arc::new(std::sync::Mutex::new(None));
    let sink = observed.clone();

    let first = ok_task("seed");
    let second = FutureTask::new(move |conn: BridgeConnection| {
        let sink = sink.clone();
        async move {
            if let Ok(mut slot) = sink.lock() {
                *slot = conn.first_as::<String>().cloned();
            }
            TaskResponse::ok(200, "done")
        }
    })
    .with_second_timeout(1);

    let balancer = Balancer::new(1, 2);
    let request = Request::new(CancellationToken::new(), first).followed_by(
        |data| {
            let seed = data.downcast_ref::<&str>().copied().unwrap_or_default();
            BridgeConnection::carrying(vec![task_data(format!("{seed}-bridged"))])
        },
        second,
    );

    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    assert_eq!(
        observed.lock().unwrap().as_deref(),
        Some("seed-bridged"),
        "the second stage must see exactly what the bridge produced"
    );

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn mid_chain_timeout_preserves_earlier_responses() {
    init_tracing();
    let slow = FutureTask::named("slow", |_conn| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        TaskResponse::ok(200, "R3")
    })
    .with_millisecond_timeout(100);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), ok_task("R1"))
        .followed_by(forward, ok_task("R2"))
        .followed_by(forward, slow)
        .followed_by(forward, ok_task("R4"));

    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    let responses = request.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].data_as::<&str>(), Some(&"R1"));
    assert_eq!(responses[1].data_as::<&str>(), Some(&"R2"));
    assert!(matches!(
        request.response(2),
        Err(ResponseError::OutOfRange { index: 2 })
    ));

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn cancelling_the_context_abandons_the_request() {
    init_tracing();
    let ctx = CancellationToken::new();
    let task = FutureTask::new(|_conn| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        TaskResponse::ok(200, "unreachable")
    })
    .with_second_timeout(2);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(ctx.clone(), task);
    balancer.post_job(&request).await.unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
    });

    request.completed().await;
    canceller.await.unwrap();

    assert!(matches!(request.response(0), Err(ResponseError::Empty)));

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn bridge_error_short_circuits_the_remaining_stages() {
    init_tracing();
    let balancer = Balancer::new(2, 4);
    let request = Request::new(CancellationToken::new(), ok_task("R1"))
        .followed_by(forward, ok_task("R2"))
        .followed_by(|_data| BridgeConnection::failed("Test Error"), ok_task("R3"))
        .followed_by(forward, ok_task("R4"));

    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    let responses = request.responses();
    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0].data_as::<&str>(), Some(&"R1"));
    assert_eq!(responses[1].data_as::<&str>(), Some(&"R2"));
    for index in 2..4 {
        assert_eq!(responses[index].code, -1);
        assert!(responses[index].response_time.is_none());
        let error = responses[index].error.clone().expect("synthesised failure");
        assert_eq!(error.to_string(), "Test Error");
    }

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn replica_fan_out_records_the_fastest_response() {
    init_tracing();
    // Each invocation claims a rank; rank 0 responds immediately, the rest
    // dawdle. The winner must be the immediate one.
    let rank = Arc::new(AtomicU32::new(0));
    let counter = rank.clone();
    let task = FutureTask::new(move |_conn| {
        let counter = counter.clone();
        async move {
            let mine = counter.fetch_add(1, Ordering::SeqCst);
            if mine > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            TaskResponse::ok(200, mine)
        }
    })
    .with_second_timeout(1)
    .with_replica(3);

    let balancer = Balancer::new(1, 1);
    let request = Request::new(CancellationToken::new(), task);
    balancer.post_job(&request).await.unwrap();
    request.completed().await;

    let response = request.only_response().unwrap();
    assert_eq!(response.data_as::<u32>(), Some(&0));

    // All three replicas were launched even though only one was recorded.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(rank.load(Ordering::SeqCst), 3);

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn requests_spread_across_idle_workers() {
    init_tracing();
    // Four slow requests on four workers must overlap; a serial engine
    // would need four times as long.
    let balancer = Balancer::new(4, 1);
    let slow_task = || {
        FutureTask::new(|_conn| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            TaskResponse::ok(200, "slept")
        })
        .with_second_timeout(2)
    };

    let requests: Vec<Request> = (0..4)
        .map(|_| Request::new(CancellationToken::new(), slow_task()))
        .collect();

    let started = Instant::now();
    for request in &requests {
        balancer.post_job(request).await.unwrap();
    }
    for request in &requests {
        request.completed().await;
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(600),
        "four 200ms requests took {elapsed:?}, workers are not running in parallel"
    );
    for request in &requests {
        assert_eq!(request.only_response().unwrap().code, 200);
    }

    balancer.close().await.unwrap();
}

#[tokio::test]
async fn close_ack_waits_for_every_accepted_request() {
    init_tracing();
    let balancer = Balancer::new(2, 2);
    let requests: Vec<Request> = (0..4)
        .map(|_| {
            Request::new(
                CancellationToken::new(),
                FutureTask::new(|_conn| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    TaskResponse::ok(200, "drained")
                })
                .with_second_timeout(2),
            )
        })
        .collect();

    for request in &requests {
        balancer.post_job(request).await.unwrap();
    }
    balancer.close().await.expect("ack fires once the fleet drains");

    for request in &requests {
        let response = request.only_response().expect("request ran before teardown");
        assert_eq!(response.code, 200);
    }
}
