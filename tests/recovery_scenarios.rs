/// End-to-end recovery scenarios through the public client API
///
/// All tests run on paused tokio time, so backoff and reconnection delays
/// elapse instantly and can be asserted on.

mod common;

use common::{
    assert_no_document_calls_while_offline, client_with_config, client_with_driver, fatal_error,
    transient_error, unavailable_error,
};
use resilient_docstore::driver::DriverOp;
use resilient_docstore::{ClientConfig, ConnectionState, ErrorClass, Payload, StoreError};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_internal_assertion_mid_update_recovers_and_retries() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    driver.fail_next(DriverOp::UpdateDocument, transient_error());
    driver.fail_next(DriverOp::UpdateDocument, fatal_error());

    let started = Instant::now();
    client
        .update_document("tours/lisbon", Payload::mapping([("price", Payload::from(150u64))]))
        .await
        .unwrap();

    // attempt 1: transient, 2 s backoff
    // attempt 2: fatal, one episode (10 ms settle + 2 x 10 ms cycle), no backoff
    // attempt 3: success
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 3);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2_030), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_100), "elapsed {:?}", elapsed);
    assert_eq!(client.current_state(), ConnectionState::Connected);
    assert_eq!(driver.document("tours/lisbon").unwrap()["price"], json!(150));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_fatal_errors_run_one_episode() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    driver.fail_next(DriverOp::UpdateDocument, fatal_error());
    driver.fail_next(DriverOp::UpdateDocument, fatal_error());
    // both writes are in flight before either failure comes back
    driver.set_latency(DriverOp::UpdateDocument, Duration::from_millis(5));

    let (a, b) = tokio::join!(
        client.update_document("tours/lisbon", Payload::mapping([("seen", Payload::from(true))])),
        client.update_document("tours/porto", Payload::mapping([("seen", Payload::from(true))])),
    );

    a.unwrap();
    b.unwrap();
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 1);
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 4);
    assert_eq!(client.current_state(), ConnectionState::Connected);
    assert_no_document_calls_while_offline(&driver.call_log());
}

#[tokio::test(start_paused = true)]
async fn test_writes_wait_out_an_episode_started_elsewhere() {
    // the network stays down for 3 s, longer than the first backoff step
    let (client, driver) = client_with_config(ClientConfig {
        network_cycle_delay_ms: 3_000,
        ..ClientConfig::default()
    });
    client.initialize().await.unwrap();

    driver.fail_next(DriverOp::UpdateDocument, fatal_error());
    driver.fail_next(DriverOp::UpdateDocument, fatal_error());
    driver.set_latency(DriverOp::UpdateDocument, Duration::from_millis(10));

    // lisbon fails at 10 ms and starts the episode; porto fails at 15 ms, inside it
    let late = client.clone();
    let (a, b) = tokio::join!(
        client.update_document("tours/lisbon", Payload::mapping([("seen", Payload::from(true))])),
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            late.update_document("tours/porto", Payload::mapping([("seen", Payload::from(true))]))
                .await
        },
    );

    a.unwrap();
    b.unwrap();
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 1);
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 4);
    assert_no_document_calls_while_offline(&driver.call_log());
    assert_eq!(driver.document("tours/porto").unwrap()["seen"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_stops_automatic_recovery() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    driver.fail_always(DriverOp::UpdateDocument, fatal_error());
    driver.fail_always(DriverOp::WaitForPendingWrites, unavailable_error());

    let err = client
        .update_document("tours/lisbon", Payload::mapping([("price", Payload::from(1u64))]))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::ConnectionFatal);
    assert_eq!(err.classified().unwrap().attempt, 5);
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 5);
    // five failed episodes spend the whole budget; later triggers are refused
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 5);
    assert_eq!(client.current_state(), ConnectionState::Error);
    assert!(driver.is_network_enabled());

    // Further operations do not start new episodes
    let _ = client.read_document("tours/lisbon").await;
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 5);

    // A manual reconnect resets the budget once the store is healthy again
    driver.clear_faults(DriverOp::WaitForPendingWrites);
    driver.clear_faults(DriverOp::UpdateDocument);
    assert_eq!(client.force_reconnect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 6);

    client
        .update_document("tours/lisbon", Payload::mapping([("price", Payload::from(1u64))]))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_force_reconnect_observes_one_outcome() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let (a, b, c) = tokio::join!(
        client.force_reconnect(),
        client.force_reconnect(),
        client.force_reconnect()
    );

    assert_eq!(a.unwrap(), ConnectionState::Connected);
    assert_eq!(b.unwrap(), ConnectionState::Connected);
    assert_eq!(c.unwrap(), ConnectionState::Connected);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_probes_heal_error_state() {
    let (client, driver) = client_with_driver();

    // Initial probe is fatal and so is the verify of the episode it starts
    driver.fail_next(DriverOp::WaitForPendingWrites, fatal_error());
    driver.fail_next(DriverOp::WaitForPendingWrites, fatal_error());
    let err = client.initialize().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ConnectionFatal);
    assert_eq!(client.current_state(), ConnectionState::Error);

    // The first scheduled probe runs 30 s after spawning and succeeds
    assert!(client.spawn_health_monitor());
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(client.current_state(), ConnectionState::Connected);
    assert_eq!(driver.calls(DriverOp::WaitForPendingWrites), 3);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_connection_follows_reconnect() {
    let (client, _driver) = client_with_driver();
    client.initialize().await.unwrap();

    let reconnecting = client.clone();
    let episode = tokio::spawn(async move { reconnecting.force_reconnect().await });

    // let the episode publish Reconnecting
    tokio::task::yield_now().await;
    assert_eq!(client.current_state(), ConnectionState::Reconnecting);

    client
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(episode.await.unwrap().unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_errors_skip_recovery() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let err = client
        .update_document("tours/missing", Payload::mapping([("x", Payload::from(1u64))]))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::NotFound);
    assert!(matches!(err, StoreError::Operation(_)));
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 1);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_query_retries_transient_errors() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();
    driver.fail_next(
        DriverOp::QueryCollection,
        resilient_docstore::DriverError::message("Failed to get documents because the client is offline."),
    );

    let docs = client.query_collection("tours", &[]).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(driver.calls(DriverOp::QueryCollection), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_mapping_writes_are_rejected() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let err = client.create_document("tours", Payload::Unset).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidPayload(_)));
    let err = client
        .update_document("tours/lisbon", Payload::from(42u64))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidPayload(_)));

    assert_eq!(driver.calls(DriverOp::AddDocument), 0);
    assert_eq!(driver.calls(DriverOp::UpdateDocument), 0);
    assert_eq!(driver.document("tours/lisbon").unwrap()["price"], json!(120));
}
