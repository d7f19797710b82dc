/// Live query behaviour across reconnections

mod common;

use common::{client_with_driver, fatal_error, transient_error};
use futures::StreamExt;
use resilient_docstore::driver::{DriverOp, SortDirection};
use resilient_docstore::{ConnectionState, Payload, QueryConstraint};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_live_query_resubscribes_after_reconnect() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let mut live = client
        .read_collection(
            "tours",
            vec![QueryConstraint::order_by("price", SortDirection::Asc)],
        )
        .unwrap();
    let first = live.next().await.unwrap().unwrap();
    assert_eq!(first[0].id, "porto");

    assert_eq!(
        client.force_reconnect().await.unwrap(),
        ConnectionState::Connected
    );

    // The fresh subscription delivers a new initial snapshot
    let resumed = live.next().await.unwrap().unwrap();
    assert_eq!(resumed.len(), 2);
    assert_eq!(driver.calls(DriverOp::Subscribe), 2);
    assert_eq!(driver.subscriber_count(), 1);
    assert_eq!(client.active_listeners(), 1);

    client
        .create_document("tours", Payload::mapping([("price", Payload::from(10u64))]))
        .await
        .unwrap();
    let updated = live.next().await.unwrap().unwrap();
    assert_eq!(updated.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_listener_error_triggers_recovery() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let mut live = client.read_collection("tours", vec![]).unwrap();
    live.next().await.unwrap().unwrap();

    driver.emit_error("tours", fatal_error());

    let resumed = live.next().await.unwrap().unwrap();
    assert_eq!(resumed.len(), 2);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 1);
    assert_eq!(driver.subscriber_count(), 1);
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transient_subscribe_failure_is_retried() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();
    driver.fail_next(DriverOp::Subscribe, transient_error());

    let mut live = client.read_collection("tours", vec![]).unwrap();
    let snapshot = live.next().await.unwrap().unwrap();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(driver.calls(DriverOp::Subscribe), 2);
    assert_eq!(driver.calls(DriverOp::DisableNetwork), 0);
}

#[tokio::test(start_paused = true)]
async fn test_live_query_waits_for_running_episode() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let reconnecting = client.clone();
    let episode = tokio::spawn(async move { reconnecting.force_reconnect().await });
    tokio::task::yield_now().await;
    assert_eq!(client.current_state(), ConnectionState::Reconnecting);

    let mut live = client.read_collection("tours", vec![]).unwrap();
    live.next().await.unwrap().unwrap();

    // The only subscription was made after the episode's teardown
    assert_eq!(driver.calls(DriverOp::Subscribe), 1);
    assert_eq!(episode.await.unwrap().unwrap(), ConnectionState::Connected);
    assert_eq!(client.active_listeners(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_multiple_live_queries_share_teardown() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();

    let mut tours = client.read_collection("tours", vec![]).unwrap();
    let mut bookings = client.read_collection("bookings", vec![]).unwrap();
    tours.next().await.unwrap().unwrap();
    bookings.next().await.unwrap().unwrap();
    assert_eq!(client.active_listeners(), 2);

    client.force_reconnect().await.unwrap();
    tours.next().await.unwrap().unwrap();
    bookings.next().await.unwrap().unwrap();

    assert_eq!(driver.calls(DriverOp::Unsubscribe), 2);
    assert_eq!(driver.subscriber_count(), 2);

    drop(tours);
    drop(bookings);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(driver.subscriber_count(), 0);
    assert_eq!(client.active_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_overlapping_episode_is_replaced() {
    let (client, driver) = client_with_driver();
    client.initialize().await.unwrap();
    driver.set_latency(DriverOp::Subscribe, Duration::from_millis(50));
    let before = driver.call_log().len();

    let mut live = client.read_collection("tours", vec![]).unwrap();
    // let the pump reach the driver before the episode starts
    tokio::task::yield_now().await;
    assert_eq!(driver.calls(DriverOp::Subscribe), 1);

    // the episode finishes (30 ms) while subscribe is still pending (50 ms)
    assert_eq!(
        client.force_reconnect().await.unwrap(),
        ConnectionState::Connected
    );

    live.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        driver.call_log()[before..].to_vec(),
        vec![
            DriverOp::Subscribe,
            DriverOp::DisableNetwork,
            DriverOp::EnableNetwork,
            DriverOp::WaitForPendingWrites,
            DriverOp::Unsubscribe,
            DriverOp::Subscribe,
        ]
    );
    assert_eq!(driver.subscriber_count(), 1);
    assert_eq!(client.active_listeners(), 1);
    assert!(live.is_active());
}
