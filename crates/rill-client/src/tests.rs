// End-to-end tests over the in-process gateway.
use async_trait::async_trait;
use bytes::Bytes;
use rill_envelope::Envelope;
use rill_gateway::memory::MemoryHub;
use rill_gateway::{GatewayConnector, LogGateway};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::{
    BoxError, CancelHandle, ClientConfig, Error, ErrorHandler, EventHandler, PublishResult,
    StreamClient, Subscription,
};

const NO_KEY: Option<&[u8]> = None;

struct ForwardEvents {
    tx: mpsc::UnboundedSender<(Bytes, String)>,
}

#[async_trait]
impl EventHandler for ForwardEvents {
    async fn on_event(
        &self,
        _ctx: &CancelHandle,
        payload: Bytes,
        content_type: &str,
    ) -> Result<(), BoxError> {
        let _ = self.tx.send((payload, content_type.to_string()));
        Ok(())
    }
}

struct RejectEvents {
    message: &'static str,
}

#[async_trait]
impl EventHandler for RejectEvents {
    async fn on_event(
        &self,
        _ctx: &CancelHandle,
        _payload: Bytes,
        _content_type: &str,
    ) -> Result<(), BoxError> {
        Err(self.message.into())
    }
}

struct ForwardErrors {
    tx: mpsc::UnboundedSender<Error>,
    cancel_on_error: bool,
}

impl ErrorHandler for ForwardErrors {
    fn on_error(&self, cancel: &CancelHandle, err: Error) {
        // Exercises calling the handle from inside the loop's own task.
        if self.cancel_on_error {
            cancel.cancel();
        }
        let _ = self.tx.send(err);
    }
}

type EventRx = mpsc::UnboundedReceiver<(Bytes, String)>;
type ErrorRx = mpsc::UnboundedReceiver<Error>;

fn forwarding_handlers(
    cancel_on_error: bool,
) -> (Arc<ForwardEvents>, EventRx, Arc<ForwardErrors>, ErrorRx) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ForwardEvents { tx: event_tx }),
        event_rx,
        Arc::new(ForwardErrors {
            tx: error_tx,
            cancel_on_error,
        }),
        error_rx,
    )
}

async fn connect(hub: &MemoryHub, addr: &str, topic: &str, content_type: &str) -> StreamClient {
    StreamClient::connect(hub, addr, topic, content_type)
        .await
        .expect("connect")
}

async fn subscribe_forwarding(
    client: &StreamClient,
    group: &str,
) -> (Subscription, EventRx, ErrorRx) {
    let (events, event_rx, errors, error_rx) = forwarding_handlers(false);
    let subscription = client
        .subscribe(group, 0, events, errors)
        .await
        .expect("subscribe");
    (subscription, event_rx, error_rx)
}

async fn publish_text(
    client: &StreamClient,
    payload: &'static [u8],
    content_type: &str,
) -> crate::Result<PublishResult> {
    client.publish(payload, NO_KEY, content_type, None).await
}

async fn next_event(rx: &mut EventRx) -> (Bytes, String) {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

async fn next_error(rx: &mut ErrorRx) -> Error {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("error within deadline")
        .expect("error channel open")
}

#[tokio::test]
async fn publish_then_subscribe_round_trips() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    let result = client
        .publish(&b"FOO"[..], Some(&b"key-1"[..]), "text/plain", None)
        .await
        .expect("publish");
    assert_eq!(result.partition, 0);
    assert_eq!(result.offset, 0);

    let (subscription, mut events, _errors) = subscribe_forwarding(&client, "g").await;
    let (payload, content_type) = next_event(&mut events).await;
    assert_eq!(payload, Bytes::from_static(b"FOO"));
    assert_eq!(content_type, "text/plain");

    subscription.cancel();
    subscription.join().await;
}

#[tokio::test]
async fn successful_delivery_acknowledges_the_record() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;
    publish_text(&client, b"FOO", "text/plain")
        .await
        .expect("publish");

    let (subscription, mut events, _errors) = subscribe_forwarding(&client, "g").await;
    next_event(&mut events).await;

    // The ack follows the handler asynchronously; poll for it.
    let gateway = hub.gateway("mem://a");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while gateway.acked_offset("orders", "g") != Some(0) {
        assert!(tokio::time::Instant::now() < deadline, "ack not recorded");
        sleep(Duration::from_millis(10)).await;
    }

    subscription.cancel();
    subscription.join().await;
}

#[tokio::test]
async fn mismatched_content_type_fails_before_any_remote_call() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "application/json").await;

    let err = publish_text(&client, b"FOO", "text/plain")
        .await
        .expect_err("incompatible");
    match err {
        Error::IncompatibleContentType { offered, required } => {
            assert_eq!(offered, "text/plain");
            assert_eq!(required, "application/json");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Remote state untouched.
    assert!(hub.gateway("mem://a").records("orders").is_empty());
}

#[tokio::test]
async fn content_type_parameters_do_not_affect_compatibility() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    publish_text(&client, b"FOO", "text/plain; charset=utf-8")
        .await
        .expect("publish");

    // The envelope keeps the full, untruncated content type.
    let (subscription, mut events, _errors) = subscribe_forwarding(&client, "g").await;
    let (_, content_type) = next_event(&mut events).await;
    assert_eq!(content_type, "text/plain; charset=utf-8");

    subscription.cancel();
    subscription.join().await;
}

#[tokio::test]
async fn subscribe_before_publish_delivers() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    let (subscription, mut events, _errors) = subscribe_forwarding(&client, "g").await;
    publish_text(&client, b"late", "text/plain")
        .await
        .expect("publish");

    let (payload, _) = next_event(&mut events).await;
    assert_eq!(payload, Bytes::from_static(b"late"));

    subscription.cancel();
    subscription.join().await;
}

#[tokio::test]
async fn cancellation_reports_exactly_once_and_stops_delivery() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    let (subscription, mut events, mut errors) = subscribe_forwarding(&client, "g").await;
    subscription.cancel();

    let err = next_error(&mut errors).await;
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(err.to_string(), "context terminated");

    subscription.join().await;
    // The loop dropped its handler, so the channel closes with no second
    // error queued.
    assert!(errors.recv().await.is_none());

    // Nothing published after cancellation reaches the event handler.
    publish_text(&client, b"FOO", "text/plain")
        .await
        .expect("publish");
    sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn error_handler_may_cancel_from_inside_the_loop() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;
    publish_text(&client, b"FOO", "text/plain")
        .await
        .expect("publish");

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe(
            "g",
            0,
            Arc::new(RejectEvents { message: "boom" }),
            Arc::new(ForwardErrors {
                tx: error_tx,
                cancel_on_error: true,
            }),
        )
        .await
        .expect("subscribe");

    let err = next_error(&mut error_rx).await;
    assert!(matches!(err, Error::Handler(_)));
    let handle = subscription.cancel_handle();
    subscription.join().await;
    assert!(handle.is_cancelled());
    // A second cancel on an already-cancelled handle is a no-op.
    handle.cancel();
}

#[tokio::test]
async fn topics_are_isolated() {
    let hub = MemoryHub::new();
    let alpha = connect(&hub, "mem://a", "alpha", "text/plain").await;
    let beta = connect(&hub, "mem://a", "beta", "text/plain").await;

    let (alpha_sub, mut alpha_events, _alpha_errors) = subscribe_forwarding(&alpha, "g").await;
    let (beta_sub, mut beta_events, _beta_errors) = subscribe_forwarding(&beta, "g").await;

    publish_text(&alpha, b"for-alpha", "text/plain")
        .await
        .expect("publish alpha");
    publish_text(&beta, b"for-beta", "text/plain")
        .await
        .expect("publish beta");

    let (payload, _) = next_event(&mut alpha_events).await;
    assert_eq!(payload, Bytes::from_static(b"for-alpha"));
    let (payload, _) = next_event(&mut beta_events).await;
    assert_eq!(payload, Bytes::from_static(b"for-beta"));

    sleep(Duration::from_millis(50)).await;
    assert!(alpha_events.try_recv().is_err());
    assert!(beta_events.try_recv().is_err());

    alpha_sub.cancel();
    beta_sub.cancel();
    alpha_sub.join().await;
    beta_sub.join().await;
}

#[tokio::test]
async fn handler_failure_skips_ack_and_preserves_the_cause() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;
    publish_text(&client, b"FOO", "text/plain")
        .await
        .expect("publish");

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe(
            "g",
            0,
            Arc::new(RejectEvents { message: "boom" }),
            Arc::new(ForwardErrors {
                tx: error_tx,
                cancel_on_error: false,
            }),
        )
        .await
        .expect("subscribe");

    let err = next_error(&mut error_rx).await;
    match &err {
        Error::Handler(cause) => assert_eq!(cause.to_string(), "boom"),
        other => panic!("unexpected error: {other}"),
    }
    subscription.join().await;

    // Never acked, so the record is still pending for the group...
    let gateway = hub.gateway("mem://a");
    assert_eq!(gateway.acked_offset("orders", "g"), None);

    // ...and a fresh subscriber in the same group sees it again.
    let (retry, mut events, _errors) = subscribe_forwarding(&client, "g").await;
    let (payload, _) = next_event(&mut events).await;
    assert_eq!(payload, Bytes::from_static(b"FOO"));
    retry.cancel();
    retry.join().await;
}

#[tokio::test]
async fn publish_after_close_fails() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    client.close().await.expect("close");
    client.close().await.expect("close is idempotent");

    let err = publish_text(&client, b"FOO", "text/plain")
        .await
        .expect_err("closed");
    assert!(matches!(err, Error::Closed));
    assert!(hub.gateway("mem://a").records("orders").is_empty());
}

#[tokio::test]
async fn close_severs_a_live_subscription() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    let (subscription, _events, mut errors) = subscribe_forwarding(&client, "g").await;
    client.close().await.expect("close");

    let err = next_error(&mut errors).await;
    assert!(matches!(
        err,
        Error::Gateway(rill_gateway::Error::ConnectionClosed)
    ));
    subscription.join().await;
}

#[tokio::test]
async fn headers_ride_inside_the_envelope() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;

    let mut headers = HashMap::new();
    headers.insert("traceid".to_string(), "abc123".to_string());
    client
        .publish(&b"FOO"[..], NO_KEY, "text/plain", Some(&headers))
        .await
        .expect("publish");

    let records = hub.gateway("mem://a").records("orders");
    assert_eq!(records.len(), 1);
    let envelope = Envelope::from_bytes(&records[0].value).expect("parse");
    assert_eq!(envelope.extension("traceid"), Some("abc123"));
    assert_eq!(envelope.data(), Bytes::from_static(b"FOO"));
}

#[tokio::test]
async fn generated_envelope_ids_are_unique() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;
    for _ in 0..8 {
        publish_text(&client, b"x", "text/plain")
            .await
            .expect("publish");
    }
    let records = hub.gateway("mem://a").records("orders");
    let mut ids: Vec<String> = records
        .iter()
        .map(|record| {
            Envelope::from_bytes(&record.value)
                .expect("parse")
                .id()
                .to_string()
        })
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn client_debug_shows_identity_not_handles() {
    let hub = MemoryHub::new();
    let client = connect(&hub, "mem://a", "orders", "text/plain").await;
    let rendered = format!("{client:?}");
    assert!(rendered.contains("mem://a"));
    assert!(rendered.contains("orders"));
    assert!(rendered.contains("text/plain"));
}

struct PendingConnector;

#[async_trait]
impl GatewayConnector for PendingConnector {
    async fn connect(&self, _addr: &str) -> rill_gateway::Result<Arc<dyn LogGateway>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn connect_times_out() {
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let err = StreamClient::connect_with_config(
        &PendingConnector,
        "mem://never",
        "orders",
        "text/plain",
        config,
    )
    .await
    .expect_err("timeout");
    assert!(matches!(err, Error::ConnectTimeout { addr, .. } if addr == "mem://never"));
}
