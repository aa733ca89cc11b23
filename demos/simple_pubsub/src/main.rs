//! Publish/subscribe demo over the in-process gateway.
//!
//! # Purpose
//! Demonstrates the end-to-end flow: connect a stream client, open a
//! subscription, publish an event, receive it through the handler pair,
//! then cancel and close.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rill_client::{BoxError, CancelHandle, ErrorHandler, EventHandler, StreamClient};
use rill_gateway::memory::MemoryHub;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

struct PrintEvents {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl EventHandler for PrintEvents {
    async fn on_event(
        &self,
        _ctx: &CancelHandle,
        payload: Bytes,
        content_type: &str,
    ) -> std::result::Result<(), BoxError> {
        println!(
            "  received {} byte(s) of {content_type}: {:?}",
            payload.len(),
            String::from_utf8_lossy(&payload)
        );
        let _ = self.tx.send(payload);
        Ok(())
    }
}

struct PrintErrors;

impl ErrorHandler for PrintErrors {
    fn on_error(&self, _cancel: &CancelHandle, err: rill_client::Error) {
        println!("  subscription stopped: {err}");
    }
}

async fn run_demo() -> Result<()> {
    println!("== Rill Pub/Sub Demo ==");
    println!("Goal: publish one event and watch a subscription deliver it.");

    println!("Step 1/5: starting an in-process gateway hub.");
    let hub = MemoryHub::new();

    println!("Step 2/5: connecting a stream client for topic 'demo-topic'.");
    let client = StreamClient::connect(&hub, "mem://demo", "demo-topic", "text/plain").await?;

    println!("Step 3/5: opening a subscription (group 'demo', offset 0).");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe("demo", 0, Arc::new(PrintEvents { tx }), Arc::new(PrintErrors))
        .await?;

    println!("Step 4/5: publishing 'FOO' as text/plain.");
    let result = client
        .publish(&b"FOO"[..], None::<&[u8]>, "text/plain", None)
        .await?;
    println!(
        "  stored at partition {} offset {}",
        result.partition, result.offset
    );

    let payload = timeout(Duration::from_secs(1), rx.recv())
        .await?
        .expect("event delivered");
    assert_eq!(payload, Bytes::from_static(b"FOO"));

    println!("Step 5/5: cancelling the subscription and closing the client.");
    subscription.cancel();
    subscription.join().await;
    client.close().await?;

    println!("Done.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run_demo().await
}
