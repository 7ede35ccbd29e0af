use relay_core::{
    BrokerFrame, EventBusBroker, FramePayload, Metadata, RelayError, Result, StopReason,
    StreamBroker, StreamEvent,
};
use std::time::Duration;
use tokio::sync::mpsc;

async fn drain(rx: &mut mpsc::Receiver<BrokerFrame>) -> Vec<BrokerFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
        frames.push(frame);
    }
    frames
}

async fn publish_turn(broker: &EventBusBroker, id: &str) -> Result<()> {
    broker.start_stream(id, Metadata::new()).await?;
    broker.append_event(id, &StreamEvent::text_start(0)).await?;
    broker.append_event(id, &StreamEvent::text_delta(0, "hi")).await?;
    broker
        .append_event(id, &StreamEvent::TextStop { block_index: 0 })
        .await?;
    broker
        .append_event(id, &StreamEvent::done(StopReason::EndTurn))
        .await?;
    broker.complete_stream(id).await
}

#[tokio::test]
async fn subscriber_sees_frames_in_order() -> Result<()> {
    let broker = EventBusBroker::new();
    let (_sub, mut rx) = broker.subscribe("conv-1").await?;

    publish_turn(&broker, "conv-1").await?;
    let frames = drain(&mut rx).await;

    assert_eq!(frames.len(), 6);
    assert!(matches!(frames[0].payload, FramePayload::StreamStart { .. }));
    assert_eq!(frames[2].event(), Some(&StreamEvent::text_delta(0, "hi")));
    assert!(frames[5].is_terminal());
    for pair in frames.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
    }
    assert!(frames.iter().all(|f| f.conversation_id == "conv-1"));
    Ok(())
}

#[tokio::test]
async fn late_subscriber_gets_replay() -> Result<()> {
    let broker = EventBusBroker::new();
    broker.start_stream("conv-2", Metadata::new()).await?;
    broker
        .append_event("conv-2", &StreamEvent::text_start(0))
        .await?;
    assert!(broker.is_streaming("conv-2"));

    let (_sub, mut rx) = broker.subscribe("conv-2").await?;
    broker
        .append_event("conv-2", &StreamEvent::text_delta(0, "late"))
        .await?;

    let frames = drain(&mut rx).await;
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[0].payload, FramePayload::StreamStart { .. }));
    assert_eq!(frames[2].event(), Some(&StreamEvent::text_delta(0, "late")));
    Ok(())
}

#[tokio::test]
async fn new_stream_resets_replay_but_not_sequence() -> Result<()> {
    let broker = EventBusBroker::new();
    publish_turn(&broker, "conv-3").await?;
    assert!(!broker.is_streaming("conv-3"));
    broker.start_stream("conv-3", Metadata::new()).await?;

    let (_sub, mut rx) = broker.subscribe("conv-3").await?;
    let frames = drain(&mut rx).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].sequence, 6);
    Ok(())
}

#[tokio::test]
async fn append_without_start_is_rejected() -> Result<()> {
    let broker = EventBusBroker::new();
    let result = broker
        .append_event("conv-4", &StreamEvent::text_start(0))
        .await;
    assert!(matches!(result, Err(RelayError::Broker(_))));
    assert!(matches!(
        broker.complete_stream("conv-4").await,
        Err(RelayError::Broker(_))
    ));

    // Failing works without an open stream
    let (_sub, mut rx) = broker.subscribe("conv-4").await?;
    broker.fail_stream("conv-4", "stale_run: reclaimed").await?;
    let frames = drain(&mut rx).await;
    assert_eq!(
        frames[0].payload,
        FramePayload::StreamFailed {
            reason: "stale_run: reclaimed".into()
        }
    );
    Ok(())
}

#[tokio::test]
async fn unsubscribe_and_closed_receivers_are_pruned() -> Result<()> {
    let broker = EventBusBroker::new();
    let (kept, mut rx_kept) = broker.subscribe("conv-5").await?;
    let (gone, rx_gone) = broker.subscribe("conv-5").await?;
    let (_dropped, rx_dropped) = broker.subscribe("conv-5").await?;
    assert_ne!(kept, gone);
    assert_eq!(broker.stats("conv-5").map(|s| s.active_subscriptions), Some(3));

    broker.unsubscribe(&gone).await?;
    drop(rx_gone);
    drop(rx_dropped);

    broker.start_stream("conv-5", Metadata::new()).await?;
    let stats = broker.stats("conv-5").expect("topic exists");
    assert_eq!(stats.active_subscriptions, 1);
    assert_eq!(stats.total_published, 1);
    assert_eq!(stats.total_delivered, 1);
    assert_eq!(drain(&mut rx_kept).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn slow_subscriber_drops_frames_after_timeout() -> Result<()> {
    let broker = EventBusBroker::new()
        .with_channel_capacity(1)
        .with_send_timeout(Duration::from_millis(10));
    let (_sub, mut rx) = broker.subscribe("conv-6").await?;

    broker.start_stream("conv-6", Metadata::new()).await?;
    broker
        .append_event("conv-6", &StreamEvent::text_start(0))
        .await?;

    let stats = broker.stats("conv-6").expect("topic exists");
    assert_eq!(stats.total_published, 2);
    assert_eq!(stats.dropped_frames, 1);
    assert_eq!(stats.replay_size, 2);

    let first = rx.recv().await.expect("first frame delivered");
    assert_eq!(first.sequence, 0);
    Ok(())
}

#[test]
fn frame_wire_shape_is_flat() -> Result<()> {
    let frame = BrokerFrame {
        conversation_id: "c".into(),
        sequence: 3,
        payload: FramePayload::Event {
            event: StreamEvent::text_delta(1, "x"),
        },
    };
    let value = serde_json::to_value(&frame)?;
    assert_eq!(value["frame"], "event");
    assert_eq!(value["sequence"], 3);
    assert_eq!(value["event"]["type"], "text_delta");
    assert_eq!(value["event"]["block_index"], 1);

    let back: BrokerFrame = serde_json::from_value(value)?;
    assert_eq!(back, frame);
    Ok(())
}

/// Single publisher, single consumer: every frame arrives, sequences contiguous
#[tokio::test]
async fn sustained_stream_delivers_every_frame() -> Result<()> {
    let broker = EventBusBroker::new().with_replay_capacity(64);
    let event_count = 5_000u64;
    let (_sub, mut rx) = broker.subscribe("conv-load").await?;

    let consumer = tokio::spawn(async move {
        let mut expected = 0u64;
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.sequence, expected);
            expected += 1;
            if frame.is_terminal() {
                break;
            }
        }
        expected
    });

    let start = std::time::Instant::now();
    broker.start_stream("conv-load", Metadata::new()).await?;
    broker
        .append_event("conv-load", &StreamEvent::text_start(0))
        .await?;
    for i in 0..event_count {
        broker
            .append_event("conv-load", &StreamEvent::text_delta(0, format!("tok{i} ")))
            .await?;
    }
    broker.complete_stream("conv-load").await?;
    let publish_duration = start.elapsed();

    let received = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer finished")
        .expect("consumer panicked");
    println!(
        "Single pub/sub: {} frames in {:?}, received: {}",
        event_count + 3,
        publish_duration,
        received
    );
    assert_eq!(received, event_count + 3);

    let stats = broker.stats("conv-load").expect("topic exists");
    assert_eq!(stats.dropped_frames, 0);
    // Replay is bounded but keeps the start frame
    assert_eq!(stats.replay_size, 64);
    Ok(())
}
