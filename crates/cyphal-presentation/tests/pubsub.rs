//! Publish/subscribe behavior over the loopback transport.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use bytes::Bytes;
use cyphal_dsdl::sample::{Integer64, SampleSet};
use cyphal_presentation::{Presentation, PresentationError};
use cyphal_transport::{
    DataSpecifier, OutputSession, OutputSessionSpecifier, PayloadMetadata, Priority, Timestamp,
    Transfer, Transport, loopback::LoopbackTransport,
};
use tokio::time::Instant;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::test]
async fn publish_and_receive_on_one_subject() {
    let transport = LoopbackTransport::new(Some(1234));
    let presentation = Presentation::new(transport.clone());

    let publisher = presentation.make_publisher::<Integer64>(42).unwrap();
    let subscriber = presentation.make_subscriber::<Integer64>(42, None).unwrap();

    assert!(publisher.publish(&Integer64 { value: 123 }).await.unwrap());
    let (message, transfer) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message, Integer64 { value: 123 });
    assert_eq!(transfer.source_node_id, Some(1234));
    assert_eq!(transfer.transfer_id, 0);

    assert!(publisher.publish(&Integer64 { value: 456 }).await.unwrap());
    let (message, transfer) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message.value, 456);
    assert_eq!(transfer.transfer_id, 1);

    let stats = subscriber.sample_statistics();
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.overruns, 0);
    assert_eq!(stats.deserialization_failures, 0);
}

#[tokio::test]
async fn independent_subscribers_each_see_every_message() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(7)));
    let publisher = presentation.make_publisher::<Integer64>(9).unwrap();
    let first = presentation.make_subscriber::<Integer64>(9, None).unwrap();
    let second = presentation.make_subscriber::<Integer64>(9, None).unwrap();

    assert!(publisher.publish(&Integer64 { value: -5 }).await.unwrap());
    for subscriber in [&first, &second] {
        let (message, _) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(message.value, -5);
    }
}

#[tokio::test]
async fn bounded_queue_overrun_drops_and_counts() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(7)));
    let publisher = presentation.make_publisher::<Integer64>(5).unwrap();
    let subscriber = presentation.make_subscriber::<Integer64>(5, Some(1)).unwrap();

    assert!(publisher.publish(&Integer64 { value: 1 }).await.unwrap());
    assert!(publisher.publish(&Integer64 { value: 2 }).await.unwrap());
    // Give the fan-out task a chance to drain the session.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (message, _) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message.value, 1);

    let stats = subscriber.sample_statistics();
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.overruns, 1);
}

#[tokio::test]
async fn undecodable_transfers_are_counted_and_dropped() {
    let transport = LoopbackTransport::new(Some(3));
    let presentation = Presentation::new(transport.clone());
    let subscriber = presentation.make_subscriber::<SampleSet>(17, None).unwrap();

    // Inject a transfer whose readings length prefix exceeds the array
    // capacity, bypassing the typed publisher.
    let session = transport
        .output_session(
            OutputSessionSpecifier {
                data_specifier: DataSpecifier::Message { subject_id: 17 },
                remote_node_id: None,
            },
            PayloadMetadata { extent_bytes: 28 },
        )
        .unwrap();
    let garbage = Transfer {
        timestamp: Timestamp::now(),
        priority: Priority::Nominal,
        transfer_id: 0,
        fragmented_payload: vec![Bytes::from_static(&[0x00, 0x00, 0xFF, 0x00])],
    };
    assert!(session.send(garbage, Instant::now() + RECEIVE_TIMEOUT).await.unwrap());

    assert_eq!(subscriber.receive_for(Duration::from_millis(300)).await.unwrap(), None);
    assert_eq!(subscriber.sample_statistics().deserialization_failures, 1);
}

#[tokio::test]
async fn transfer_ids_survive_port_reopen() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
    let subscriber = presentation.make_subscriber::<Integer64>(30, None).unwrap();

    let publisher = presentation.make_publisher::<Integer64>(30).unwrap();
    assert!(publisher.publish(&Integer64 { value: 1 }).await.unwrap());
    drop(publisher);

    // The counter outlives the port: the next publisher continues at 1.
    let publisher = presentation.make_publisher::<Integer64>(30).unwrap();
    assert!(publisher.publish(&Integer64 { value: 2 }).await.unwrap());

    let (_, first) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    let (_, second) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(first.transfer_id, 0);
    assert_eq!(second.transfer_id, 1);
}

#[tokio::test]
async fn dropping_the_last_proxy_closes_the_transport_session() {
    let transport = LoopbackTransport::new(Some(1));
    let presentation = Presentation::new(transport.clone());

    let publisher = presentation.make_publisher::<Integer64>(77).unwrap();
    let second = presentation.make_publisher::<Integer64>(77).unwrap();
    assert_eq!(transport.output_sessions().len(), 1);

    drop(publisher);
    assert_eq!(transport.output_sessions().len(), 1);
    drop(second);
    assert_eq!(transport.output_sessions().len(), 0);
}

#[tokio::test]
async fn send_timeout_is_a_non_error_outcome() {
    let transport = LoopbackTransport::new(Some(1));
    let presentation = Presentation::new(transport.clone());
    let publisher = presentation.make_publisher::<Integer64>(2).unwrap();

    transport.output_sessions().pop().unwrap().set_should_timeout(true);
    assert!(!publisher.publish(&Integer64 { value: 5 }).await.unwrap());
}

#[tokio::test]
async fn closed_presentation_rejects_everything() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
    let publisher = presentation.make_publisher::<Integer64>(2).unwrap();
    let subscriber = presentation.make_subscriber::<Integer64>(2, None).unwrap();

    presentation.close();

    assert!(presentation.make_publisher::<Integer64>(3).is_err());
    let publish_error = publisher.publish(&Integer64 { value: 1 }).await.unwrap_err();
    assert!(publish_error.is_closed());
    match subscriber.receive_for(Duration::ZERO).await {
        Err(PresentationError::PortClosed(_)) => {}
        other => unreachable!("expected a closed-port error, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_soon_is_fire_and_forget() {
    let presentation = Presentation::new(LoopbackTransport::new(Some(4)));
    let publisher = presentation.make_publisher::<Integer64>(8).unwrap();
    let subscriber = presentation.make_subscriber::<Integer64>(8, None).unwrap();

    publisher.publish_soon(Integer64 { value: 99 });
    let (message, _) = subscriber.receive_for(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message.value, 99);
}
