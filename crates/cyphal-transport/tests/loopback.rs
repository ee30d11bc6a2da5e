//! Behavioral conformance tests for the loopback transport.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use cyphal_transport::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, DataSpecifier, InputSession,
    InputSessionSpecifier, OutputSession, OutputSessionSpecifier, PayloadMetadata, Priority,
    ProtocolParameters, Timestamp, Transfer, Transport, TransportError,
    loopback::{LoopbackTransport, SpoofBehavior},
    redundant::RedundantTransport,
};
use tokio::time::Instant;

const SUBJECT: DataSpecifier = DataSpecifier::Message { subject_id: 42 };
const META: PayloadMetadata = PayloadMetadata { extent_bytes: 64 };

fn transfer(transfer_id: u64, payload: &'static [u8]) -> Transfer {
    Transfer {
        timestamp: Timestamp::now(),
        priority: Priority::Nominal,
        transfer_id,
        fragmented_payload: vec![Bytes::from_static(payload)],
    }
}

fn soon() -> Instant {
    Instant::now() + Duration::from_millis(500)
}

#[tokio::test]
async fn sent_transfers_reach_selective_and_promiscuous_sessions() {
    let transport = LoopbackTransport::new(Some(1234));
    let promiscuous = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let selective = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: Some(1234) },
            META,
        )
        .unwrap();
    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();

    assert!(output.send(transfer(7, b"hello"), soon()).await.unwrap());

    for session in [&promiscuous, &selective] {
        let received = session.receive(soon()).await.unwrap().unwrap();
        assert_eq!(received.transfer_id, 7);
        assert_eq!(received.source_node_id, Some(1234));
        assert_eq!(received.fragmented_payload, vec![Bytes::from_static(b"hello")]);
    }
}

#[tokio::test]
async fn session_factories_are_idempotent() {
    let transport = LoopbackTransport::new(Some(10));
    let spec = InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None };
    let a = transport.input_session(spec, META).unwrap();
    let b = transport.input_session(spec, META).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(transport.input_sessions().len(), 1);

    let out_spec = OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None };
    let x = transport.output_session(out_spec, META).unwrap();
    let y = transport.output_session(out_spec, META).unwrap();
    assert!(Arc::ptr_eq(&x, &y));
}

#[tokio::test]
async fn transfer_ids_are_reduced_modulo_protocol_parameters() {
    let transport = LoopbackTransport::new(Some(88));
    transport.set_protocol_parameters(ProtocolParameters {
        transfer_id_modulo: 32,
        max_nodes: 128,
        mtu: 8,
    });
    let input = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();

    assert!(output.send(transfer(33, b"x"), soon()).await.unwrap());
    assert_eq!(input.receive(soon()).await.unwrap().unwrap().transfer_id, 1);
}

#[tokio::test(start_paused = true)]
async fn receive_deadline_expiry_is_not_an_error() {
    let transport = LoopbackTransport::new(Some(5));
    let input = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    assert_eq!(input.receive(deadline).await.unwrap(), None);
    // A deadline in the past polls without suspending.
    assert_eq!(input.receive(Instant::now() - Duration::from_secs(1)).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn send_delay_honors_the_deadline() {
    let transport = LoopbackTransport::new(Some(5));
    transport.set_send_delay(Duration::from_secs(3));
    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    // The delay outlasts the deadline: reported as a timeout, not an error.
    let deadline = Instant::now() + Duration::from_secs(1);
    assert!(!output.send(transfer(0, b"late"), deadline).await.unwrap());
    assert_eq!(output.sample_statistics().drops, 1);

    // A deadline beyond the delay succeeds.
    let deadline = Instant::now() + Duration::from_secs(10);
    assert!(output.send(transfer(1, b"ok"), deadline).await.unwrap());
}

#[tokio::test]
async fn rigged_failures_and_timeouts() {
    let transport = LoopbackTransport::new(Some(5));
    let output_spec = OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None };
    transport.output_session(output_spec, META).unwrap();
    let rigged = transport.output_sessions().pop().unwrap();

    rigged.set_should_timeout(true);
    assert!(!rigged.send(transfer(0, b"x"), soon()).await.unwrap());

    rigged.set_should_timeout(false);
    rigged.set_injected_error(Some(TransportError::InvalidMediaConfiguration("rig".into())));
    assert!(matches!(
        rigged.send(transfer(1, b"x"), soon()).await,
        Err(TransportError::InvalidMediaConfiguration(_))
    ));
}

#[tokio::test]
async fn anonymous_output_guard() {
    let transport = LoopbackTransport::with_anonymous_policy(None, false);
    let result = transport.output_session(
        OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
        META,
    );
    assert!(matches!(result, Err(TransportError::OperationNotDefinedForAnonymousNode(_))));

    // With anonymous transfers enabled the session works and the received
    // transfers carry no source node-ID.
    let transport = LoopbackTransport::new(None);
    let input = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    assert!(output.send(transfer(0, b"anon"), soon()).await.unwrap());
    assert_eq!(input.receive(soon()).await.unwrap().unwrap().source_node_id, None);
}

#[tokio::test]
async fn closed_sessions_and_transport_fail_fast() {
    let transport = LoopbackTransport::new(Some(9));
    let input = transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();

    transport.close();
    assert!(matches!(
        input.receive(soon()).await,
        Err(TransportError::ResourceClosed(_))
    ));
    assert!(matches!(
        output.send(transfer(0, b"x"), soon()).await,
        Err(TransportError::ResourceClosed(_))
    ));
    assert!(transport
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .is_err());
}

#[tokio::test]
async fn capture_observes_sent_and_spoofed_transfers() {
    let transport = LoopbackTransport::new(Some(77));
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = Arc::clone(&counter);
        transport.begin_capture(Box::new(move |capture| {
            assert_eq!(capture.transfer.metadata.session_specifier.data_specifier, SUBJECT);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert!(transport.capture_active());

    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    assert!(output.send(transfer(0, b"observed"), soon()).await.unwrap());
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let alien = AlienTransfer {
        metadata: AlienTransferMetadata {
            priority: Priority::High,
            transfer_id: 5,
            session_specifier: AlienSessionSpecifier {
                source_node_id: Some(3),
                destination_node_id: None,
                data_specifier: SUBJECT,
            },
        },
        fragmented_payload: vec![Bytes::from_static(b"spoofed")],
    };
    assert!(transport.spoof(alien.clone(), soon()).await.unwrap());
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    transport.set_spoof_behavior(SpoofBehavior::Fail(TransportError::ResourceClosed(
        "rig".into(),
    )));
    assert!(transport.spoof(alien, soon()).await.is_err());
}

#[tokio::test]
async fn tracer_reconstructs_whole_transfers() {
    use cyphal_transport::Tracer;

    let transport = LoopbackTransport::new(Some(77));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    transport.begin_capture(Box::new(move |capture| {
        let _ = tx.send(capture.clone());
    }));

    let output = transport
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    assert!(output.send(transfer(6, b"traced"), soon()).await.unwrap());

    let capture = rx.recv().await.unwrap();
    let mut tracer = LoopbackTransport::make_tracer();
    let trace = tracer.update(&capture).unwrap();
    assert_eq!(trace.transfer.metadata.transfer_id, 6);
    assert_eq!(
        trace.transfer.fragmented_payload,
        vec![Bytes::from_static(b"traced")]
    );
}

#[tokio::test]
async fn redundant_transport_deduplicates_and_fans_out() {
    let a = LoopbackTransport::new(Some(42));
    let b = LoopbackTransport::new(Some(42));
    let red = RedundantTransport::new(vec![
        Arc::new(a) as Arc<dyn Transport>,
        Arc::new(b) as Arc<dyn Transport>,
    ])
    .unwrap();

    let input = red
        .input_session(
            InputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();
    let output = red
        .output_session(
            OutputSessionSpecifier { data_specifier: SUBJECT, remote_node_id: None },
            META,
        )
        .unwrap();

    // The transfer goes out via both inferiors and comes back via both;
    // deduplication must surface it exactly once.
    assert!(output.send(transfer(3, b"dup"), soon()).await.unwrap());
    let first = input.receive(soon()).await.unwrap().unwrap();
    assert_eq!(first.transfer_id, 3);
    assert_eq!(
        input.receive(Instant::now() + Duration::from_millis(200)).await.unwrap(),
        None
    );

    // A distinct transfer-ID passes through.
    assert!(output.send(transfer(4, b"next"), soon()).await.unwrap());
    assert_eq!(input.receive(soon()).await.unwrap().unwrap().transfer_id, 4);

    red.close();
    assert!(input.receive(soon()).await.is_err());
}
