//! Lossy and coalescing transports.

use dtm_core::{ChannelConfig, DtmIdentity, ParameterRegistry, Role, SessionError, SessionSetup};
use dtm_harness::{Chaos, LoopbackPair, Side};
use tracing_subscriber::EnvFilter;

const MAX_RESEND: u32 = 3;

/// `RUST_LOG=dtm_core=debug` shows every replay and gap request.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lossy(seed: u64, chaos: Chaos) -> LoopbackPair {
    init_logging();
    let config = ChannelConfig { max_resend: MAX_RESEND, ..ChannelConfig::default() };
    let parameters = ParameterRegistry::by_name("X3.1").unwrap();
    let mut alice =
        SessionSetup::new(Role::Initiator, DtmIdentity::new("alice", "alice-secret"), parameters);
    let mut bob =
        SessionSetup::new(Role::Responder, DtmIdentity::new("bob", "bob-secret"), parameters);
    alice.config = config.clone();
    bob.config = config;

    let mut pair = LoopbackPair::new(seed, alice, bob).with_chaos(chaos);
    assert!(pair.handshake().unwrap());
    pair
}

fn payload(i: u32) -> Vec<u8> {
    format!("message {i}").into_bytes()
}

/// Keepalives advance the peer's highest seen sequence, which exposes gaps at
/// the tail of a burst.
fn settle(pair: &mut LoopbackPair) {
    for _ in 0..200 {
        pair.node_mut(Side::Initiator).tick();
        pair.node_mut(Side::Responder).tick();
        pair.pump();
    }
}

#[test]
fn dropped_messages_are_recovered_in_order() {
    let mut pair = lossy(7, Chaos { coalesce: false, drop_every: Some(5) });
    for i in 0..400 {
        pair.node_mut(Side::Initiator).send(&payload(i)).unwrap();
        pair.pump();
    }
    settle(&mut pair);

    assert!(pair.dropped() > 0);
    let expected: Vec<Vec<u8>> = (0..400).map(payload).collect();
    assert_eq!(pair.node(Side::Responder).observer.received(), expected);
    assert!(pair.node(Side::Initiator).session.is_established());
}

#[test]
fn resend_counter_stays_within_its_bound() {
    let mut pair = lossy(8, Chaos { coalesce: false, drop_every: Some(5) });
    for i in 0..400 {
        pair.node_mut(Side::Initiator).send(&payload(i)).unwrap();
        pair.pump();
        assert!(pair.node(Side::Initiator).session.resend_count() <= MAX_RESEND);
    }
    settle(&mut pair);

    let alice = pair.node(Side::Initiator);
    let total = alice.session.total_resends();
    assert!(total > 0, "no frame was ever replayed");

    let warnings = alice
        .observer
        .errors()
        .into_iter()
        .filter(|error| matches!(error, SessionError::DataLoss(_)))
        .count() as u64;
    assert_eq!(warnings, total / u64::from(MAX_RESEND + 1));
    assert!(warnings > 0);
    assert!(alice.session.is_established(), "data-loss warnings must not close the session");
}

#[test]
fn coalesced_bursts_with_loss_still_arrive() {
    let mut pair = lossy(9, Chaos { coalesce: true, drop_every: Some(7) });
    for burst in 0..20 {
        for i in 0..10 {
            pair.node_mut(Side::Initiator).send(&payload(burst * 10 + i)).unwrap();
            pair.node_mut(Side::Responder).send(&payload(burst * 10 + i)).unwrap();
        }
        pair.pump();
    }
    settle(&mut pair);

    let expected: Vec<Vec<u8>> = (0..200).map(payload).collect();
    assert_eq!(pair.node(Side::Responder).observer.received(), expected);
    assert_eq!(pair.node(Side::Initiator).observer.received(), expected);
}

#[test]
fn same_seed_same_traffic() {
    let run = |seed| {
        let mut pair = lossy(seed, Chaos { coalesce: false, drop_every: Some(4) });
        for i in 0..50 {
            pair.node_mut(Side::Responder).send(&payload(i)).unwrap();
            pair.pump();
        }
        settle(&mut pair);
        (pair.dropped(), pair.node(Side::Responder).session.total_resends())
    };
    assert_eq!(run(99), run(99));
}
