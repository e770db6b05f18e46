use edge_feed::{
    ACK_TOKEN, AckPolicy, CloseReason, Engine, EngineConfig, Exit, Handle, Outcome,
};
use rstest::rstest;
use std::io::{Cursor, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

type TestEngine = Engine<UnixStream, Cursor<Vec<u8>>>;

fn engine(ack: AckPolicy) -> TestEngine {
    Engine::new(EngineConfig {
        ack,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn outcome_of(engine: &TestEngine, handle: Handle) -> Outcome {
    *engine
        .outcomes()
        .iter()
        .find(|outcome| outcome.handle == handle)
        .unwrap()
}

/// Reads everything the engine sends, then answers with the token if asked to.
fn spawn_sink(mut peer: UnixStream, acknowledge: bool) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        if acknowledge {
            peer.write_all(ACK_TOKEN).unwrap();
        }
        received
    })
}

#[rstest]
#[case(AckPolicy::Required, CloseReason::Acknowledged)]
#[case(AckPolicy::NotRequired, CloseReason::Completed)]
fn small_file_is_delivered_and_closed_per_policy(
    #[case] policy: AckPolicy,
    #[case] expected: CloseReason,
) {
    let mut engine = engine(policy);
    let (channel, peer) = UnixStream::pair().unwrap();
    let sink = spawn_sink(peer, policy == AckPolicy::Required);
    let handle = engine.add(channel, Cursor::new(b"abc".to_vec())).unwrap();

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    assert_eq!(sink.join().unwrap(), b"abc");

    let outcome = outcome_of(&engine, handle);
    assert_eq!(outcome.reason, expected);
    assert_eq!(outcome.bytes_sent, 3);
    assert_eq!(engine.active_count(), 0);
    assert!(engine.connection(handle).is_none());
    assert!(!engine.is_watched(handle));
}

#[test]
fn peer_closing_immediately_is_an_orderly_shutdown() {
    let mut engine = engine(AckPolicy::Required);
    let (channel, peer) = UnixStream::pair().unwrap();
    drop(peer);
    let handle = engine.add(channel, Cursor::new(vec![7u8; 100])).unwrap();

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    let outcome = outcome_of(&engine, handle);
    assert_eq!(outcome.reason, CloseReason::PeerShutdown);
    assert_eq!(outcome.bytes_received, 0);
    assert_eq!(engine.active_count(), 0);
}

#[test]
fn reset_on_one_connection_leaves_the_other_intact() {
    let mut engine = engine(AckPolicy::Required);

    let (doomed, mut doomed_peer) = UnixStream::pair().unwrap();
    let dropper = thread::spawn(move || {
        let mut some = [0u8; 4096];
        doomed_peer.read_exact(&mut some).unwrap();
        // unread data is still queued when the peer goes away
    });
    let (healthy, healthy_peer) = UnixStream::pair().unwrap();
    let healthy_file: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let sink = spawn_sink(healthy_peer, true);

    let first = engine
        .add(doomed, Cursor::new(vec![1u8; 1 << 20]))
        .unwrap();
    let second = engine
        .add(healthy, Cursor::new(healthy_file.clone()))
        .unwrap();
    assert_eq!(engine.active_count(), 2);

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    dropper.join().unwrap();
    assert_eq!(sink.join().unwrap(), healthy_file);
    assert_eq!(engine.active_count(), 0);
    assert_eq!(engine.outcomes().len(), 2);

    let first = outcome_of(&engine, first);
    assert!(
        matches!(first.reason, CloseReason::PeerReset | CloseReason::PeerShutdown),
        "unexpected close reason {:?}",
        first.reason
    );
    assert!(first.bytes_sent < 1 << 20);

    let second = outcome_of(&engine, second);
    assert_eq!(second.reason, CloseReason::Acknowledged);
    assert_eq!(second.bytes_sent, healthy_file.len() as u64);
}

#[test]
fn early_acknowledgment_does_not_cut_the_transfer_short() {
    let mut engine = engine(AckPolicy::Required);
    let (channel, mut peer) = UnixStream::pair().unwrap();
    let sink = thread::spawn(move || {
        peer.write_all(ACK_TOKEN).unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        received
    });
    let file = vec![0x5au8; 300_000];
    let handle = engine.add(channel, Cursor::new(file.clone())).unwrap();

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    assert_eq!(sink.join().unwrap().len(), file.len());
    let outcome = outcome_of(&engine, handle);
    assert_eq!(outcome.reason, CloseReason::Acknowledged);
    assert_eq!(outcome.bytes_sent, file.len() as u64);
    assert_eq!(outcome.bytes_received, ACK_TOKEN.len() as u64);
}

#[test]
fn peer_acknowledging_and_hanging_up_early_still_gets_everything() {
    let mut engine = engine(AckPolicy::Required);
    let (channel, mut peer) = UnixStream::pair().unwrap();
    // token and end-of-input are both queued before the first drain
    peer.write_all(ACK_TOKEN).unwrap();
    peer.shutdown(std::net::Shutdown::Write).unwrap();
    let sink = thread::spawn(move || {
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        received
    });
    let file = vec![0x33u8; 200_000];
    let handle = engine.add(channel, Cursor::new(file.clone())).unwrap();

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    assert_eq!(sink.join().unwrap().len(), file.len());
    let outcome = outcome_of(&engine, handle);
    assert_eq!(outcome.reason, CloseReason::Acknowledged);
    assert_eq!(outcome.bytes_sent, file.len() as u64);
}

#[test]
fn many_connections_all_complete() {
    let mut engine = engine(AckPolicy::Required);
    let mut sinks = Vec::new();
    let mut handles = Vec::new();
    for n in 0..25usize {
        let (channel, peer) = UnixStream::pair().unwrap();
        sinks.push((spawn_sink(peer, true), n * 37));
        handles.push(engine.add(channel, Cursor::new(vec![n as u8; n * 37])).unwrap());
    }

    assert_eq!(engine.run().unwrap(), Exit::Completed);
    for (sink, len) in sinks {
        assert_eq!(sink.join().unwrap().len(), len);
    }
    for handle in handles {
        // an empty file still waits for the token, which the sink sends after EOF
        assert_eq!(outcome_of(&engine, handle).reason, CloseReason::Acknowledged);
        assert!(!engine.is_watched(handle));
    }
}

#[test]
fn signal_releases_connections_and_shutdown_stays_idempotent() {
    let mut engine = engine(AckPolicy::Required);
    engine.interrupt_on(&[signal_hook::consts::SIGUSR2]).unwrap();

    // peers that never acknowledge
    let (a, _peer_a) = UnixStream::pair().unwrap();
    let (b, _peer_b) = UnixStream::pair().unwrap();
    let first = engine.add(a, Cursor::new(b"pending".to_vec())).unwrap();
    let second = engine.add(b, Cursor::new(Vec::new())).unwrap();

    let raiser = thread::spawn(|| {
        thread::sleep(Duration::from_millis(100));
        signal_hook::low_level::raise(signal_hook::consts::SIGUSR2).unwrap();
    });

    assert_eq!(engine.run().unwrap(), Exit::Interrupted);
    raiser.join().unwrap();
    assert_eq!(engine.active_count(), 0);
    assert!(engine.connection(first).is_none());
    assert!(engine.connection(second).is_none());

    engine.shutdown();
    engine.shutdown();
    assert_eq!(engine.active_count(), 0);
    assert_eq!(engine.run().unwrap(), Exit::Completed);
}
