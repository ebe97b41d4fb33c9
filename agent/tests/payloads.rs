//! Every payload handed to the agent is released exactly once, whichever
//! way it leaves the queues.

mod common;

use agent::{Agent, Config};
use common::{init_tracing, test_config, wait_for, Peer};
use protocol::{Event, Payload};
use rstest::{fixture, rstest};
use serial_test::serial;
use std::thread;
use std::time::Duration;

#[fixture]
fn config() -> Config {
    init_tracing();
    test_config()
}

fn count_messages(events: &[protocol::DecodedEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.event, Event::Message(_)))
        .count()
}

#[rstest]
#[serial]
fn test_cleared_without_peer(config: Config) {
    let baseline = Payload::live();
    let agent = Agent::start(config).unwrap();
    let profiler = agent.profiler().clone();

    thread::spawn(move || {
        for i in 0..1000 {
            profiler.message(&format!("unsent {i}"));
        }
    })
    .join()
    .unwrap();

    assert!(wait_for(Duration::from_secs(2), || Payload::live() == baseline));
    agent.shutdown();
    assert_eq!(Payload::live(), baseline);
}

#[rstest]
#[serial]
fn test_released_after_transmit(config: Config) {
    let baseline = Payload::live();
    let agent = Agent::start(config).unwrap();
    let profiler = agent.profiler().clone();
    let mut peer = Peer::connect(agent.port());
    assert!(profiler.wait_connected(Duration::from_secs(2)));

    thread::spawn(move || {
        for i in 0..200 {
            profiler.message(&format!("sent {i}"));
        }
    })
    .join()
    .unwrap();

    let mut received = 0;
    while received < 200 {
        let events = peer.recv_until(|e| matches!(e, Event::Message(_)));
        received += count_messages(&events);
    }
    assert_eq!(received, 200);
    assert!(wait_for(Duration::from_secs(2), || Payload::live() == baseline));
    agent.shutdown();
}

#[rstest]
#[serial]
fn test_released_by_shutdown_drain(config: Config) {
    let baseline = Payload::live();
    let agent = Agent::start(config).unwrap();
    let profiler = agent.profiler().clone();
    let mut peer = Peer::connect(agent.port());
    assert!(profiler.wait_connected(Duration::from_secs(2)));

    let collector = thread::spawn(move || {
        let events = peer.recv_until(|e| matches!(e, Event::Terminate));
        peer.query(protocol::ServerQuery::Terminate, 0, 0);
        peer.recv_to_end();
        count_messages(&events)
    });

    for i in 0..500 {
        profiler.message(&format!("drained {i}"));
    }
    agent.shutdown();

    assert_eq!(collector.join().unwrap(), 500);
    assert_eq!(Payload::live(), baseline);
}

#[rstest]
#[serial]
fn test_sticky_copies_released_with_agent(mut config: Config) {
    config.on_demand = true;
    let baseline = Payload::live();
    let agent = Agent::start(config).unwrap();
    agent.profiler().app_info("retained");
    agent.profiler().lock_name(1, "retained lock");
    assert_eq!(Payload::live(), baseline + 2);

    drop(agent);
    assert_eq!(Payload::live(), baseline);
}
