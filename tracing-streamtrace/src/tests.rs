#[cfg(test)]
use agent::{Agent, Config};
#[cfg(test)]
use protocol::handshake::hello;
#[cfg(test)]
use protocol::{read_frame, Event, Payload, StreamDecoder, WelcomeMessage, PROTOCOL_VERSION};
#[cfg(test)]
use rstest::{fixture, rstest};
#[cfg(test)]
use std::io::{Read, Write};
#[cfg(test)]
use std::net::TcpStream;
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(test)]
use tracing_subscriber::Registry;

#[cfg(test)]
#[fixture]
fn config() -> Config {
    Config {
        port: Some(0),
        broadcast: false,
        only_localhost: true,
        systrace: systrace::SamplerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Connects and completes the handshake, returning the stream positioned at
/// the first frame.
#[cfg(test)]
fn connect_peer(agent: &Agent) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", agent.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(&hello(PROTOCOL_VERSION)).unwrap();
    let mut reply = vec![0u8; 1 + WelcomeMessage::SIZE];
    stream.read_exact(&mut reply).unwrap();
    assert!(agent.profiler().wait_connected(Duration::from_secs(2)));
    stream
}

#[cfg(test)]
fn recv_until_zone_end(stream: &mut TcpStream) -> Vec<Event> {
    let mut decoder = StreamDecoder::new();
    let mut events = Vec::new();
    while !events.iter().any(|e| matches!(e, Event::ZoneEnd(_))) {
        let body = read_frame(stream).unwrap().expect("stream closed early");
        events.extend(
            decoder
                .decode_frame(&body)
                .unwrap()
                .into_iter()
                .map(|d| d.event)
                .filter(|e| !matches!(e, Event::ThreadContext(_) | Event::KeepAlive)),
        );
    }
    events
}

#[cfg(test)]
#[rstest]
fn test_span_becomes_zone(config: Config) {
    let agent = Agent::start(config).unwrap();
    let mut stream = connect_peer(&agent);

    let layer = crate::StreamtraceLayer::new(agent.profiler().clone());
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("request", answer = 42);
        let _guard = span.enter();
        tracing::info!(user = "ada", "inside");
    });

    let events = recv_until_zone_end(&mut stream);
    assert_eq!(events.len(), 4, "{events:?}");
    assert!(matches!(events[0], Event::ZoneBegin(_)));
    assert_eq!(
        events[1],
        Event::ZoneText(protocol::event::ZoneText {
            text: Payload::text("answer=42"),
        })
    );
    let Event::Message(message) = &events[2] else {
        panic!("expected a message, got {:?}", events[2]);
    };
    assert_eq!(message.text, Payload::text("inside user=ada"));
    assert!(matches!(events[3], Event::ZoneEnd(_)));
}

#[cfg(test)]
#[rstest]
fn test_location_is_shared_per_callsite(config: Config) {
    let agent = Agent::start(config).unwrap();
    let layer = crate::StreamtraceLayer::new(agent.profiler().clone());
    let metadata = tracing::subscriber::with_default(Registry::default(), || {
        tracing::info_span!("cached").metadata().expect("span is enabled")
    });

    let first = layer.location(metadata);
    let second = std::thread::scope(|s| s.spawn(|| layer.location(metadata)).join().unwrap());
    assert!(std::ptr::eq(first, second));
    assert_eq!(first.name, Some("cached"));
    assert_eq!(first.file, file!());
}

#[cfg(test)]
#[rstest]
fn test_on_demand_without_peer_records_nothing(mut config: Config) {
    config.on_demand = true;
    let agent = Agent::start(config).unwrap();
    let layer = crate::StreamtraceLayer::new(agent.profiler().clone());
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("idle");
        let _guard = span.enter();
        tracing::info!("unheard");
    });
    assert!(!agent.profiler().is_connected());
    assert_eq!(agent.profiler().connection_id(), 0);
}
