use agent::{Agent, Config};
use divan::Bencher;
use tracing::info;
use tracing_streamtrace::StreamtraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

fn main() {
    divan::main();
}

/// No peer ever connects; the transport clears what the layer records, so
/// this measures the producer side only.
fn start_agent() -> Agent {
    Agent::start(Config {
        port: Some(0),
        broadcast: false,
        only_localhost: true,
        systrace: systrace::SamplerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
}

#[divan::bench]
fn bench_info_event(bencher: Bencher) {
    let agent = start_agent();
    let subscriber = Registry::default().with(StreamtraceLayer::new(agent.profiler().clone()));
    let _guard = tracing::subscriber::set_default(subscriber);
    bencher.bench_local(|| {
        info!("test message");
    });
}

#[divan::bench]
fn bench_info_event_with_fields(bencher: Bencher) {
    let agent = start_agent();
    let subscriber = Registry::default().with(StreamtraceLayer::new(agent.profiler().clone()));
    let _guard = tracing::subscriber::set_default(subscriber);
    bencher.bench_local(|| {
        info!(user_id = 123, request_id = "abc123", "processing request");
    });
}

#[divan::bench]
fn bench_span_enter_exit(bencher: Bencher) {
    let agent = start_agent();
    let subscriber = Registry::default().with(StreamtraceLayer::new(agent.profiler().clone()));
    let _guard = tracing::subscriber::set_default(subscriber);
    bencher.bench_local(|| {
        let span = tracing::info_span!("bench");
        let _entered = span.enter();
    });
}
