use capture::{discover, JsonLinesWriter, Poll, Session};
use clap::Parser;
use eyre::{Context, Result};
use protocol::broadcast::DEFAULT_BROADCAST_PORT;
use protocol::handshake::DEFAULT_PORT;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a client gets to close the stream after a disconnect request.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

static LONG_VERSION: OnceLock<String> = OnceLock::new();

fn get_long_version() -> &'static str {
    LONG_VERSION.get_or_init(|| {
        format!(
            "{} (commit: {}, protocol: {})",
            env!("CARGO_PKG_VERSION"),
            env!("STREAMTRACE_REVISION"),
            protocol::VERSION
        )
    })
}

#[derive(Parser)]
#[command(name = "streamtrace-capture")]
#[command(about = "receive a streamtrace client's event stream as JSON lines")]
#[command(version = None, long_version = get_long_version())]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1", help = "client host")]
    address: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT, help = "client data port")]
    port: u16,

    #[arg(
        short,
        long,
        help = "output file for JSON lines, stdout when omitted"
    )]
    output: Option<String>,

    #[arg(
        short,
        long,
        value_parser = humantime::parse_duration,
        help = "duration to collect events (e.g. 10s, 5m, 1h)"
    )]
    duration: Option<Duration>,

    #[arg(long, help = "wait for a client announcement instead of connecting directly")]
    discover: bool,

    #[arg(long, help = "only accept announcements from this program")]
    program: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BROADCAST_PORT, help = "discovery port")]
    broadcast_port: u16,

    #[arg(
        long,
        default_value = "30s",
        value_parser = humantime::parse_duration,
        help = "how long to wait for an announcement"
    )]
    discover_timeout: Duration,
}

fn resolve(args: &Args) -> Result<SocketAddr> {
    if args.discover {
        let found = discover(
            args.broadcast_port,
            args.program.as_deref(),
            args.discover_timeout,
        )?;
        return found
            .map(|announcement| announcement.addr)
            .ok_or_else(|| eyre::eyre!("no client announced itself"));
    }
    (args.address.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve address={}", args.address))?
        .next()
        .ok_or_else(|| eyre::eyre!("no address for host={}", args.address))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, disconnecting...");
        r.store(false, Ordering::SeqCst);
    })?;

    let addr = resolve(&args)?;
    let mut session = Session::connect(addr, CONNECT_TIMEOUT)?;

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create output path={path}"))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = JsonLinesWriter::new(BufWriter::new(sink));
    writer.write_header(session.welcome())?;

    let start_time = Instant::now();
    let mut stop_deadline: Option<Instant> = None;
    loop {
        let expired = args.duration.is_some_and(|d| start_time.elapsed() >= d);
        if stop_deadline.is_none() && (!running.load(Ordering::SeqCst) || expired) {
            session.disconnect()?;
            stop_deadline = Some(Instant::now() + CLOSE_GRACE);
        }
        if stop_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!(addr = %session.peer(), "client did not close the stream");
            break;
        }

        match session.poll(POLL_INTERVAL)? {
            Poll::Events(events) => {
                for event in &events {
                    writer.write_event(event)?;
                }
            }
            Poll::Idle => {}
            Poll::Closed => break,
        }
    }

    writer.flush()?;
    tracing::info!(
        records = writer.records(),
        terminated = session.is_terminated(),
        output = args.output.as_deref().unwrap_or("-"),
        "capture complete"
    );
    Ok(())
}
