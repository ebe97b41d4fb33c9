use agent::{Agent, Config};
use capture::{Poll, Session};
use eyre::{Context, Result};
use rstest::{fixture, rstest};
use serde_json::Value;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct TestSetup {
    _temp_dir: TempDir,
    output_path: PathBuf,
}

#[fixture]
fn setup() -> TestSetup {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let output_path = temp_dir.path().join("capture.jsonl");
    TestSetup {
        _temp_dir: temp_dir,
        output_path,
    }
}

fn start_agent(program: &str) -> Agent {
    let config = Config {
        port: Some(0),
        broadcast: false,
        only_localhost: true,
        program_name: Some(program.to_string()),
        systrace: systrace::SamplerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    Agent::start(config).expect("failed to start agent")
}

fn spawn_capture(port: u16, output: &Path, extra: &[&str]) -> Result<Child> {
    Command::new(env!("CARGO_BIN_EXE_streamtrace-capture"))
        .arg("--port")
        .arg(port.to_string())
        .arg("--output")
        .arg(output)
        .args(extra)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn streamtrace-capture")
}

fn wait_exit(child: &mut Child, timeout: Duration) -> Result<bool> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(status) = child.try_wait()? {
            return Ok(status.success());
        }
        thread::sleep(Duration::from_millis(50));
    }
    child.kill()?;
    child.wait()?;
    eyre::bail!("streamtrace-capture did not exit within {timeout:?}")
}

fn read_lines(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .map(|line| serde_json::from_str(line).context("invalid JSON line"))
        .collect()
}

fn of_type<'a>(lines: &'a [Value], kind: &str) -> Vec<&'a Value> {
    lines
        .iter()
        .filter(|line| line["event"]["type"] == kind)
        .collect()
}

#[rstest]
#[serial]
fn test_capture_for_duration(setup: TestSetup) -> Result<()> {
    let agent = start_agent("duration-test");
    let mut capture = spawn_capture(agent.port(), &setup.output_path, &["-d", "1s"])?;
    assert!(agent.profiler().wait_connected(Duration::from_secs(5)));

    let profiler = agent.profiler().clone();
    thread::spawn(move || {
        profiler.set_thread_name("producer");
        for i in 0..10 {
            profiler.message(&format!("tick {i}"));
            profiler.plot("ticks", i as f64);
        }
    })
    .join()
    .unwrap();

    assert!(wait_exit(&mut capture, Duration::from_secs(10))?);

    let lines = read_lines(&setup.output_path)?;
    assert_eq!(lines[0]["type"], "Welcome");
    assert_eq!(lines[0]["program_name"], "duration-test");
    assert_eq!(lines[0]["pid"], std::process::id());

    let messages = of_type(&lines, "Message");
    assert_eq!(messages.len(), 10);
    assert_eq!(messages[0]["event"]["text"], "tick 0");
    assert_eq!(of_type(&lines, "PlotData").len(), 10);

    let names: Vec<_> = of_type(&lines, "ThreadName")
        .iter()
        .map(|line| line["event"]["name"].clone())
        .collect();
    assert!(names.contains(&Value::from("producer")), "{names:?}");
    let strings: Vec<_> = of_type(&lines, "StringData")
        .iter()
        .map(|line| line["event"]["text"].clone())
        .collect();
    assert!(strings.contains(&Value::from("ticks")), "{strings:?}");

    agent.shutdown();
    Ok(())
}

#[rstest]
#[serial]
fn test_ctrl_c_disconnects(setup: TestSetup) -> Result<()> {
    let agent = start_agent("interrupt-test");
    let mut capture = spawn_capture(agent.port(), &setup.output_path, &[])?;
    assert!(agent.profiler().wait_connected(Duration::from_secs(5)));
    agent.profiler().message("before interrupt");
    thread::sleep(Duration::from_millis(300));

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(capture.id() as i32),
        nix::sys::signal::Signal::SIGINT,
    )?;
    assert!(wait_exit(&mut capture, Duration::from_secs(10))?);

    let start = Instant::now();
    while agent.profiler().is_connected() && start.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!agent.profiler().is_connected());

    let lines = read_lines(&setup.output_path)?;
    assert_eq!(of_type(&lines, "Message").len(), 1);
    agent.shutdown();
    Ok(())
}

#[rstest]
#[serial]
fn test_session_acknowledges_terminate() -> Result<()> {
    let agent = start_agent("terminate-test");
    let addr = format!("127.0.0.1:{}", agent.port()).parse()?;
    let mut session = Session::connect(addr, Duration::from_secs(2))?;
    assert!(agent.profiler().wait_connected(Duration::from_secs(5)));

    {
        let _zone = agent.profiler().zone(agent::source_location!("terminating"));
    }
    let shutdown = thread::spawn(move || {
        let started = Instant::now();
        agent.shutdown();
        started.elapsed()
    });

    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match session.poll(Duration::from_millis(50))? {
            Poll::Events(batch) => events.extend(batch.into_iter().map(|e| e.event)),
            Poll::Idle => {}
            Poll::Closed => break,
        }
    }
    assert!(session.is_terminated());
    // The acknowledgement ends the shutdown wait early.
    assert!(shutdown.join().unwrap() < Duration::from_secs(2));

    assert!(events
        .iter()
        .any(|event| matches!(event, protocol::Event::ZoneBegin(_))));
    assert!(events
        .iter()
        .any(|event| matches!(event, protocol::Event::Terminate)));
    Ok(())
}

#[rstest]
#[serial]
fn test_refused_when_already_captured() -> Result<()> {
    let agent = start_agent("refusal-test");
    let addr = format!("127.0.0.1:{}", agent.port()).parse()?;
    let mut first = Session::connect(addr, Duration::from_secs(2))?;
    assert!(agent.profiler().wait_connected(Duration::from_secs(5)));
    first.disconnect()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if matches!(first.poll(Duration::from_millis(50))?, Poll::Closed) {
            break;
        }
    }

    let err = Session::connect(addr, Duration::from_secs(2)).err().unwrap();
    assert!(err.to_string().contains("on-demand"), "{err}");
    agent.shutdown();
    Ok(())
}
