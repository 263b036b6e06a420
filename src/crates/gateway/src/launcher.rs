use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::LaunchConfig;
use crate::error::{GatewayError, GatewayResult};

/// How long an owned engine gets to exit, or to answer `shutdown`, before it is killed.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Origin stream for captured engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Single captured output line with its source.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Engine process started and owned by a gateway.
///
/// The child's stdin stays open for as long as this handle lives. The engine
/// exits once it sees EOF there, so it cannot outlive the owning process.
#[derive(Debug)]
pub(crate) struct EngineProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    address: SocketAddr,
    log_buffer: Arc<Mutex<Vec<LogLine>>>,
    log_collector: Option<thread::JoinHandle<()>>,
}

impl EngineProcess {
    /// Start the engine and wait until it announces its listen address.
    pub(crate) fn spawn(config: &LaunchConfig) -> GatewayResult<Self> {
        let class_path = config.class_path()?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.jvm_options);
        cmd.arg("-cp").arg(&class_path);
        cmd.arg(&config.entry_class);
        cmd.args(["--port", "0"]);
        cmd.args(&config.extra_args);
        cmd.envs(&config.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!(
            program = %config.program.display(),
            class_path = %class_path.to_string_lossy(),
            "launching engine"
        );
        let mut child = cmd
            .spawn()
            .map_err(|err| GatewayError::engine_start(format!("{}: {err}", config.program.display())))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::engine_start("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::engine_start("failed to capture stderr"))?;

        let (log_tx, log_rx) = mpsc::channel();
        spawn_log_reader(stdout, LogStream::Stdout, config.show_output, log_tx.clone());
        spawn_log_reader(stderr, LogStream::Stderr, config.show_output, log_tx);

        let log_buffer = Arc::new(Mutex::new(Vec::new()));
        let address =
            match wait_for_listen_address(&mut child, &log_rx, &log_buffer, config.startup_timeout) {
                Ok(address) => address,
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
            };
        let log_collector = spawn_log_collector(log_rx, log_buffer.clone());
        info!(%address, pid = child.id(), "engine is listening");

        Ok(Self {
            child,
            stdin,
            address,
            log_buffer,
            log_collector: Some(log_collector),
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Return all captured output lines across streams.
    pub(crate) fn logs(&self) -> Vec<LogLine> {
        self.log_buffer
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    /// Close stdin and wait for the engine to exit, killing it after a grace period.
    pub(crate) fn shutdown(&mut self) -> GatewayResult<()> {
        self.stdin.take();

        let start = Instant::now();
        while start.elapsed() < SHUTDOWN_GRACE {
            if let Some(status) = self.child.try_wait()? {
                debug!(%status, "engine exited");
                self.join_workers();
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }

        // Force terminate if graceful shutdown did not complete.
        warn!(pid = self.child.id(), "engine ignored shutdown, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_workers();
        Ok(())
    }

    fn join_workers(&mut self) {
        if let Some(handle) = self.log_collector.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.log_collector.is_some() {
            let _ = self.shutdown();
        }
    }
}

fn spawn_log_reader<R: std::io::Read + Send + 'static>(
    reader: R,
    stream: LogStream,
    forward: bool,
    tx: mpsc::Sender<LogLine>,
) {
    thread::spawn(move || {
        let buf_reader = BufReader::new(reader);
        for line in buf_reader.lines().map_while(Result::ok) {
            if forward {
                match stream {
                    LogStream::Stdout => println!("{line}"),
                    LogStream::Stderr => eprintln!("{line}"),
                }
            } else {
                trace!(?stream, "{line}");
            }
            let _ = tx.send(LogLine {
                stream,
                line: line.trim().to_string(),
            });
        }
    });
}

fn wait_for_listen_address(
    child: &mut Child,
    log_rx: &mpsc::Receiver<LogLine>,
    log_buffer: &Arc<Mutex<Vec<LogLine>>>,
    timeout: Duration,
) -> GatewayResult<SocketAddr> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        match log_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(line) => {
                if let Ok(mut buffer) = log_buffer.lock() {
                    buffer.push(line.clone());
                }
                if line.stream == LogStream::Stdout {
                    if let Some(addr) = parse_listen_line(&line.line) {
                        return Ok(addr);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(status) = child.try_wait()? {
                    return Err(GatewayError::EngineExited(status));
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Both streams closed without an announcement; the process may still run.
    while start.elapsed() < timeout {
        if let Some(status) = child.try_wait()? {
            return Err(GatewayError::EngineExited(status));
        }
        thread::sleep(Duration::from_millis(50));
    }

    Err(GatewayError::StartupTimeout(timeout))
}

fn parse_listen_line(line: &str) -> Option<SocketAddr> {
    let needle = "listening on";
    let lower = line.to_ascii_lowercase();
    let idx = lower.find(needle)?;
    let after = line[idx + needle.len()..].trim();
    after.parse().ok()
}

fn spawn_log_collector(
    log_rx: mpsc::Receiver<LogLine>,
    buffer: Arc<Mutex<Vec<LogLine>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(line) = log_rx.recv() {
            if let Ok(mut guard) = buffer.lock() {
                guard.push(line);
            }
        }
    })
}
