//! Slave instantiation.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use coral_net::framing::{encode_message, try_decode_message};
use coral_net::{Endpoint, SlaveLocator};
use coral_types::SlaveTypeDescription;

/// Why a slave could not be instantiated.
#[derive(Debug, Error)]
pub enum InstantiationError {
    /// The child process could not be launched at all.
    #[error("failed to launch slave process: {0}")]
    Spawn(std::io::Error),

    /// The child did not report its endpoints within the startup budget.
    #[error("slave did not start within the deadline")]
    StartupTimeout,

    /// The child reported a startup failure of its own.
    #[error("slave reported a startup error: {0}")]
    SlaveError(String),

    /// The endpoint rendezvous failed.
    #[error("endpoint rendezvous failed: {0}")]
    Rendezvous(String),
}

/// A factory for slaves of one type.
pub trait SlaveCreator {
    /// The type of slave this creator makes.
    fn slave_type(&self) -> &SlaveTypeDescription;

    /// Creates one slave, blocking up to `timeout` until it is reachable.
    fn instantiate(&mut self, timeout: Duration) -> Result<SlaveLocator, InstantiationError>;
}

/// A [`SlaveCreator`] that launches a child process per slave.
///
/// The child receives one extra trailing argument: the TCP port of a
/// one-shot loopback listener. It must connect there and call
/// [`report_endpoints`] (or speak the same two-frame message) once its
/// control and data endpoints are bound. Children that report an error,
/// or stay silent past the deadline, are killed.
pub struct ProcessSlaveCreator {
    slave_type: SlaveTypeDescription,
    command: String,
    args: Vec<String>,
}

impl ProcessSlaveCreator {
    pub fn new(
        slave_type: SlaveTypeDescription,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            slave_type,
            command: command.into(),
            args,
        }
    }
}

impl SlaveCreator for ProcessSlaveCreator {
    fn slave_type(&self) -> &SlaveTypeDescription {
        &self.slave_type
    }

    fn instantiate(&mut self, timeout: Duration) -> Result<SlaveLocator, InstantiationError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| InstantiationError::Rendezvous(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| InstantiationError::Rendezvous(e.to_string()))?
            .port();

        debug!(command = self.command, port, "launching slave process");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(InstantiationError::Spawn)?;

        match await_report(&listener, timeout) {
            Ok(locator) => Ok(locator),
            Err(e) => {
                kill_quietly(&mut child);
                Err(e)
            }
        }
    }
}

/// Waits for the child's endpoint report on the rendezvous listener.
fn await_report(
    listener: &TcpListener,
    timeout: Duration,
) -> Result<SlaveLocator, InstantiationError> {
    listener
        .set_nonblocking(true)
        .map_err(|e| InstantiationError::Rendezvous(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(InstantiationError::StartupTimeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(InstantiationError::Rendezvous(e.to_string())),
        }
    };

    let message = read_report(stream, deadline)?;
    parse_report(&message)
}

fn read_report(
    mut stream: TcpStream,
    deadline: Instant,
) -> Result<Vec<Bytes>, InstantiationError> {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 1024];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(InstantiationError::StartupTimeout);
        }
        stream
            .set_read_timeout(Some(remaining))
            .map_err(|e| InstantiationError::Rendezvous(e.to_string()))?;
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(InstantiationError::Rendezvous(
                    "slave closed the rendezvous connection early".to_string(),
                ));
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                match try_decode_message(&mut buf) {
                    Ok(Some(message)) => return Ok(message),
                    Ok(None) => {}
                    Err(e) => return Err(InstantiationError::Rendezvous(e.to_string())),
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(InstantiationError::StartupTimeout);
            }
            Err(e) => return Err(InstantiationError::Rendezvous(e.to_string())),
        }
    }
}

fn parse_report(message: &[Bytes]) -> Result<SlaveLocator, InstantiationError> {
    let bad = |why: &str| InstantiationError::Rendezvous(why.to_string());
    match message {
        [status, control, data] if &status[..] == b"OK" => {
            let control: Endpoint = std::str::from_utf8(control)
                .map_err(|_| bad("control endpoint is not UTF-8"))?
                .parse()
                .map_err(|_| bad("control endpoint does not parse"))?;
            let data: Endpoint = std::str::from_utf8(data)
                .map_err(|_| bad("data endpoint is not UTF-8"))?
                .parse()
                .map_err(|_| bad("data endpoint does not parse"))?;
            Ok(SlaveLocator::new(control, data))
        }
        [status, detail] if &status[..] == b"ERROR" => Err(InstantiationError::SlaveError(
            String::from_utf8_lossy(detail).into_owned(),
        )),
        _ => Err(bad("unrecognized endpoint report")),
    }
}

fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill slave process");
    }
    let _ = child.wait();
}

/// Child-side half of the rendezvous: reports this slave's bound
/// endpoints to the provider that spawned it.
///
/// `rendezvous_port` is the trailing argument the provider appended to
/// the command line.
pub fn report_endpoints(rendezvous_port: u16, locator: &SlaveLocator) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", rendezvous_port))?;
    let message = vec![
        Bytes::from_static(b"OK"),
        Bytes::from(locator.control.url()),
        Bytes::from(locator.data_pub.url()),
    ];
    let mut buf = BytesMut::new();
    encode_message(&message, &mut buf);
    stream.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn report_round_trips_over_the_rendezvous() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let locator = SlaveLocator::new(
            Endpoint::new("10.1.2.3", 1000),
            Endpoint::new("10.1.2.3", 1001),
        );

        let reporter = {
            let locator = locator.clone();
            thread::spawn(move || report_endpoints(port, &locator).unwrap())
        };
        let received =
            await_report(&listener, Duration::from_secs(5)).expect("report should arrive");
        assert_eq!(received, locator);
        reporter.join().unwrap();
    }

    #[test]
    fn error_reports_carry_the_child_detail() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let reporter = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let message = vec![
                Bytes::from_static(b"ERROR"),
                Bytes::from_static(b"model file not found"),
            ];
            let mut buf = BytesMut::new();
            encode_message(&message, &mut buf);
            stream.write_all(&buf).unwrap();
        });
        let result = await_report(&listener, Duration::from_secs(5));
        match result {
            Err(InstantiationError::SlaveError(detail)) => {
                assert_eq!(detail, "model file not found");
            }
            other => panic!("expected a slave error, got {other:?}"),
        }
        reporter.join().unwrap();
    }

    #[test]
    fn silence_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let result = await_report(&listener, Duration::from_millis(80));
        assert!(matches!(result, Err(InstantiationError::StartupTimeout)));
    }
}
