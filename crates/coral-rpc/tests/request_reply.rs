//! Client/server exercises of the request/reply substrate.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use coral_net::{Endpoint, Reactor};
use coral_rpc::{RrClient, RrServer, ServerProtocolHandler};
use coral_types::CommError;

/// Echoes the request header with a version tag; drops requests whose
/// header is `"DROP"`. On an unsupported version, offers its own version
/// back (a negotiation handshake).
struct TagHandler {
    version: u16,
}

impl ServerProtocolHandler for TagHandler {
    fn handle(
        &mut self,
        _reactor: &mut Reactor,
        _version: u16,
        header: &[u8],
        _body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        if header == b"DROP" {
            return None;
        }
        let mut reply = header.to_vec();
        reply.extend_from_slice(b"/v");
        reply.extend_from_slice(self.version.to_string().as_bytes());
        Some((reply, None))
    }

    fn handle_unsupported_version(
        &mut self,
        _reactor: &mut Reactor,
        _version: u16,
        header: &[u8],
        _body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        if header == b"HELLO" {
            Some((b"HELLO".to_vec(), Some(self.version.to_le_bytes().to_vec())))
        } else {
            None
        }
    }
}

/// Runs an RrServer on a background thread until `stop` is set.
fn spawn_server(versions: &[u16]) -> (Endpoint, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    let versions = versions.to_vec();
    let (endpoint_tx, endpoint_rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let mut reactor = Reactor::new().unwrap();
        let server = RrServer::bind(&mut reactor, &Endpoint::new("127.0.0.1", 0)).unwrap();
        for version in versions {
            server.add_protocol_handler("TAG", version, Box::new(TagHandler { version }));
        }
        endpoint_tx.send(server.bound_endpoint()).unwrap();
        reactor.add_repeating_timer(Duration::from_millis(10), move |r, _| {
            if stop2.load(Ordering::Relaxed) {
                r.stop();
            }
        });
        reactor.run().unwrap();
    });

    let endpoint = endpoint_rx.recv().unwrap();
    (endpoint, stop, handle)
}

/// Drives a reactor until `done` returns true or the deadline passes.
fn drive(reactor: &mut Reactor, mut done: impl FnMut() -> bool, deadline: Duration) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    done()
}

type Outcome = Rc<RefCell<Option<Result<Vec<u8>, CommError>>>>;

fn request(
    reactor: &mut Reactor,
    client: &RrClient,
    version: u16,
    header: &[u8],
    timeout: Duration,
) -> Outcome {
    let outcome: Outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    client.request(
        reactor,
        version,
        header,
        None,
        timeout,
        Box::new(move |result| {
            *slot.borrow_mut() = Some(result.map(|(header, _)| header.to_vec()));
        }),
    );
    outcome
}

#[test]
fn requests_are_dispatched_by_version() {
    let (endpoint, stop, handle) = spawn_server(&[0, 1]);
    let mut reactor = Reactor::new().unwrap();
    let client = RrClient::connect(
        &mut reactor,
        "TAG",
        &endpoint,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    for (version, expected) in [(0u16, b"ping/v0".to_vec()), (1, b"ping/v1".to_vec())] {
        let outcome = request(&mut reactor, &client, version, b"ping", Duration::from_secs(5));
        let done = {
            let outcome = Rc::clone(&outcome);
            drive(
                &mut reactor,
                move || outcome.borrow().is_some(),
                Duration::from_secs(5),
            )
        };
        assert!(done, "no reply for version {version}");
        assert_eq!(
            outcome.borrow_mut().take().unwrap().unwrap(),
            expected,
            "wrong handler for version {version}"
        );
    }

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn dropped_requests_time_out() {
    let (endpoint, stop, handle) = spawn_server(&[0]);
    let mut reactor = Reactor::new().unwrap();
    let client = RrClient::connect(
        &mut reactor,
        "TAG",
        &endpoint,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    let outcome = request(
        &mut reactor,
        &client,
        0,
        b"DROP",
        Duration::from_millis(100),
    );
    let done = {
        let outcome = Rc::clone(&outcome);
        drive(
            &mut reactor,
            move || outcome.borrow().is_some(),
            Duration::from_secs(5),
        )
    };
    assert!(done);
    assert_eq!(
        outcome.borrow_mut().take().unwrap(),
        Err(CommError::TimedOut)
    );
    assert!(!client.is_busy(), "timeout must clear the outstanding slot");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn meta_request_reports_highest_version() {
    let (endpoint, stop, handle) = spawn_server(&[0, 1]);
    let mut reactor = Reactor::new().unwrap();
    let client = RrClient::connect(
        &mut reactor,
        "TAG",
        &endpoint,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    let outcome: Rc<RefCell<Option<Result<u16, CommError>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    client.request_max_protocol(
        &mut reactor,
        Duration::from_secs(5),
        Box::new(move |result| *slot.borrow_mut() = Some(result)),
    );
    let done = {
        let outcome = Rc::clone(&outcome);
        drive(
            &mut reactor,
            move || outcome.borrow().is_some(),
            Duration::from_secs(5),
        )
    };
    assert!(done);
    assert_eq!(outcome.borrow_mut().take().unwrap(), Ok(1));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn meta_request_for_unknown_protocol_is_refused() {
    let (endpoint, stop, handle) = spawn_server(&[0]);
    let mut reactor = Reactor::new().unwrap();
    let client = RrClient::connect(
        &mut reactor,
        "NO_SUCH_PROTOCOL",
        &endpoint,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    let outcome: Rc<RefCell<Option<Result<u16, CommError>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    client.request_max_protocol(
        &mut reactor,
        Duration::from_secs(5),
        Box::new(move |result| *slot.borrow_mut() = Some(result)),
    );
    let done = {
        let outcome = Rc::clone(&outcome);
        drive(
            &mut reactor,
            move || outcome.borrow().is_some(),
            Duration::from_secs(5),
        )
    };
    assert!(done);
    assert_eq!(
        outcome.borrow_mut().take().unwrap(),
        Err(CommError::ProtocolNotSupported)
    );

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn unsupported_version_reaches_negotiation_hook() {
    let (endpoint, stop, handle) = spawn_server(&[0, 1]);
    let mut reactor = Reactor::new().unwrap();
    let client = RrClient::connect(
        &mut reactor,
        "TAG",
        &endpoint,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    // Version 7 has no handler; the HELLO must land in the v1 handler's
    // negotiation hook, which counter-offers version 1.
    let outcome: Outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    client.request(
        &mut reactor,
        7,
        b"HELLO",
        None,
        Duration::from_secs(5),
        Box::new(move |result| {
            *slot.borrow_mut() =
                Some(result.map(|(_, body)| body.map(|b| b.to_vec()).unwrap_or_default()));
        }),
    );
    let done = {
        let outcome = Rc::clone(&outcome);
        drive(
            &mut reactor,
            move || outcome.borrow().is_some(),
            Duration::from_secs(5),
        )
    };
    assert!(done);
    assert_eq!(
        outcome.borrow_mut().take().unwrap().unwrap(),
        1u16.to_le_bytes().to_vec()
    );

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}
