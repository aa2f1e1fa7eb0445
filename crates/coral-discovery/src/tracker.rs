//! The listening side of service discovery.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, UdpSocket as StdUdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use tracing::{debug, trace, warn};

use coral_net::{NetResult, Reactor, TimerId};
use coral_protocol::discovery::BeaconPing;

/// Callbacks for one tracked service type. Any of them may be left out.
///
/// Each callback receives the reactor, so handlers can register sockets
/// and timers of their own (the provider cluster creates an RPC client per
/// discovered provider this way).
#[derive(Default)]
pub struct ServiceEvents {
    /// A previously unknown service instance was heard from.
    pub on_appeared: Option<Box<dyn FnMut(&mut Reactor, &str, &[u8], IpAddr)>>,
    /// A known instance announced a different payload.
    pub on_payload_changed: Option<Box<dyn FnMut(&mut Reactor, &str, &[u8], IpAddr)>>,
    /// A known instance has not been heard from within the expiry period.
    pub on_disappeared: Option<Box<dyn FnMut(&mut Reactor, &str)>>,
}

struct TrackedType {
    expiry: Duration,
    events: ServiceEvents,
}

struct ServiceEntry {
    last_seen: Instant,
    payload: Vec<u8>,
    address: IpAddr,
}

struct TrackerInner {
    partition_id: u32,
    socket: UdpSocket,
    port: u16,
    tracked: HashMap<String, TrackedType>,
    /// Keyed by (service type, service id).
    entries: HashMap<(String, String), ServiceEntry>,
    purge_timer: Option<TimerId>,
    purge_interval: Duration,
}

/// Listens for service beacons and reports appearance, payload changes and
/// disappearance per service type.
///
/// The tracker is owned by a reactor thread; all callbacks fire there.
pub struct Tracker {
    inner: Rc<RefCell<TrackerInner>>,
}

impl Tracker {
    /// Binds the tracker to a UDP port (0 requests an OS-assigned port)
    /// and registers it with the reactor.
    pub fn new(reactor: &mut Reactor, partition_id: u32, port: u16) -> NetResult<Self> {
        let socket = StdUdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        let actual_port = socket.local_addr()?.port();
        let mut socket = UdpSocket::from_std(socket);

        let token = reactor.alloc_token();
        reactor
            .registry()
            .register(&mut socket, token, mio::Interest::READABLE)?;

        let inner = Rc::new(RefCell::new(TrackerInner {
            partition_id,
            socket,
            port: actual_port,
            tracked: HashMap::new(),
            entries: HashMap::new(),
            purge_timer: None,
            purge_interval: Duration::MAX,
        }));

        let on_readable = Rc::clone(&inner);
        reactor.set_handler(token, move |reactor| {
            TrackerInner::socket_ready(&on_readable, reactor);
        });

        debug!(port = actual_port, partition_id, "tracker listening");
        Ok(Self { inner })
    }

    /// The UDP port the tracker is bound to.
    pub fn port(&self) -> u16 {
        self.inner.borrow().port
    }

    /// Starts tracking a service type.
    ///
    /// Instances of the type that stay silent for `expiry` are purged and
    /// reported as disappeared.
    pub fn add_tracked_service_type(
        &self,
        reactor: &mut Reactor,
        service_type: impl Into<String>,
        expiry: Duration,
        events: ServiceEvents,
    ) {
        let service_type = service_type.into();
        {
            let mut inner = self.inner.borrow_mut();
            inner
                .tracked
                .insert(service_type.clone(), TrackedType { expiry, events });

            // The purge cadence follows the tightest expiry registered.
            let wanted = (expiry / 2).max(Duration::from_millis(10));
            if wanted < inner.purge_interval {
                inner.purge_interval = wanted;
                if let Some(old) = inner.purge_timer.take() {
                    reactor.remove_timer(old);
                }
                let on_purge = Rc::clone(&self.inner);
                let id = reactor.add_repeating_timer(wanted, move |reactor, _| {
                    TrackerInner::purge_expired(&on_purge, reactor);
                });
                inner.purge_timer = Some(id);
            }
        }
        trace!(service_type, "tracking service type");
    }

    /// The number of currently known service instances of a type.
    pub fn known_instances(&self, service_type: &str) -> usize {
        self.inner
            .borrow()
            .entries
            .keys()
            .filter(|(t, _)| t == service_type)
            .count()
    }
}

impl TrackerInner {
    fn socket_ready(shared: &Rc<RefCell<TrackerInner>>, reactor: &mut Reactor) {
        let mut buf = [0u8; 65_536];
        loop {
            // Receive one datagram, then release the borrow before any
            // callback runs.
            let received = {
                let inner = shared.borrow();
                match inner.socket.recv_from(&mut buf) {
                    Ok((len, addr)) => Some((len, addr.ip())),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "tracker receive failed");
                        None
                    }
                }
            };
            let Some((len, sender)) = received else {
                return;
            };

            let partition_id = shared.borrow().partition_id;
            let ping = match BeaconPing::decode(&buf[..len], partition_id) {
                Ok(Some(ping)) => ping,
                Ok(None) => continue, // someone else's partition
                Err(e) => {
                    trace!(error = %e, "ignoring malformed datagram");
                    continue;
                }
            };

            Self::process_ping(shared, reactor, ping, sender);
        }
    }

    fn process_ping(
        shared: &Rc<RefCell<TrackerInner>>,
        reactor: &mut Reactor,
        ping: BeaconPing,
        sender: IpAddr,
    ) {
        enum Change {
            Appeared,
            PayloadChanged,
            Refreshed,
        }

        let change = {
            let mut inner = shared.borrow_mut();
            if !inner.tracked.contains_key(&ping.service_type) {
                return;
            }
            let key = (ping.service_type.clone(), ping.service_id.clone());
            match inner.entries.get_mut(&key) {
                None => {
                    inner.entries.insert(
                        key,
                        ServiceEntry {
                            last_seen: Instant::now(),
                            payload: ping.payload.clone(),
                            address: sender,
                        },
                    );
                    Change::Appeared
                }
                Some(entry) => {
                    entry.last_seen = Instant::now();
                    entry.address = sender;
                    if entry.payload == ping.payload {
                        Change::Refreshed
                    } else {
                        entry.payload = ping.payload.clone();
                        Change::PayloadChanged
                    }
                }
            }
        };

        // Fire the callback with no borrow held, so it can use the tracker
        // itself. The callback is temporarily taken out of the slot.
        let take = |inner: &mut TrackerInner, which: &Change| {
            let tracked = inner.tracked.get_mut(&ping.service_type)?;
            match which {
                Change::Appeared => tracked.events.on_appeared.take(),
                Change::PayloadChanged => tracked.events.on_payload_changed.take(),
                Change::Refreshed => None,
            }
        };
        let callback = take(&mut shared.borrow_mut(), &change);
        if let Some(mut callback) = callback {
            if matches!(change, Change::Appeared) {
                debug!(
                    service_type = ping.service_type,
                    service_id = ping.service_id,
                    "service appeared"
                );
            }
            callback(reactor, &ping.service_id, &ping.payload, sender);
            let mut inner = shared.borrow_mut();
            if let Some(tracked) = inner.tracked.get_mut(&ping.service_type) {
                let slot = match change {
                    Change::Appeared => &mut tracked.events.on_appeared,
                    Change::PayloadChanged => &mut tracked.events.on_payload_changed,
                    Change::Refreshed => return,
                };
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
        }
    }

    fn purge_expired(shared: &Rc<RefCell<TrackerInner>>, reactor: &mut Reactor) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = {
            let inner = shared.borrow();
            inner
                .entries
                .iter()
                .filter(|((service_type, _), entry)| {
                    inner
                        .tracked
                        .get(service_type)
                        .is_some_and(|t| now.duration_since(entry.last_seen) > t.expiry)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        for (service_type, service_id) in expired {
            shared
                .borrow_mut()
                .entries
                .remove(&(service_type.clone(), service_id.clone()));
            debug!(service_type, service_id, "service disappeared");

            let callback = shared
                .borrow_mut()
                .tracked
                .get_mut(&service_type)
                .and_then(|t| t.events.on_disappeared.take());
            if let Some(mut callback) = callback {
                callback(reactor, &service_id);
                let mut inner = shared.borrow_mut();
                if let Some(tracked) = inner.tracked.get_mut(&service_type) {
                    if tracked.events.on_disappeared.is_none() {
                        tracked.events.on_disappeared = Some(callback);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Beacon, BeaconConfig};
    use std::net::Ipv4Addr;

    fn loopback_beacon(partition: u32, id: &str, payload: Vec<u8>, port: u16) -> BeaconConfig {
        let mut config = BeaconConfig::new(partition, "test.service", id, payload, port);
        config.period = Duration::from_millis(20);
        config.target_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config
    }

    /// Drives the reactor until `done` returns true or the deadline hits.
    fn drive(reactor: &mut Reactor, mut done: impl FnMut() -> bool, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            reactor
                .run_once(Some(Duration::from_millis(20)))
                .expect("reactor tick");
        }
        done()
    }

    #[test]
    fn appearance_and_disappearance_are_reported() {
        let mut reactor = Reactor::new().unwrap();
        let tracker = Tracker::new(&mut reactor, 7, 0).unwrap();
        let port = tracker.port();

        let appeared = Rc::new(RefCell::new(Vec::<String>::new()));
        let disappeared = Rc::new(RefCell::new(Vec::<String>::new()));
        let a = Rc::clone(&appeared);
        let d = Rc::clone(&disappeared);
        tracker.add_tracked_service_type(
            &mut reactor,
            "test.service",
            Duration::from_millis(150),
            ServiceEvents {
                on_appeared: Some(Box::new(move |_, id, payload, _| {
                    assert_eq!(payload, b"pay");
                    a.borrow_mut().push(id.to_string());
                })),
                on_payload_changed: None,
                on_disappeared: Some(Box::new(move |_, id| {
                    d.borrow_mut().push(id.to_string());
                })),
            },
        );

        let mut beacon =
            Beacon::start(loopback_beacon(7, "svc-1", b"pay".to_vec(), port)).unwrap();

        let seen = {
            let appeared = Rc::clone(&appeared);
            drive(
                &mut reactor,
                move || !appeared.borrow().is_empty(),
                Duration::from_secs(5),
            )
        };
        assert!(seen, "service never appeared");
        assert_eq!(appeared.borrow().as_slice(), ["svc-1".to_string()]);
        assert_eq!(tracker.known_instances("test.service"), 1);

        // Silence the beacon; within expiry + period the tracker must
        // notice.
        beacon.stop();
        let gone = {
            let disappeared = Rc::clone(&disappeared);
            drive(
                &mut reactor,
                move || !disappeared.borrow().is_empty(),
                Duration::from_secs(5),
            )
        };
        assert!(gone, "service never disappeared");
        assert_eq!(tracker.known_instances("test.service"), 0);
    }

    #[test]
    fn payload_change_is_reported_once_per_change() {
        let mut reactor = Reactor::new().unwrap();
        let tracker = Tracker::new(&mut reactor, 1, 0).unwrap();
        let port = tracker.port();

        let changes = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let c = Rc::clone(&changes);
        let appeared = Rc::new(RefCell::new(false));
        let a = Rc::clone(&appeared);
        tracker.add_tracked_service_type(
            &mut reactor,
            "test.service",
            Duration::from_secs(10),
            ServiceEvents {
                on_appeared: Some(Box::new(move |_, _, _, _| *a.borrow_mut() = true)),
                on_payload_changed: Some(Box::new(move |_, _, payload, _| {
                    c.borrow_mut().push(payload.to_vec());
                })),
                on_disappeared: None,
            },
        );

        let mut first = Beacon::start(loopback_beacon(1, "svc-1", b"v1".to_vec(), port)).unwrap();
        {
            let appeared = Rc::clone(&appeared);
            assert!(drive(
                &mut reactor,
                move || *appeared.borrow(),
                Duration::from_secs(5)
            ));
        }
        first.stop();

        // Same identity, new payload.
        let _second = Beacon::start(loopback_beacon(1, "svc-1", b"v2".to_vec(), port)).unwrap();
        let changed = {
            let changes = Rc::clone(&changes);
            drive(
                &mut reactor,
                move || !changes.borrow().is_empty(),
                Duration::from_secs(5),
            )
        };
        assert!(changed, "payload change never reported");
        assert_eq!(changes.borrow()[0], b"v2");
    }

    #[test]
    fn foreign_partitions_are_invisible() {
        let mut reactor = Reactor::new().unwrap();
        let tracker = Tracker::new(&mut reactor, 1, 0).unwrap();
        let port = tracker.port();

        let appeared = Rc::new(RefCell::new(false));
        let a = Rc::clone(&appeared);
        tracker.add_tracked_service_type(
            &mut reactor,
            "test.service",
            Duration::from_secs(10),
            ServiceEvents {
                on_appeared: Some(Box::new(move |_, _, _, _| *a.borrow_mut() = true)),
                ..Default::default()
            },
        );

        let _foreign = Beacon::start(loopback_beacon(2, "svc-1", Vec::new(), port)).unwrap();
        let seen = {
            let appeared = Rc::clone(&appeared);
            drive(
                &mut reactor,
                move || *appeared.borrow(),
                Duration::from_millis(300),
            )
        };
        assert!(!seen, "foreign-partition beacon must be ignored");
    }
}
