//! The broadcasting side of service discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use coral_net::{NetError, NetResult};
use coral_protocol::discovery::BeaconPing;

/// Configuration for a [`Beacon`].
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Partition this service belongs to; trackers in other partitions
    /// ignore it.
    pub partition_id: u32,
    /// Service type, at most 255 bytes.
    pub service_type: String,
    /// Identifier of this particular service instance, at most 255 bytes.
    pub service_id: String,
    /// Service-specific payload. Keep it small; it travels in every ping.
    pub payload: Vec<u8>,
    /// How often to announce. One second is a good default trade-off
    /// between detection latency and network noise.
    pub period: Duration,
    /// Address to send to; the IPv4 broadcast address unless announcing
    /// on a specific interface (or loopback, in tests).
    pub target_addr: IpAddr,
    /// UDP port trackers listen on.
    pub port: u16,
}

impl BeaconConfig {
    pub fn new(
        partition_id: u32,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        payload: Vec<u8>,
        port: u16,
    ) -> Self {
        Self {
            partition_id,
            service_type: service_type.into(),
            service_id: service_id.into(),
            payload,
            period: Duration::from_secs(1),
            target_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            port,
        }
    }
}

/// Broadcasts information about a service so it can be detected
/// automatically on the network.
///
/// Broadcasting starts on construction and runs in a background thread
/// until [`Beacon::stop`] is called or the beacon is dropped.
pub struct Beacon {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Beacon {
    /// Starts broadcasting.
    pub fn start(config: BeaconConfig) -> NetResult<Self> {
        let ping = BeaconPing::new(
            config.partition_id,
            config.service_type.clone(),
            config.service_id.clone(),
            config.payload.clone(),
        )
        .map_err(|e| NetError::Frame(e.to_string()))?;
        let datagram = ping.encode();

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;
        let target = (config.target_addr, config.port);

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let service_id = config.service_id.clone();
        let period = config.period;
        let handle = thread::Builder::new()
            .name(format!("beacon-{service_id}"))
            .spawn(move || {
                debug!(service_id, "beacon started");
                loop {
                    if let Err(e) = socket.send_to(&datagram, target) {
                        warn!(service_id, error = %e, "beacon send failed");
                    }
                    // The period doubles as the stop-poll interval: a stop
                    // request wakes the thread immediately.
                    match stop_rx.recv_timeout(period) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
                debug!(service_id, "beacon stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops broadcasting and joins the background thread.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Beacon {
    fn drop(&mut self) {
        self.stop();
    }
}
