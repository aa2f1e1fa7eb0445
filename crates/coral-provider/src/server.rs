//! The provider server: beacon plus RPC handlers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use coral_discovery::{Beacon, BeaconConfig};
use coral_net::{Endpoint, NetResult, Reactor};
use coral_protocol::provider::{
    self, ErrorReply, InstantiateSlaveRequest, SlaveTypeList,
};
use coral_rpc::{RrServer, ServerProtocolHandler};

use crate::creator::SlaveCreator;

/// Configuration for a [`SlaveProviderServer`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// This provider's identity in discovery announcements; must be
    /// unique within the partition.
    pub provider_id: String,
    /// Network partition to announce in.
    pub partition_id: u32,
    /// UDP port the partition's trackers listen on.
    pub discovery_port: u16,
    /// Announcement period.
    pub beacon_period: Duration,
    /// Where beacons are sent; the IPv4 broadcast address in production,
    /// loopback in tests.
    pub beacon_target: IpAddr,
    /// Endpoint to serve RPC on (port 0 for OS-assigned).
    pub rpc_endpoint: Endpoint,
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, partition_id: u32, discovery_port: u16) -> Self {
        Self {
            provider_id: provider_id.into(),
            partition_id,
            discovery_port,
            beacon_period: Duration::from_secs(1),
            beacon_target: IpAddr::V4(Ipv4Addr::BROADCAST),
            rpc_endpoint: Endpoint::new("*", 0),
        }
    }
}

/// Serves slave-type queries and instantiation requests, announcing
/// itself with a discovery beacon.
///
/// Instantiation runs inline on the server loop: while a slave starts up,
/// other requests wait. Providers exist to spawn slaves, so this is the
/// intended behavior, and the master's instantiation timeout accounts
/// for it.
pub struct SlaveProviderServer {
    reactor: Reactor,
    // Keeps the handler registration and announcements alive.
    _server: RrServer,
    beacon: Beacon,
    rpc_endpoint: Endpoint,
    stop: Arc<AtomicBool>,
}

impl SlaveProviderServer {
    pub fn new(
        config: &ProviderConfig,
        creators: Vec<Box<dyn SlaveCreator>>,
    ) -> NetResult<Self> {
        let mut reactor = Reactor::new()?;
        let server = RrServer::bind(&mut reactor, &config.rpc_endpoint)?;
        let rpc_endpoint = server.bound_endpoint();

        let mut by_uuid = HashMap::new();
        for creator in creators {
            let uuid = creator.slave_type().uuid;
            if by_uuid.insert(uuid, creator).is_some() {
                warn!(%uuid, "duplicate slave type registered; keeping the last");
            }
        }
        server.add_protocol_handler(
            provider::PROTOCOL_ID,
            provider::PROTOCOL_VERSION,
            Box::new(ProviderHandler { creators: by_uuid }),
        );

        let beacon = Beacon::start(BeaconConfig {
            partition_id: config.partition_id,
            service_type: provider::SERVICE_TYPE.to_string(),
            service_id: config.provider_id.clone(),
            payload: provider::encode_beacon_payload(rpc_endpoint.port()),
            period: config.beacon_period,
            target_addr: config.beacon_target,
            port: config.discovery_port,
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_watch = Arc::clone(&stop);
        reactor.add_repeating_timer(Duration::from_millis(100), move |r, _| {
            if stop_watch.load(Ordering::Relaxed) {
                r.stop();
            }
        });

        info!(
            provider = config.provider_id,
            rpc = %rpc_endpoint,
            "slave provider serving"
        );
        Ok(Self {
            reactor,
            _server: server,
            beacon,
            rpc_endpoint,
            stop,
        })
    }

    /// The endpoint the RPC server is bound to.
    pub fn rpc_endpoint(&self) -> &Endpoint {
        &self.rpc_endpoint
    }

    /// A handle that makes [`SlaveProviderServer::run`] return when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Serves until the stop handle is set.
    pub fn run(mut self) -> NetResult<()> {
        self.reactor.run()?;
        self.beacon.stop();
        info!("slave provider stopped");
        Ok(())
    }
}

struct ProviderHandler {
    creators: HashMap<Uuid, Box<dyn SlaveCreator>>,
}

impl ProviderHandler {
    fn list_slave_types(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let list = SlaveTypeList {
            slave_types: self
                .creators
                .values()
                .map(|c| c.slave_type().clone())
                .collect(),
        };
        match provider::encode_body(&list) {
            Ok(body) => Some((provider::OK.as_bytes().to_vec(), Some(body))),
            Err(e) => {
                warn!(error = %e, "failed to encode slave-type list");
                None
            }
        }
    }

    fn instantiate(&mut self, body: Option<&[u8]>) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let request: InstantiateSlaveRequest = match body.and_then(|b| provider::decode_body(b).ok())
        {
            Some(request) => request,
            None => {
                warn!("dropping malformed instantiation request");
                return None;
            }
        };
        debug!(uuid = %request.type_uuid, "instantiation requested");

        let outcome = match self.creators.get_mut(&request.type_uuid) {
            Some(creator) => creator
                .instantiate(Duration::from_millis(u64::from(
                    request.instantiation_timeout_ms,
                )))
                .map_err(|e| e.to_string()),
            None => Err(format!("unknown slave type {}", request.type_uuid)),
        };

        match outcome {
            Ok(locator) => {
                info!(control = %locator.control, "slave instantiated");
                let body = provider::encode_body(&provider::InstantiateSlaveReply {
                    slave_locator: locator,
                })
                .ok()?;
                Some((provider::OK.as_bytes().to_vec(), Some(body)))
            }
            Err(detail) => {
                warn!(detail, "instantiation failed");
                let body = provider::encode_body(&ErrorReply { detail }).ok()?;
                Some((provider::ERROR.as_bytes().to_vec(), Some(body)))
            }
        }
    }
}

impl ServerProtocolHandler for ProviderHandler {
    fn handle(
        &mut self,
        _reactor: &mut Reactor,
        _version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        if header == provider::GET_SLAVE_TYPES.as_bytes() {
            self.list_slave_types()
        } else if header == provider::INSTANTIATE_SLAVE.as_bytes() {
            self.instantiate(body)
        } else {
            warn!("dropping request with unknown header");
            None
        }
    }
}
