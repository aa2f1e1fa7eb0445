//! Discovery-fed client pool for slave providers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use coral_discovery::{ServiceEvents, Tracker};
use coral_net::{CommThread, Endpoint, SlaveLocator};
use coral_protocol::provider::{
    self, InstantiateSlaveReply, InstantiateSlaveRequest, SlaveTypeList,
};
use coral_rpc::RrClient;
use coral_types::{CommError, SlaveTypeDescription};
use uuid::Uuid;

/// The period of silence after which a slave provider is considered lost.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(600);

/// TCP connect budget towards a freshly discovered provider.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One slave type, offered by one or more providers.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveType {
    pub description: SlaveTypeDescription,
    /// IDs of the providers that offer this type.
    pub providers: Vec<String>,
}

struct ProviderEntry {
    client: RrClient,
    endpoint: Endpoint,
}

type ProviderMap = Rc<RefCell<HashMap<String, ProviderEntry>>>;

struct ClusterState {
    /// Feeds the provider map; lives on the comm thread with it.
    tracker: Tracker,
    providers: ProviderMap,
}

/// Tracks the slave providers on a network partition and lets the master
/// query them for slave types and instantiate slaves on them.
///
/// Providers appear and disappear with their discovery beacons; an RPC
/// client per provider is created and dropped accordingly on a dedicated
/// communication thread.
pub struct ProviderCluster {
    thread: CommThread<ClusterState>,
}

impl ProviderCluster {
    /// Creates a cluster client listening on the given discovery port
    /// within the given partition.
    pub fn new(partition_id: u32, discovery_port: u16) -> Result<Self, CommError> {
        Self::with_timeout(partition_id, discovery_port, PROVIDER_TIMEOUT)
    }

    /// Like [`ProviderCluster::new`], with an explicit silence period
    /// after which a provider is dropped.
    pub fn with_timeout(
        partition_id: u32,
        discovery_port: u16,
        provider_timeout: Duration,
    ) -> Result<Self, CommError> {
        let thread = CommThread::spawn("provider-cluster", move |reactor| {
            let tracker = Tracker::new(reactor, partition_id, discovery_port)?;
            let providers: ProviderMap = Rc::new(RefCell::new(HashMap::new()));

            let on_appeared = Rc::clone(&providers);
            let on_changed = Rc::clone(&providers);
            let on_disappeared = Rc::clone(&providers);
            tracker.add_tracked_service_type(
                reactor,
                provider::SERVICE_TYPE,
                provider_timeout,
                ServiceEvents {
                    on_appeared: Some(Box::new(move |reactor, id, payload, addr| {
                        connect_provider(&on_appeared, reactor, id, payload, addr);
                    })),
                    on_payload_changed: Some(Box::new(move |reactor, id, payload, addr| {
                        // Reconnect to the provider's new endpoint.
                        if let Some(old) = on_changed.borrow_mut().remove(id) {
                            old.client.close(reactor);
                        }
                        connect_provider(&on_changed, reactor, id, payload, addr);
                    })),
                    on_disappeared: Some(Box::new(move |reactor, id| {
                        info!(provider = id, "slave provider disappeared");
                        if let Some(entry) = on_disappeared.borrow_mut().remove(id) {
                            entry.client.close(reactor);
                        }
                    })),
                },
            );

            Ok(ClusterState { tracker, providers })
        })
        .map_err(CommError::from)?;
        Ok(Self { thread })
    }

    /// The UDP port the discovery tracker is bound to.
    pub fn discovery_port(&self) -> Result<u16, CommError> {
        self.thread
            .execute_wait(|_, state, promise| promise.fulfil(state.tracker.port()))
    }

    /// The providers currently known to the cluster.
    pub fn provider_ids(&self) -> Result<Vec<String>, CommError> {
        self.thread.execute_wait(|_, state, promise| {
            let mut ids: Vec<String> = state.providers.borrow().keys().cloned().collect();
            ids.sort();
            promise.fulfil(ids);
        })
    }

    /// Asks every currently known provider for its slave types and
    /// merges the replies, deduplicated by type UUID, each entry carrying
    /// the providers that offer it.
    ///
    /// Providers that fail or time out simply contribute nothing.
    pub fn get_slave_types(&self, timeout: Duration) -> Result<Vec<SlaveType>, CommError> {
        self.thread.execute_wait(move |reactor, state, promise| {
            let providers = state.providers.borrow();
            let live: Vec<&String> = providers
                .keys()
                .filter(|id| !providers[*id].client.is_busy())
                .collect();
            if live.is_empty() {
                promise.fulfil(Vec::new());
                return;
            }

            struct Aggregate {
                remaining: usize,
                types: HashMap<Uuid, SlaveType>,
                promise: Option<coral_net::Promise<Vec<SlaveType>>>,
            }
            let aggregate = Rc::new(RefCell::new(Aggregate {
                remaining: live.len(),
                types: HashMap::new(),
                promise: Some(promise),
            }));

            for id in live {
                let entry = &providers[id];
                let provider_id = id.clone();
                let slot = Rc::clone(&aggregate);
                entry.client.request(
                    reactor,
                    provider::PROTOCOL_VERSION,
                    provider::GET_SLAVE_TYPES.as_bytes(),
                    None,
                    timeout,
                    Box::new(move |result| {
                        let mut aggregate = slot.borrow_mut();
                        match result {
                            Ok((header, body)) if header == provider::OK.as_bytes() => {
                                match body
                                    .as_deref()
                                    .ok_or_else(|| missing_body_error())
                                    .and_then(|b| {
                                        provider::decode_body::<SlaveTypeList>(b)
                                            .map_err(CommError::from)
                                    }) {
                                    Ok(list) => {
                                        for description in list.slave_types {
                                            aggregate
                                                .types
                                                .entry(description.uuid)
                                                .or_insert_with(|| SlaveType {
                                                    description: description.clone(),
                                                    providers: Vec::new(),
                                                })
                                                .providers
                                                .push(provider_id.clone());
                                        }
                                    }
                                    Err(e) => {
                                        warn!(provider = provider_id, error = %e, "bad slave-type reply");
                                    }
                                }
                            }
                            Ok(_) => {
                                warn!(provider = provider_id, "provider refused slave-type query");
                            }
                            Err(e) => {
                                warn!(provider = provider_id, error = %e, "slave-type query failed");
                            }
                        }
                        aggregate.remaining -= 1;
                        if aggregate.remaining == 0 {
                            let mut merged: Vec<SlaveType> =
                                std::mem::take(&mut aggregate.types).into_values().collect();
                            merged.sort_by(|a, b| a.description.name.cmp(&b.description.name));
                            for slave_type in &mut merged {
                                slave_type.providers.sort();
                            }
                            if let Some(promise) = aggregate.promise.take() {
                                promise.fulfil(merged);
                            }
                        }
                    }),
                );
            }
        })
    }

    /// Asks one provider to spawn a slave of the given type and returns
    /// the newborn slave's locator.
    ///
    /// `instantiation_timeout` is the slave's startup budget; the
    /// communication deadline is twice that, to additionally cover
    /// transport.
    pub fn instantiate_slave(
        &self,
        provider_id: &str,
        type_uuid: Uuid,
        instantiation_timeout: Duration,
    ) -> Result<SlaveLocator, CommError> {
        let provider_id = provider_id.to_string();
        self.thread
            .execute_wait(move |reactor, state, promise| {
                let providers = state.providers.borrow();
                let Some(entry) = providers.get(&provider_id) else {
                    promise.fulfil(Err(CommError::OperationFailed(format!(
                        "unknown slave provider \"{provider_id}\""
                    ))));
                    return;
                };
                debug!(provider = provider_id, %type_uuid, "instantiating slave");

                let body = match provider::encode_body(&InstantiateSlaveRequest {
                    type_uuid,
                    instantiation_timeout_ms: instantiation_timeout.as_millis() as u32,
                }) {
                    Ok(body) => body,
                    Err(e) => {
                        promise.fulfil(Err(e.into()));
                        return;
                    }
                };

                entry.client.request(
                    reactor,
                    provider::PROTOCOL_VERSION,
                    provider::INSTANTIATE_SLAVE.as_bytes(),
                    Some(&body),
                    instantiation_timeout * 2,
                    Box::new(move |result| {
                        let outcome = result.and_then(|(header, body)| {
                            if header == provider::OK.as_bytes() {
                                let body = body.as_deref().ok_or_else(missing_body_error)?;
                                let reply: InstantiateSlaveReply =
                                    provider::decode_body(body).map_err(CommError::from)?;
                                Ok(reply.slave_locator)
                            } else {
                                let detail = body
                                    .as_deref()
                                    .and_then(|b| {
                                        provider::decode_body::<provider::ErrorReply>(b).ok()
                                    })
                                    .map_or_else(
                                        || "instantiation failed".to_string(),
                                        |e| e.detail,
                                    );
                                Err(CommError::OperationFailed(detail))
                            }
                        });
                        promise.fulfil(outcome);
                    }),
                );
            })?
    }
}

/// Creates an RPC client for a provider announced by the tracker.
fn connect_provider(
    providers: &ProviderMap,
    reactor: &mut coral_net::Reactor,
    id: &str,
    payload: &[u8],
    addr: std::net::IpAddr,
) {
    let Some(port) = provider::decode_beacon_payload(payload) else {
        warn!(provider = id, "beacon payload does not carry an RPC port; ignoring");
        return;
    };
    let endpoint = Endpoint::new(addr.to_string(), port);
    match RrClient::connect(
        reactor,
        provider::PROTOCOL_ID,
        &endpoint,
        Some(CONNECT_TIMEOUT),
    ) {
        Ok(client) => {
            info!(provider = id, %endpoint, "slave provider available");
            providers
                .borrow_mut()
                .insert(id.to_string(), ProviderEntry { client, endpoint });
        }
        Err(e) => {
            warn!(provider = id, %endpoint, error = %e, "could not reach slave provider");
        }
    }
}

fn missing_body_error() -> CommError {
    CommError::BadMessage("reply is missing its body".to_string())
}
