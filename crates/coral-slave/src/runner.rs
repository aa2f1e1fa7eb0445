//! Top-level slave entry point.

use std::time::Duration;

use tracing::info;

use coral_net::{Endpoint, NetResult, Reactor};

use crate::agent::{SlaveAgent, SlaveAgentConfig};
use crate::instance::Instance;

/// Options for [`SlaveRunner`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Control endpoint to bind; defaults to an OS-assigned port on all
    /// interfaces.
    pub control_endpoint: Endpoint,
    /// Data-publisher endpoint to bind; same default.
    pub data_pub_endpoint: Endpoint,
    /// How long to survive without hearing from a master.
    pub master_inactivity_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            control_endpoint: Endpoint::new("*", 0),
            data_pub_endpoint: Endpoint::new("*", 0),
            master_inactivity_timeout: Duration::from_secs(600),
        }
    }
}

/// Hosts one [`Instance`] as a network-reachable slave.
///
/// Construction binds the sockets, so the endpoints can be reported (for
/// example to a spawning provider) before [`SlaveRunner::run`] enters the
/// event loop.
pub struct SlaveRunner {
    reactor: Reactor,
    agent: SlaveAgent,
}

impl SlaveRunner {
    pub fn new(instance: Box<dyn Instance>, options: &RunOptions) -> NetResult<Self> {
        let mut reactor = Reactor::new()?;
        let agent = SlaveAgent::new(
            &mut reactor,
            instance,
            &SlaveAgentConfig {
                control_endpoint: options.control_endpoint.clone(),
                data_pub_endpoint: options.data_pub_endpoint.clone(),
                master_inactivity_timeout: options.master_inactivity_timeout,
            },
        )?;
        Ok(Self { reactor, agent })
    }

    /// The endpoint the control server is bound to.
    pub fn bound_control_endpoint(&self) -> &Endpoint {
        self.agent.bound_control_endpoint()
    }

    /// The endpoint the data publisher is bound to.
    pub fn bound_data_endpoint(&self) -> &Endpoint {
        self.agent.bound_data_endpoint()
    }

    /// Runs the slave until it is terminated by the master, the
    /// inactivity timeout fires, or a fatal error occurs.
    pub fn run(mut self) -> NetResult<()> {
        self.reactor.run()?;
        info!("slave finished");
        Ok(())
    }
}
