//! Variable I/O: output publishing and the per-step input barrier.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use coral_net::{Endpoint, NetResult, PubSocket, Reactor, SubSocket};
use coral_protocol::data;
use coral_types::{CommError, ScalarValue, SlaveId, StepId, Variable, VariableId};

use crate::instance::Instance;

/// How many steps ahead of this slave a peer may run. The execution
/// manager never lets any slave lead by more than one step, so samples
/// further ahead than this indicate a protocol error and bound the buffer.
const MAX_LEAD_STEPS: usize = 1;

/// The input side of a slave's variable traffic: the couplings from
/// remote outputs to local inputs, the subscriber socket they ride on,
/// and the barrier that holds a step open until every coupled input has
/// arrived.
pub struct VariableConnections {
    sub: SubSocket,
    /// Remote output → local input it feeds.
    couplings: HashMap<Variable, VariableId>,
    /// Samples for steps we have not reached yet. Publish/subscribe is
    /// not synchronized with the control protocol, so a fast peer's next
    /// step can land before this slave finishes the current one.
    future: BTreeMap<(StepId, Variable), ScalarValue>,
}

impl VariableConnections {
    pub fn new() -> NetResult<Self> {
        Ok(Self {
            sub: SubSocket::new()?,
            couplings: HashMap::new(),
            future: BTreeMap::new(),
        })
    }

    /// Couples a remote output variable to a local input variable.
    ///
    /// A local input has exactly one source: coupling it again replaces
    /// the previous coupling.
    pub fn couple(&mut self, remote_output: Variable, local_input: VariableId) {
        // Drop a previous coupling feeding the same local input.
        let replaced: Vec<Variable> = self
            .couplings
            .iter()
            .filter(|(remote, local)| **local == local_input && **remote != remote_output)
            .map(|(remote, _)| *remote)
            .collect();
        for old in replaced {
            self.couplings.remove(&old);
            self.sub.unsubscribe(&data::subscription_prefix(old));
        }

        self.sub
            .subscribe(data::subscription_prefix(remote_output).to_vec());
        self.couplings.insert(remote_output, local_input);
        trace!(%remote_output, %local_input, "coupled remote output to local input");
    }

    /// Replaces the set of peer publishers this slave listens to.
    ///
    /// Anything a dropped peer has sent but this slave has not consumed
    /// is discarded with the connection; nothing is drained or forwarded.
    pub fn connect_peers(&mut self, peers: &[Endpoint]) -> NetResult<()> {
        let dropped = self.sub.set_peers(peers)?;
        for peer in dropped {
            warn!(%peer, "disconnected from peer; its unconsumed samples are discarded");
        }
        Ok(())
    }

    /// Number of coupled inputs.
    pub fn coupling_count(&self) -> usize {
        self.couplings.len()
    }

    /// The barrier: blocks until every coupled input has received its
    /// sample for `step`, or the timeout expires.
    ///
    /// Late samples (from steps already completed) are discarded; early
    /// samples (from steps not yet reached) are buffered for later
    /// barriers, within the lead bound.
    pub fn update(
        &mut self,
        instance: &mut dyn Instance,
        step: StepId,
        timeout: Duration,
    ) -> Result<(), CommError> {
        let mut pending: Vec<Variable> = self.couplings.keys().copied().collect();
        if pending.is_empty() {
            return Ok(());
        }

        // Serve from the future buffer first.
        pending.retain(|remote| {
            match self.future.remove(&(step, *remote)) {
                Some(value) => {
                    Self::assign(instance, &self.couplings, *remote, &value);
                    false
                }
                None => true,
            }
        });

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(step = %step, missing = pending.len(), "input barrier timed out");
                return Err(CommError::DataTimeout);
            }
            let Some(message) = self
                .sub
                .recv_timeout(remaining)
                .map_err(CommError::from)?
            else {
                continue;
            };
            let sample = match data::decode(&message) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(error = %e, "discarding undecodable sample");
                    continue;
                }
            };

            if sample.step_id == step {
                if let Some(index) = pending.iter().position(|v| *v == sample.variable) {
                    Self::assign(instance, &self.couplings, sample.variable, &sample.value);
                    pending.swap_remove(index);
                } else {
                    trace!(variable = %sample.variable, "duplicate sample for current step");
                }
            } else if Self::is_stale(sample.step_id, step) {
                trace!(
                    variable = %sample.variable,
                    sample_step = %sample.step_id,
                    "discarding stale sample"
                );
            } else {
                self.buffer_future(sample.step_id, sample.variable, sample.value);
            }
        }
        Ok(())
    }

    /// True if a sample tagged `sample_step` is from a step that lies
    /// behind `current`. The pre-simulation tag never lies ahead of a
    /// real step, and real steps never lie behind it.
    fn is_stale(sample_step: StepId, current: StepId) -> bool {
        if current == StepId::PRE_SIMULATION {
            false
        } else {
            sample_step == StepId::PRE_SIMULATION || sample_step < current
        }
    }

    fn buffer_future(&mut self, step: StepId, variable: Variable, value: ScalarValue) {
        let bound = self.couplings.len() * MAX_LEAD_STEPS;
        if self.future.len() >= bound {
            if let Some((&key, _)) = self.future.iter().next() {
                warn!(
                    dropped_step = %key.0,
                    dropped_variable = %key.1,
                    "future-sample buffer full; dropping oldest entry"
                );
                self.future.remove(&key);
            }
        }
        self.future.insert((step, variable), value);
    }

    fn assign(
        instance: &mut dyn Instance,
        couplings: &HashMap<Variable, VariableId>,
        remote: Variable,
        value: &ScalarValue,
    ) {
        let Some(local) = couplings.get(&remote) else {
            return;
        };
        if !instance.set_variable(*local, value) {
            warn!(%remote, local = %local, "model rejected incoming variable value");
        }
    }
}

/// Publishes every output variable of the instance at the given step.
pub fn publish_all(
    publisher: &mut PubSocket,
    reactor: &mut Reactor,
    instance: &dyn Instance,
    slave_id: SlaveId,
    step: StepId,
) {
    let description = instance.type_description();
    for output in description.outputs() {
        let Some(value) = instance.get_variable(output.id) else {
            warn!(variable = %output.id, "output variable missing from model; not published");
            continue;
        };
        let sample = data::DataMessage {
            variable: Variable::new(slave_id, output.id),
            step_id: step,
            value,
        };
        match data::encode(&sample) {
            Ok(message) => publisher.publish(reactor, &message),
            Err(e) => warn!(error = %e, "failed to encode sample"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_types::{
        Causality, DataType, SlaveTypeDescription, Variability, VariableDescription,
    };

    /// A model with inputs 0..n and no outputs, recording what is set.
    struct Sink {
        inputs: usize,
        written: Vec<(VariableId, ScalarValue)>,
    }

    impl Instance for Sink {
        fn type_description(&self) -> SlaveTypeDescription {
            SlaveTypeDescription {
                name: "sink".into(),
                uuid: uuid_for_tests(),
                description: String::new(),
                author: String::new(),
                version: "1".into(),
                variables: (0..self.inputs)
                    .map(|i| VariableDescription {
                        id: VariableId::new(i as u16),
                        name: format!("in{i}"),
                        data_type: DataType::Real,
                        causality: Causality::Input,
                        variability: Variability::Continuous,
                    })
                    .collect(),
            }
        }

        fn setup(
            &mut self,
            _: &str,
            _: &str,
            _: f64,
            _: f64,
        ) -> Result<(), crate::InstanceError> {
            Ok(())
        }

        fn start_simulation(&mut self) -> Result<(), crate::InstanceError> {
            Ok(())
        }

        fn end_simulation(&mut self) {}

        fn do_step(&mut self, _: f64, _: f64) -> bool {
            true
        }

        fn get_variable(&self, _: VariableId) -> Option<ScalarValue> {
            None
        }

        fn set_variable(&mut self, id: VariableId, value: &ScalarValue) -> bool {
            self.written.push((id, value.clone()));
            true
        }
    }

    fn uuid_for_tests() -> uuid::Uuid {
        uuid::Uuid::nil()
    }

    fn remote(slave: u16, var: u16) -> Variable {
        Variable::new(SlaveId::new(slave), VariableId::new(var))
    }

    #[test]
    fn barrier_with_no_couplings_succeeds_immediately() {
        let mut connections = VariableConnections::new().unwrap();
        let mut sink = Sink {
            inputs: 0,
            written: Vec::new(),
        };
        let started = Instant::now();
        connections
            .update(&mut sink, StepId::new(0), Duration::from_secs(10))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn barrier_times_out_when_inputs_are_missing() {
        let mut connections = VariableConnections::new().unwrap();
        connections.couple(remote(2, 0), VariableId::new(0));
        let mut sink = Sink {
            inputs: 1,
            written: Vec::new(),
        };
        let result = connections.update(&mut sink, StepId::new(0), Duration::from_millis(50));
        assert_eq!(result, Err(CommError::DataTimeout));
    }

    #[test]
    fn recoupling_a_local_input_replaces_its_source() {
        let mut connections = VariableConnections::new().unwrap();
        connections.couple(remote(2, 0), VariableId::new(0));
        connections.couple(remote(3, 5), VariableId::new(0));
        assert_eq!(connections.coupling_count(), 1);
    }

    #[test]
    fn staleness_respects_the_pre_simulation_tag() {
        // During priming nothing is stale.
        assert!(!VariableConnections::is_stale(
            StepId::new(0),
            StepId::PRE_SIMULATION
        ));
        // Priming samples are stale once real steps run.
        assert!(VariableConnections::is_stale(
            StepId::PRE_SIMULATION,
            StepId::new(0)
        ));
        // Ordinary ordering.
        assert!(VariableConnections::is_stale(StepId::new(1), StepId::new(2)));
        assert!(!VariableConnections::is_stale(
            StepId::new(3),
            StepId::new(2)
        ));
    }

    #[test]
    fn future_buffer_is_bounded_by_coupling_count() {
        let mut connections = VariableConnections::new().unwrap();
        connections.couple(remote(2, 0), VariableId::new(0));
        connections.couple(remote(2, 1), VariableId::new(1));

        connections.buffer_future(StepId::new(5), remote(2, 0), ScalarValue::Real(1.0));
        connections.buffer_future(StepId::new(5), remote(2, 1), ScalarValue::Real(2.0));
        // The bound is 2; the oldest entry must give way.
        connections.buffer_future(StepId::new(6), remote(2, 0), ScalarValue::Real(3.0));
        assert_eq!(connections.future.len(), 2);
        assert!(!connections
            .future
            .contains_key(&(StepId::new(5), remote(2, 0))));
    }
}
