//! Drives real slave agents over loopback TCP with a scripted master.

use std::thread;
use std::time::Duration;

use coral_net::{Endpoint, ReqSocket};
use coral_protocol::control::{
    ControlMsg, ErrorCode, SetPeersData, SetVarsData, SetupData, StepData, MAX_PROTOCOL_VERSION,
};
use coral_protocol::data;
use coral_slave::{Instance, InstanceError, RunOptions, SlaveRunner};
use coral_types::{
    Causality, DataType, ScalarValue, SlaveId, SlaveTypeDescription, StepId, Variability,
    Variable, VariableDescription, VariableId, VariableSetting,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// A model with one real input (ID 1) and one real output (ID 0).
/// Each step sets `output = input + offset`. Fails on command.
struct Adder {
    offset: f64,
    input: f64,
    output: f64,
    fail_at_step: Option<u32>,
    steps_taken: u32,
}

impl Adder {
    fn new(offset: f64, initial_output: f64) -> Self {
        Self {
            offset,
            input: 0.0,
            output: initial_output,
            fail_at_step: None,
            steps_taken: 0,
        }
    }
}

impl Instance for Adder {
    fn type_description(&self) -> SlaveTypeDescription {
        SlaveTypeDescription {
            name: "adder".into(),
            uuid: uuid::Uuid::from_u128(0xADD),
            description: "output = input + offset".into(),
            author: "tests".into(),
            version: "1.0".into(),
            variables: vec![
                VariableDescription {
                    id: VariableId::new(0),
                    name: "sum".into(),
                    data_type: DataType::Real,
                    causality: Causality::Output,
                    variability: Variability::Continuous,
                },
                VariableDescription {
                    id: VariableId::new(1),
                    name: "addend".into(),
                    data_type: DataType::Real,
                    causality: Causality::Input,
                    variability: Variability::Continuous,
                },
            ],
        }
    }

    fn setup(&mut self, _: &str, _: &str, _: f64, _: f64) -> Result<(), InstanceError> {
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<(), InstanceError> {
        Ok(())
    }

    fn end_simulation(&mut self) {}

    fn do_step(&mut self, _: f64, _: f64) -> bool {
        if self.fail_at_step == Some(self.steps_taken) {
            return false;
        }
        self.steps_taken += 1;
        self.output = self.input + self.offset;
        true
    }

    fn get_variable(&self, id: VariableId) -> Option<ScalarValue> {
        match u16::from(id) {
            0 => Some(ScalarValue::Real(self.output)),
            1 => Some(ScalarValue::Real(self.input)),
            _ => None,
        }
    }

    fn set_variable(&mut self, id: VariableId, value: &ScalarValue) -> bool {
        match (u16::from(id), value) {
            (1, ScalarValue::Real(v)) => {
                self.input = *v;
                true
            }
            _ => false,
        }
    }
}

struct RunningSlave {
    control: Endpoint,
    data: Endpoint,
    handle: thread::JoinHandle<()>,
}

fn spawn_slave(instance: Adder) -> RunningSlave {
    // The runner is reactor-based and thread-local; build it on the
    // slave's own thread and send the bound endpoints back.
    let (endpoint_tx, endpoint_rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
        let options = RunOptions {
            control_endpoint: Endpoint::new("127.0.0.1", 0),
            data_pub_endpoint: Endpoint::new("127.0.0.1", 0),
            master_inactivity_timeout: Duration::from_secs(60),
        };
        let runner = SlaveRunner::new(Box::new(instance), &options).unwrap();
        endpoint_tx
            .send((
                runner.bound_control_endpoint().clone(),
                runner.bound_data_endpoint().clone(),
            ))
            .unwrap();
        runner.run().unwrap();
    });
    let (control, data) = endpoint_rx.recv().unwrap();
    RunningSlave {
        control,
        data,
        handle,
    }
}

/// A blocking, scripted master for one slave.
struct Master {
    socket: ReqSocket,
    version: u16,
}

impl Master {
    fn connect(endpoint: &Endpoint) -> Self {
        Self {
            socket: ReqSocket::connect(endpoint, Some(TIMEOUT)).unwrap(),
            version: MAX_PROTOCOL_VERSION,
        }
    }

    fn roundtrip(&mut self, request: &ControlMsg) -> ControlMsg {
        self.socket.send(&request.encode(self.version).unwrap()).unwrap();
        let reply = self
            .socket
            .recv_timeout(TIMEOUT)
            .unwrap()
            .expect("no reply before deadline");
        ControlMsg::decode(&reply).unwrap().1
    }

    fn hello(&mut self, requested: u16) -> u16 {
        let msg = ControlMsg::Hello { version: requested };
        self.socket.send(&msg.encode(requested).unwrap()).unwrap();
        let reply = self.socket.recv_timeout(TIMEOUT).unwrap().unwrap();
        match ControlMsg::decode(&reply).unwrap().1 {
            ControlMsg::Hello { version } => {
                self.version = version;
                version
            }
            other => panic!("expected HELLO reply, got {other:?}"),
        }
    }

    fn setup(&mut self, slave_id: u16, name: &str) {
        let reply = self.roundtrip(&ControlMsg::Setup(SetupData {
            slave_id: SlaveId::new(slave_id),
            start_time: 0.0,
            stop_time: Some(10.0),
            variable_pub_endpoint: String::new(),
            variable_sub_endpoint: String::new(),
            execution_name: "test-execution".into(),
            slave_name: name.into(),
            variable_recv_timeout_ms: 1000,
        }));
        assert_eq!(reply, ControlMsg::Ready);
    }

    fn terminate(mut self) {
        let msg = ControlMsg::Terminate.encode(self.version).unwrap();
        self.socket.send(&msg).unwrap();
        // No reply is expected for TERMINATE.
    }
}

#[test]
fn full_command_cycle_for_a_single_slave() {
    let slave = spawn_slave(Adder::new(1.0, 0.0));
    let mut master = Master::connect(&slave.control);

    assert_eq!(master.hello(0), 0);
    master.setup(1, "adder-1");

    // DESCRIBE returns the full type description.
    match master.roundtrip(&ControlMsg::Describe) {
        ControlMsg::Description(td) => {
            assert_eq!(td.name, "adder");
            assert_eq!(td.variables.len(), 2);
        }
        other => panic!("expected description, got {other:?}"),
    }

    // Assign a value to the input.
    let reply = master.roundtrip(&ControlMsg::SetVars(SetVarsData {
        variables: vec![VariableSetting::value(VariableId::new(1), 41.0)],
    }));
    assert_eq!(reply, ControlMsg::Ready);

    // Step and accept; no couplings, so the barrier is trivial.
    let reply = master.roundtrip(&ControlMsg::Step(StepData {
        step_id: StepId::new(0),
        timepoint: 0.0,
        stepsize: 0.1,
    }));
    assert_eq!(reply, ControlMsg::StepOk);
    assert_eq!(master.roundtrip(&ControlMsg::AcceptStep), ControlMsg::Ready);

    master.terminate();
    slave.handle.join().unwrap();
}

#[test]
fn hello_negotiates_down_to_the_agent_version() {
    let slave = spawn_slave(Adder::new(0.0, 0.0));
    let mut master = Master::connect(&slave.control);

    // Asking for a far-future version gets the agent's actual maximum.
    assert_eq!(master.hello(7), MAX_PROTOCOL_VERSION);

    // The negotiated session works normally afterwards.
    master.setup(1, "adder-1");
    master.terminate();
    slave.handle.join().unwrap();
}

#[test]
fn set_vars_reports_unsettable_variables() {
    let slave = spawn_slave(Adder::new(0.0, 0.0));
    let mut master = Master::connect(&slave.control);
    assert_eq!(master.hello(0), 0);
    master.setup(1, "adder-1");

    // Variable 9 does not exist; the reply must be the non-fatal error.
    let reply = master.roundtrip(&ControlMsg::SetVars(SetVarsData {
        variables: vec![VariableSetting::value(VariableId::new(9), 1.0)],
    }));
    match reply {
        ControlMsg::Error(info) => assert_eq!(info.code, ErrorCode::CannotSetVariable),
        other => panic!("expected CANNOT_SET_VARIABLE, got {other:?}"),
    }

    // The agent stays usable.
    assert_eq!(
        master.roundtrip(&ControlMsg::Describe),
        ControlMsg::Description(Adder::new(0.0, 0.0).type_description())
    );
    master.terminate();
    slave.handle.join().unwrap();
}

#[test]
fn failed_step_leaves_only_terminate() {
    let mut adder = Adder::new(0.0, 0.0);
    adder.fail_at_step = Some(0);
    let slave = spawn_slave(adder);
    let mut master = Master::connect(&slave.control);
    assert_eq!(master.hello(0), 0);
    master.setup(1, "adder-1");

    let reply = master.roundtrip(&ControlMsg::Step(StepData {
        step_id: StepId::new(0),
        timepoint: 0.0,
        stepsize: 0.1,
    }));
    assert_eq!(reply, ControlMsg::StepFailed);

    // Termination still works cleanly.
    master.terminate();
    slave.handle.join().unwrap();
}

#[test]
fn inactivity_timeout_shuts_the_slave_down() {
    let handle = thread::spawn(|| {
        let options = RunOptions {
            control_endpoint: Endpoint::new("127.0.0.1", 0),
            data_pub_endpoint: Endpoint::new("127.0.0.1", 0),
            master_inactivity_timeout: Duration::from_millis(100),
        };
        let runner = SlaveRunner::new(Box::new(Adder::new(0.0, 0.0)), &options).unwrap();
        runner.run().unwrap();
    });
    // No master ever talks to it; it must exit on its own.
    handle.join().unwrap();
}

#[test]
fn samples_flow_between_two_slaves() {
    // Slave 1's output feeds slave 2's input.
    let producer = spawn_slave(Adder::new(1.0, 100.0));
    let consumer = spawn_slave(Adder::new(10.0, 0.0));

    let mut master1 = Master::connect(&producer.control);
    let mut master2 = Master::connect(&consumer.control);
    assert_eq!(master1.hello(0), 0);
    assert_eq!(master2.hello(0), 0);
    master1.setup(1, "producer");
    master2.setup(2, "consumer");

    // Couple consumer.addend ⇐ producer.sum and point the consumer at the
    // producer's publisher.
    let reply = master2.roundtrip(&ControlMsg::SetVars(SetVarsData {
        variables: vec![VariableSetting::connection(
            VariableId::new(1),
            Variable::new(SlaveId::new(1), VariableId::new(0)),
        )],
    }));
    assert_eq!(reply, ControlMsg::Ready);
    let reply = master2.roundtrip(&ControlMsg::SetPeers(SetPeersData {
        peers: vec![producer.data.url()],
    }));
    assert_eq!(reply, ControlMsg::Ready);

    // Prime: the producer publishes its current outputs, the consumer
    // waits for them. Retry while the subscription finishes joining.
    let mut primed = false;
    for _ in 0..5 {
        assert_eq!(master1.roundtrip(&ControlMsg::ResendVars), ControlMsg::Ready);
        match master2.roundtrip(&ControlMsg::ResendVars) {
            ControlMsg::Ready => {
                primed = true;
                break;
            }
            ControlMsg::Error(info) => assert_eq!(info.code, ErrorCode::TimedOut),
            other => panic!("unexpected priming reply {other:?}"),
        }
    }
    assert!(primed, "priming never succeeded");

    // One lock-stepped time step. The consumer's step-0 output uses the
    // primed input (producer's initial output of 100).
    for master in [&mut master1, &mut master2] {
        let reply = master.roundtrip(&ControlMsg::Step(StepData {
            step_id: StepId::new(0),
            timepoint: 0.0,
            stepsize: 0.1,
        }));
        assert_eq!(reply, ControlMsg::StepOk);
    }

    // Observe the consumer's published output directly.
    let mut observer = coral_net::SubSocket::new().unwrap();
    observer.subscribe(
        data::subscription_prefix(Variable::new(SlaveId::new(2), VariableId::new(0))).to_vec(),
    );
    observer.connect(&consumer.data).unwrap();

    assert_eq!(master1.roundtrip(&ControlMsg::AcceptStep), ControlMsg::Ready);
    assert_eq!(master2.roundtrip(&ControlMsg::AcceptStep), ControlMsg::Ready);

    // Step again so the consumer republishes while we are subscribed.
    for master in [&mut master1, &mut master2] {
        let reply = master.roundtrip(&ControlMsg::Step(StepData {
            step_id: StepId::new(1),
            timepoint: 0.1,
            stepsize: 0.1,
        }));
        assert_eq!(reply, ControlMsg::StepOk);
    }
    let message = observer
        .recv_timeout(TIMEOUT)
        .unwrap()
        .expect("no sample from consumer");
    let sample = data::decode(&message).unwrap();
    assert_eq!(sample.step_id, StepId::new(1));
    // Accepting step 0 set consumer.input to the producer's step-0 output
    // (0 + 1); the consumer's step-1 output is therefore 1 + 10.
    assert_eq!(sample.value, ScalarValue::Real(11.0));

    assert_eq!(master1.roundtrip(&ControlMsg::AcceptStep), ControlMsg::Ready);
    assert_eq!(master2.roundtrip(&ControlMsg::AcceptStep), ControlMsg::Ready);

    master1.terminate();
    master2.terminate();
    producer.handle.join().unwrap();
    consumer.handle.join().unwrap();
}
