//! Shared model instances and slave plumbing for the execution tests.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use coral_net::{Endpoint, SlaveLocator};
use coral_slave::{Instance, InstanceError, RunOptions, SlaveRunner};
use coral_types::{
    Causality, DataType, ScalarValue, SlaveTypeDescription, TimeDuration, TimePoint, Variability,
    VariableDescription, VariableId,
};
use uuid::Uuid;

pub const MASS_TYPE_UUID: Uuid = Uuid::from_u128(0x4D41_5353);
pub const SPRING_TYPE_UUID: Uuid = Uuid::from_u128(0x5350_5247);

fn real_var(id: u16, name: &str, causality: Causality) -> VariableDescription {
    VariableDescription {
        id: VariableId::new(id),
        name: name.to_string(),
        data_type: DataType::Real,
        causality,
        variability: if causality == Causality::Parameter {
            Variability::Fixed
        } else {
            Variability::Continuous
        },
    }
}

/// A 1-D point mass under an external force, integrated with explicit
/// Euler. Variables: mass (0, parameter), force (1, input),
/// position (2, output), velocity (3, output).
pub struct Mass1d {
    pub mass: f64,
    pub force: f64,
    pub position: f64,
    pub velocity: f64,
    /// When set, `do_step` starts returning `false` at this step index.
    pub fail_at_step: Option<u32>,
    /// When set, outputs are withheld from this step index on.
    pub silent_from_step: Option<u32>,
    steps_taken: u32,
}

impl Mass1d {
    pub fn new() -> Self {
        Self {
            mass: 1.0,
            force: 0.0,
            position: 0.0,
            velocity: 0.0,
            fail_at_step: None,
            silent_from_step: None,
            steps_taken: 0,
        }
    }

    /// One Euler step; also the reference implementation for the
    /// distributed-equals-local comparison.
    pub fn euler_step(&mut self, dt: TimeDuration) {
        let acceleration = self.force / self.mass;
        self.velocity += acceleration * dt;
        self.position += self.velocity * dt;
    }
}

impl Instance for Mass1d {
    fn type_description(&self) -> SlaveTypeDescription {
        SlaveTypeDescription {
            name: "mass_1d".into(),
            uuid: MASS_TYPE_UUID,
            description: "a 1-D point mass".into(),
            author: "coral tests".into(),
            version: "1.0".into(),
            variables: vec![
                real_var(0, "mass", Causality::Parameter),
                real_var(1, "force", Causality::Input),
                real_var(2, "position", Causality::Output),
                real_var(3, "velocity", Causality::Output),
            ],
        }
    }

    fn setup(&mut self, _: &str, _: &str, _: TimePoint, _: TimePoint) -> Result<(), InstanceError> {
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<(), InstanceError> {
        Ok(())
    }

    fn end_simulation(&mut self) {}

    fn do_step(&mut self, _: TimePoint, dt: TimeDuration) -> bool {
        if self.fail_at_step == Some(self.steps_taken) {
            return false;
        }
        self.euler_step(dt);
        self.steps_taken += 1;
        true
    }

    fn get_variable(&self, id: VariableId) -> Option<ScalarValue> {
        if self
            .silent_from_step
            .is_some_and(|from| self.steps_taken >= from)
        {
            return None;
        }
        match u16::from(id) {
            0 => Some(ScalarValue::Real(self.mass)),
            1 => Some(ScalarValue::Real(self.force)),
            2 => Some(ScalarValue::Real(self.position)),
            3 => Some(ScalarValue::Real(self.velocity)),
            _ => None,
        }
    }

    fn set_variable(&mut self, id: VariableId, value: &ScalarValue) -> bool {
        match (u16::from(id), value) {
            (0, ScalarValue::Real(v)) => {
                self.mass = *v;
                true
            }
            (1, ScalarValue::Real(v)) => {
                self.force = *v;
                true
            }
            (2, ScalarValue::Real(v)) => {
                self.position = *v;
                true
            }
            _ => false,
        }
    }
}

/// A linear spring between a fixed anchor and a moving end.
/// Variables: stiffness (0, parameter), uncompressed_length (1,
/// parameter), position_a (2, input), position_b (3, input),
/// force_b (4, output).
pub struct Spring1d {
    pub stiffness: f64,
    pub uncompressed_length: f64,
    pub position_a: f64,
    pub position_b: f64,
    pub force_b: f64,
}

impl Spring1d {
    pub fn new() -> Self {
        Self {
            stiffness: 1.0,
            uncompressed_length: 0.0,
            position_a: 0.0,
            position_b: 0.0,
            force_b: 0.0,
        }
    }

    /// The spring's step; also the reference implementation.
    pub fn compute(&mut self) {
        let elongation = (self.position_b - self.position_a) - self.uncompressed_length;
        self.force_b = -self.stiffness * elongation;
    }
}

impl Instance for Spring1d {
    fn type_description(&self) -> SlaveTypeDescription {
        SlaveTypeDescription {
            name: "spring_1d".into(),
            uuid: SPRING_TYPE_UUID,
            description: "a linear 1-D spring".into(),
            author: "coral tests".into(),
            version: "1.0".into(),
            variables: vec![
                real_var(0, "stiffness", Causality::Parameter),
                real_var(1, "uncompressed_length", Causality::Parameter),
                real_var(2, "position_a", Causality::Input),
                real_var(3, "position_b", Causality::Input),
                real_var(4, "force_b", Causality::Output),
            ],
        }
    }

    fn setup(&mut self, _: &str, _: &str, _: TimePoint, _: TimePoint) -> Result<(), InstanceError> {
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<(), InstanceError> {
        Ok(())
    }

    fn end_simulation(&mut self) {}

    fn do_step(&mut self, _: TimePoint, _: TimeDuration) -> bool {
        self.compute();
        true
    }

    fn get_variable(&self, id: VariableId) -> Option<ScalarValue> {
        match u16::from(id) {
            0 => Some(ScalarValue::Real(self.stiffness)),
            1 => Some(ScalarValue::Real(self.uncompressed_length)),
            2 => Some(ScalarValue::Real(self.position_a)),
            3 => Some(ScalarValue::Real(self.position_b)),
            4 => Some(ScalarValue::Real(self.force_b)),
            _ => None,
        }
    }

    fn set_variable(&mut self, id: VariableId, value: &ScalarValue) -> bool {
        match (u16::from(id), value) {
            (0, ScalarValue::Real(v)) => {
                self.stiffness = *v;
                true
            }
            (1, ScalarValue::Real(v)) => {
                self.uncompressed_length = *v;
                true
            }
            (2, ScalarValue::Real(v)) => {
                self.position_a = *v;
                true
            }
            (3, ScalarValue::Real(v)) => {
                self.position_b = *v;
                true
            }
            _ => false,
        }
    }
}

/// A slave running on a local thread.
pub struct LocalSlave {
    pub locator: SlaveLocator,
    pub handle: thread::JoinHandle<()>,
}

/// Spawns an instance as a slave on a background thread.
///
/// The runner is reactor-based and thread-local, so it is built on the
/// slave's own thread; the bound endpoints come back over a channel.
pub fn spawn_slave<I: Instance + Send + 'static>(instance: I) -> LocalSlave {
    let (locator_tx, locator_rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
        let options = RunOptions {
            control_endpoint: Endpoint::new("127.0.0.1", 0),
            data_pub_endpoint: Endpoint::new("127.0.0.1", 0),
            master_inactivity_timeout: Duration::from_secs(60),
        };
        let runner = SlaveRunner::new(Box::new(instance), &options).expect("bind slave");
        locator_tx
            .send(SlaveLocator::new(
                runner.bound_control_endpoint().clone(),
                runner.bound_data_endpoint().clone(),
            ))
            .expect("report locator");
        runner.run().expect("slave run");
    });
    let locator = locator_rx.recv().expect("slave failed to start");
    LocalSlave { locator, handle }
}
