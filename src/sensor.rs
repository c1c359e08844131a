//! Sensors mounted on robot links.
//!
//! The device drivers themselves are external; this module only keeps the
//! mounting (link + relative transform), pushes the mounted pose into the
//! device every step, and folds the mounting into the structural
//! fingerprint.

use std::cell::RefCell;
use std::rc::Rc;

use crate::fingerprint::{digest, fmt_pose};
use crate::model::{Pose, RigidBodyModel};
use crate::robot::{Robot, StructureChange};

/// One measurement produced by a device: a timestamp plus the raw scalar
/// channels, interpreted by the consumer that knows the device type.
#[derive(Debug, Clone, Default)]
pub struct SensorReading {
    pub stamp: f64,
    pub values: Vec<f64>,
}

/// Index-stable handle to an attached sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorHandle(pub(crate) usize);

impl SensorHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// An external sensor device bindable to a mount point.
pub trait SensorDevice {
    /// Move the device to its mounted world pose.
    fn set_transform(&mut self, pose: &Pose);

    /// Latest measurement, `None` when the device has not produced one yet.
    fn data(&self) -> Option<SensorReading>;

    /// One-line structural summary folded into the fingerprint, so cached
    /// models notice a swapped device.
    fn structure_descriptor(&self) -> String {
        String::new()
    }
}

pub type SensorDeviceRef = Rc<RefCell<dyn SensorDevice>>;

pub struct AttachedSensor {
    pub name: String,
    /// Link the sensor is mounted on.
    pub link: usize,
    /// Mount transform relative to the link.
    pub relative: Pose,
    pub(crate) device: Option<SensorDeviceRef>,
    pub(crate) structure_hash: String,
}

impl AttachedSensor {
    pub fn new(name: impl Into<String>, link: usize, relative: Pose) -> Self {
        AttachedSensor {
            name: name.into(),
            link,
            relative,
            device: None,
            structure_hash: String::new(),
        }
    }

    pub fn bind_device(&mut self, device: SensorDeviceRef) {
        self.device = Some(device);
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Latest measurement of the bound device; `None` without one.
    pub fn data(&self) -> Option<SensorReading> {
        self.device.as_ref().and_then(|device| device.borrow().data())
    }

    pub fn structure_fingerprint(&self) -> &str {
        &self.structure_hash
    }

    pub(crate) fn serialize(&self, out: &mut String) {
        out.push_str(&format!("sensor {} ", self.link));
        fmt_pose(out, &self.relative);
        if let Some(device) = &self.device {
            out.push_str(&device.borrow().structure_descriptor());
            out.push(' ');
        }
    }

    pub(crate) fn recompute_hash(&mut self) {
        let mut dump = String::new();
        self.serialize(&mut dump);
        self.structure_hash = digest(&dump);
    }
}

impl<M: RigidBodyModel> Robot<M> {
    /// Push link-mounted poses into every bound sensor device.
    pub(crate) fn update_attached_sensors(&mut self) {
        for sensor in &self.sensors {
            if let Some(device) = &sensor.device {
                let pose = self.model.link_transform(sensor.link) * sensor.relative;
                device.borrow_mut().set_transform(&pose);
            }
        }
    }

    /// Re-mount a sensor. Placement is structural state, so the affected
    /// fingerprints are recomputed.
    pub fn set_sensor_relative_transform(&mut self, handle: SensorHandle, relative: Pose) {
        self.sensors[handle.0].relative = relative;
        self.structure_changed(StructureChange::SENSOR_PLACEMENT);
    }

    /// Measurement of one sensor; `None` when no device is bound.
    pub fn sensor_data(&self, handle: SensorHandle) -> Option<SensorReading> {
        self.sensors[handle.0].data()
    }
}
