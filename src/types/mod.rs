pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Tracking quality reported by the host alongside every pose
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingResult {
    Uninitialized,
    CalibratingInProgress,
    CalibratingOutOfRange,
    RunningOk,
    RunningOutOfRange,
}

impl TrackingResult {
    pub fn to_raw(self) -> u32 {
        match self {
            TrackingResult::Uninitialized => 1,
            TrackingResult::CalibratingInProgress => 100,
            TrackingResult::CalibratingOutOfRange => 101,
            TrackingResult::RunningOk => 200,
            TrackingResult::RunningOutOfRange => 201,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(TrackingResult::Uninitialized),
            100 => Some(TrackingResult::CalibratingInProgress),
            101 => Some(TrackingResult::CalibratingOutOfRange),
            200 => Some(TrackingResult::RunningOk),
            201 => Some(TrackingResult::RunningOutOfRange),
            _ => None,
        }
    }
}

/// Host device class. Numeric values follow the host runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Invalid,
    Hmd,
    Controller,
    GenericTracker,
    TrackingReference,
    DisplayRedirect,
}

impl DeviceClass {
    pub fn to_raw(self) -> u32 {
        match self {
            DeviceClass::Invalid => 0,
            DeviceClass::Hmd => 1,
            DeviceClass::Controller => 2,
            DeviceClass::GenericTracker => 3,
            DeviceClass::TrackingReference => 4,
            DeviceClass::DisplayRedirect => 5,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DeviceClass::Invalid),
            1 => Some(DeviceClass::Hmd),
            2 => Some(DeviceClass::Controller),
            3 => Some(DeviceClass::GenericTracker),
            4 => Some(DeviceClass::TrackingReference),
            5 => Some(DeviceClass::DisplayRedirect),
            _ => None,
        }
    }
}

/// Compensation role of a single device. Mutually exclusive per device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    #[default]
    Default,
    ReferenceTracker,
    MotionCompensated,
}

impl DeviceRole {
    pub fn to_raw(self) -> u32 {
        match self {
            DeviceRole::Default => 0,
            DeviceRole::ReferenceTracker => 1,
            DeviceRole::MotionCompensated => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DeviceRole::Default),
            1 => Some(DeviceRole::ReferenceTracker),
            2 => Some(DeviceRole::MotionCompensated),
            _ => None,
        }
    }
}

/// Engine-wide compensation mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationMode {
    #[default]
    Disabled,
    ReferenceTracker,
}

impl CompensationMode {
    pub fn to_raw(self) -> u32 {
        match self {
            CompensationMode::Disabled => 0,
            CompensationMode::ReferenceTracker => 1,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CompensationMode::Disabled),
            1 => Some(CompensationMode::ReferenceTracker),
            _ => None,
        }
    }
}

/// Device listing entry, also the payload of a device info reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub device_class: DeviceClass,
    pub role: DeviceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Transform between a device's driver frame and the world frame.
///
/// `world = rotation * driver + translation`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTransform {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl FrameTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Quat::identity(),
            translation: vec3_zero(),
        }
    }

    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }
}

impl Default for FrameTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// One pose delivery from the host runtime, expressed in the device's driver frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseSample {
    /// Host clock [seconds]
    pub timestamp: f64,

    /// Position [m]
    pub position: Vec3,
    pub rotation: Quat,

    /// Linear velocity [m/s] and acceleration [m/s²]
    pub velocity: Vec3,
    pub acceleration: Vec3,

    /// Angular velocity [rad/s] and acceleration [rad/s²]
    pub angular_velocity: Vec3,
    pub angular_acceleration: Vec3,

    pub pose_is_valid: bool,
    pub result: TrackingResult,
    pub device_connected: bool,

    /// World-from-driver transform in effect when the sample was produced
    pub world_from_driver: FrameTransform,
}

impl PoseSample {
    /// Valid, running sample at rest at the given pose
    pub fn new(timestamp: f64, position: Vec3, rotation: Quat) -> Self {
        Self {
            timestamp,
            position,
            rotation,
            velocity: vec3_zero(),
            acceleration: vec3_zero(),
            angular_velocity: vec3_zero(),
            angular_acceleration: vec3_zero(),
            pose_is_valid: true,
            result: TrackingResult::RunningOk,
            device_connected: true,
            world_from_driver: FrameTransform::identity(),
        }
    }

    pub fn with_frame(mut self, world_from_driver: FrameTransform) -> Self {
        self.world_from_driver = world_from_driver;
        self
    }

    pub fn with_velocity(mut self, velocity: Vec3, angular_velocity: Vec3) -> Self {
        self.velocity = velocity;
        self.angular_velocity = angular_velocity;
        self
    }

    pub fn with_acceleration(mut self, acceleration: Vec3, angular_acceleration: Vec3) -> Self {
        self.acceleration = acceleration;
        self.angular_acceleration = angular_acceleration;
        self
    }

    /// Validity and tracking quality both good
    pub fn is_trackable(&self) -> bool {
        self.pose_is_valid && self.result == TrackingResult::RunningOk
    }
}
