//! Motion compensation for head-mounted displays on moving platforms.
//!
//! A reference tracker fixed to the platform measures the platform motion;
//! that motion is removed from the poses of a compensated device before the
//! host runtime consumes them.

pub mod compensation;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod pose_math;
pub mod registry;
pub mod simulator;
pub mod smoothing;
pub mod status;
pub mod sync;
pub mod types;

pub use compensation::{CompensationParameters, MotionCompensationEngine, PoseOffset};
pub use driver::{CompensationDriver, PoseSource};
pub use error::{ClientError, CompensationError};
pub use status::DriverStatus;
pub use types::{CompensationMode, DeviceClass, DeviceInfo, DeviceRole, PoseSample, Quat, Vec3};
