//! Driver context: owns the engine and the device registry, receives host
//! notifications and serves control requests.

use crate::compensation::{CompensationParameters, MotionCompensationEngine};
use crate::error::{CResult, CompensationError};
use crate::ipc::server::ControlHandler;
use crate::registry::{DeviceKey, DeviceRegistry};
use crate::status::DriverStatus;
use crate::types::{
    CompensationMode, DeviceClass, DeviceInfo, DeviceRole, PoseSample, MAX_TRACKED_DEVICES,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

/// Producer of pose deliveries, standing in for the host runtime's callbacks
pub trait PoseSource {
    /// Host interface version the poses arrive through
    fn interface_version(&self) -> u32;

    /// Poses produced for host time `timestamp` [s]
    fn next_poses(&mut self, timestamp: f64) -> Vec<(u32, PoseSample)>;
}

pub struct CompensationDriver {
    engine: MotionCompensationEngine,
    registry: DeviceRegistry,
    /// Serializes mode changes so validation and role assignment are atomic
    mode_lock: Mutex<()>,
}

impl CompensationDriver {
    pub fn new(params: CompensationParameters) -> Self {
        Self {
            engine: MotionCompensationEngine::new(params),
            registry: DeviceRegistry::new(),
            mode_lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &MotionCompensationEngine {
        &self.engine
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    // ===== Host notifications =====

    pub fn device_added(&self, device_id: u32, serial: &str, device_class: DeviceClass) -> CResult<DeviceKey> {
        self.registry
            .attach(device_id, serial, device_class)
            .map(|(key, _)| key)
    }

    pub fn device_removed(&self, device_id: u32) -> CResult<()> {
        let handle = self.registry.detach(device_id)?;
        match handle.role() {
            DeviceRole::ReferenceTracker => self.engine.reference_lost(),
            DeviceRole::MotionCompensated => {
                log::warn!("Motion compensated device {} detached", device_id)
            }
            DeviceRole::Default => {}
        }
        Ok(())
    }

    /// Pose delivery from the host. Returns true when the engine consumed or changed the sample.
    ///
    /// A panic inside the engine leaves the sample untouched.
    pub fn pose_updated(&self, interface_version: u32, device_id: u32, sample: &mut PoseSample) -> bool {
        let Some(handle) = self.registry.get(device_id) else {
            return false;
        };
        if !handle.accepts_interface(interface_version) {
            log::trace!(
                "Device {}: ignoring pose from interface {} (latched {:?})",
                device_id,
                interface_version,
                handle.interface_version()
            );
            return false;
        }

        let input = *sample;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut output = input;
            let handled = handle.handle_pose_update(&mut output, &self.engine);
            (output, handled)
        }));
        match result {
            Ok((output, handled)) => {
                *sample = output;
                handled
            }
            Err(_) => {
                log::error!("Pose update for device {} failed, passing through", device_id);
                false
            }
        }
    }

    /// Deliver one batch from a pose source; returns the samples as the consumer sees them
    pub fn pump(&self, source: &mut dyn PoseSource, timestamp: f64) -> Vec<(u32, PoseSample)> {
        let version = source.interface_version();
        source
            .next_poses(timestamp)
            .into_iter()
            .map(|(device_id, mut sample)| {
                self.pose_updated(version, device_id, &mut sample);
                (device_id, sample)
            })
            .collect()
    }

    // ===== Control =====

    /// Apply a compensation mode, all or nothing.
    ///
    /// `Disabled` resets every device role and ignores the ids.
    pub fn set_compensation_mode(&self, target_id: u32, reference_id: u32, mode: CompensationMode) -> CResult<()> {
        let _guard = self
            .mode_lock
            .lock()
            .map_err(|_| CompensationError::Internal("Failed to acquire mode lock".to_string()))?;

        if mode == CompensationMode::Disabled {
            for handle in self.registry.devices() {
                if handle.role() != DeviceRole::Default {
                    handle.set_role(DeviceRole::Default, &self.engine)?;
                }
            }
            self.engine.disable();
            return Ok(());
        }

        // validate everything before touching any state
        for id in [target_id, reference_id] {
            if id >= MAX_TRACKED_DEVICES {
                return Err(CompensationError::InvalidDeviceId(id));
            }
        }
        if target_id == reference_id {
            return Err(CompensationError::SameDevice(target_id));
        }
        let target = self
            .registry
            .get(target_id)
            .ok_or(CompensationError::DeviceNotFound(target_id))?;
        let reference = self
            .registry
            .get(reference_id)
            .ok_or(CompensationError::DeviceNotFound(reference_id))?;
        match reference.device_class() {
            DeviceClass::Hmd => return Err(CompensationError::HmdAsReference(reference_id)),
            DeviceClass::Invalid => return Err(CompensationError::InvalidReferenceClass(reference_id)),
            _ => {}
        }

        let active = self.engine.is_enabled() && self.engine.mode() == mode;
        let previous_target = self.engine.target_id();
        let previous_reference = self.engine.reference_id();

        for handle in self.registry.devices() {
            let id = handle.device_id();
            if id != target_id && id != reference_id && handle.role() != DeviceRole::Default {
                handle.set_role(DeviceRole::Default, &self.engine)?;
            }
        }
        target.set_role(DeviceRole::MotionCompensated, &self.engine)?;
        reference.set_role(DeviceRole::ReferenceTracker, &self.engine)?;

        if active {
            if previous_target != Some(target_id) {
                self.engine.set_new_target(target_id);
            }
            if previous_reference != Some(reference_id) {
                self.engine.set_new_reference_tracker(reference_id);
            }
        } else {
            self.engine.arm(mode, reference_id, target_id);
        }
        Ok(())
    }

    pub fn set_parameters(&self, params: CompensationParameters) -> CResult<CompensationParameters> {
        self.engine.set_parameters(params)
    }

    pub fn reset_zero_pose(&self) {
        self.engine.reset_zero_pose();
    }

    pub fn device_info(&self, device_id: u32) -> CResult<DeviceInfo> {
        if device_id >= MAX_TRACKED_DEVICES {
            return Err(CompensationError::InvalidDeviceId(device_id));
        }
        self.registry
            .get(device_id)
            .map(|handle| handle.info())
            .ok_or(CompensationError::DeviceNotFound(device_id))
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.devices().iter().map(|h| h.info()).collect()
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus::new(self.engine.snapshot(), self.devices())
    }
}

impl Default for CompensationDriver {
    fn default() -> Self {
        Self::new(CompensationParameters::default())
    }
}

impl ControlHandler for CompensationDriver {
    fn device_info(&self, device_id: u32) -> CResult<DeviceInfo> {
        CompensationDriver::device_info(self, device_id)
    }

    fn set_compensation_mode(&self, target_id: u32, reference_id: u32, mode: CompensationMode) -> CResult<()> {
        CompensationDriver::set_compensation_mode(self, target_id, reference_id, mode)
    }

    fn set_compensation_parameters(&self, params: CompensationParameters) -> CResult<CompensationParameters> {
        self.set_parameters(params)
    }

    fn reset_zero_pose(&self) -> CResult<()> {
        CompensationDriver::reset_zero_pose(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::WARMUP_SAMPLES;
    use crate::types::{Quat, Vec3};
    use approx::assert_relative_eq;

    const HMD: u32 = 0;
    const TRACKER: u32 = 1;
    const CONTROLLER: u32 = 2;
    const VERSION: u32 = 6;

    fn driver() -> CompensationDriver {
        let driver = CompensationDriver::new(CompensationParameters {
            lpf_beta: 1.0,
            samples: 1,
            ..CompensationParameters::default()
        });
        driver.device_added(HMD, "HMD-0", DeviceClass::Hmd).unwrap();
        driver.device_added(TRACKER, "LHR-T1", DeviceClass::GenericTracker).unwrap();
        driver.device_added(CONTROLLER, "LHR-C1", DeviceClass::Controller).unwrap();
        driver
    }

    fn pose(tick: u32, position: Vec3) -> PoseSample {
        PoseSample::new(tick as f64 * 0.004, position, Quat::identity())
    }

    fn roles(driver: &CompensationDriver) -> Vec<DeviceRole> {
        driver.devices().iter().map(|d| d.role).collect()
    }

    fn assert_role_invariants(driver: &CompensationDriver) {
        let references: Vec<_> = driver
            .devices()
            .into_iter()
            .filter(|d| d.role == DeviceRole::ReferenceTracker)
            .collect();
        assert!(references.len() <= 1);
        assert!(references.iter().all(|d| d.device_class != DeviceClass::Hmd));
    }

    #[test]
    fn test_same_device_rejected_without_change() {
        let driver = driver();
        let before = roles(&driver);
        assert_eq!(
            driver.set_compensation_mode(TRACKER, TRACKER, CompensationMode::ReferenceTracker),
            Err(CompensationError::SameDevice(TRACKER))
        );
        assert_eq!(roles(&driver), before);
        assert!(!driver.engine().is_enabled());
    }

    #[test]
    fn test_validation_errors() {
        let driver = driver();
        assert_eq!(
            driver.set_compensation_mode(HMD, 64, CompensationMode::ReferenceTracker),
            Err(CompensationError::InvalidDeviceId(64))
        );
        assert_eq!(
            driver.set_compensation_mode(HMD, 9, CompensationMode::ReferenceTracker),
            Err(CompensationError::DeviceNotFound(9))
        );
        assert_eq!(
            driver.set_compensation_mode(TRACKER, HMD, CompensationMode::ReferenceTracker),
            Err(CompensationError::HmdAsReference(HMD))
        );
        driver.device_added(5, "bogus", DeviceClass::Invalid).unwrap();
        assert_eq!(
            driver.set_compensation_mode(HMD, 5, CompensationMode::ReferenceTracker),
            Err(CompensationError::InvalidReferenceClass(5))
        );
        assert!(roles(&driver).iter().all(|r| *r == DeviceRole::Default));
    }

    #[test]
    fn test_arm_assigns_roles() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        assert_eq!(
            roles(&driver),
            vec![
                DeviceRole::MotionCompensated,
                DeviceRole::ReferenceTracker,
                DeviceRole::Default
            ]
        );
        assert!(driver.engine().is_enabled());
        assert_eq!(driver.engine().reference_id(), Some(TRACKER));
        assert_role_invariants(&driver);
    }

    #[test]
    fn test_reference_swap_keeps_single_reference() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        driver
            .set_compensation_mode(HMD, CONTROLLER, CompensationMode::ReferenceTracker)
            .unwrap();
        assert_eq!(
            roles(&driver),
            vec![
                DeviceRole::MotionCompensated,
                DeviceRole::Default,
                DeviceRole::ReferenceTracker
            ]
        );
        assert_eq!(driver.engine().reference_id(), Some(CONTROLLER));
        assert_role_invariants(&driver);

        // swap target and reference between the two trackers
        driver
            .set_compensation_mode(CONTROLLER, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        assert_eq!(
            roles(&driver),
            vec![
                DeviceRole::Default,
                DeviceRole::ReferenceTracker,
                DeviceRole::MotionCompensated
            ]
        );
        assert_eq!(driver.engine().target_id(), Some(CONTROLLER));
        assert_role_invariants(&driver);
    }

    #[test]
    fn test_disable_resets_roles() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        driver
            .set_compensation_mode(999, 999, CompensationMode::Disabled)
            .unwrap();
        assert!(roles(&driver).iter().all(|r| *r == DeviceRole::Default));
        assert!(!driver.engine().is_enabled());
    }

    #[test]
    fn test_end_to_end_compensation() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();

        for tick in 0..WARMUP_SAMPLES {
            let mut sample = pose(tick, Vec3::zeros());
            assert!(driver.pose_updated(VERSION, TRACKER, &mut sample));
        }
        let mut moved = pose(WARMUP_SAMPLES, Vec3::new(0.0, 0.1, 0.0));
        driver.pose_updated(VERSION, TRACKER, &mut moved);

        let raw = Vec3::new(0.0, 1.7, 0.0);
        let mut hmd = pose(WARMUP_SAMPLES, raw);
        assert!(driver.pose_updated(VERSION, HMD, &mut hmd));
        assert_relative_eq!(hmd.position - raw, Vec3::new(0.0, -0.1, 0.0), epsilon = 1e-9);

        // controllers keep their raw pose
        let raw_controller = pose(WARMUP_SAMPLES, Vec3::new(0.3, 1.0, 0.2));
        let mut controller = raw_controller;
        assert!(!driver.pose_updated(VERSION, CONTROLLER, &mut controller));
        assert_eq!(controller, raw_controller);
    }

    #[test]
    fn test_other_interface_version_ignored() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        let mut sample = pose(0, Vec3::zeros());
        assert!(driver.pose_updated(VERSION, TRACKER, &mut sample));
        assert!(!driver.pose_updated(VERSION - 1, TRACKER, &mut sample));
    }

    #[test]
    fn test_reference_detach_invalidates_engine() {
        let driver = driver();
        driver
            .set_compensation_mode(HMD, TRACKER, CompensationMode::ReferenceTracker)
            .unwrap();
        let mut sample = pose(0, Vec3::zeros());
        driver.pose_updated(VERSION, TRACKER, &mut sample);
        assert!(driver.engine().is_zero_pose_valid());

        driver.device_removed(TRACKER).unwrap();
        assert!(!driver.engine().is_zero_pose_valid());
        assert!(!driver.pose_updated(VERSION, TRACKER, &mut sample));
        assert_eq!(driver.device_info(TRACKER), Err(CompensationError::DeviceNotFound(TRACKER)));
    }

    #[test]
    fn test_device_info_and_status() {
        let driver = driver();
        assert_eq!(driver.device_info(64), Err(CompensationError::InvalidDeviceId(64)));
        let info = driver.device_info(HMD).unwrap();
        assert_eq!(info.device_class, DeviceClass::Hmd);
        assert_eq!(info.serial.as_deref(), Some("HMD-0"));

        let status = driver.status();
        assert_eq!(status.devices.len(), 3);
        assert_eq!(status.mode, CompensationMode::Disabled);
    }

    struct StaticSource;

    impl PoseSource for StaticSource {
        fn interface_version(&self) -> u32 {
            VERSION
        }

        fn next_poses(&mut self, timestamp: f64) -> Vec<(u32, PoseSample)> {
            vec![
                (TRACKER, PoseSample::new(timestamp, Vec3::zeros(), Quat::identity())),
                (HMD, PoseSample::new(timestamp, Vec3::new(0.0, 1.6, 0.0), Quat::identity())),
            ]
        }
    }

    #[test]
    fn test_pump_delivers_batches() {
        let driver = driver();
        let mut source = StaticSource;
        let delivered = driver.pump(&mut source, 0.0);
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].1.position, Vec3::new(0.0, 1.6, 0.0));
    }
}
