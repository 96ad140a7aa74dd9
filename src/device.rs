use crate::compensation::MotionCompensationEngine;
use crate::error::{CResult, CompensationError};
use crate::types::{DeviceClass, DeviceInfo, DeviceRole, PoseSample};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

/// Per-device role state machine
///
/// Roles change only through [`DeviceHandle::set_role`]; incoming poses are
/// dispatched to the engine according to the current role.
#[derive(Debug)]
pub struct DeviceHandle {
    device_id: u32,
    serial: String,
    device_class: DeviceClass,
    role: AtomicU32,
    valid: AtomicBool,
    /// Host interface version that delivers poses for this device, latched on first use
    interface_version: OnceLock<u32>,
}

impl DeviceHandle {
    pub fn new(device_id: u32, serial: impl Into<String>, device_class: DeviceClass) -> Self {
        Self {
            device_id,
            serial: serial.into(),
            device_class,
            role: AtomicU32::new(DeviceRole::Default.to_raw()),
            valid: AtomicBool::new(true),
            interface_version: OnceLock::new(),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    pub fn role(&self) -> DeviceRole {
        DeviceRole::from_raw(self.role.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// False once the device detached
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id,
            device_class: self.device_class,
            role: self.role(),
            serial: Some(self.serial.clone()),
        }
    }

    /// Latch the first interface version seen; later calls report whether
    /// `version` is the latched one.
    pub fn accepts_interface(&self, version: u32) -> bool {
        *self.interface_version.get_or_init(|| version) == version
    }

    pub fn interface_version(&self) -> Option<u32> {
        self.interface_version.get().copied()
    }

    /// Switch role, returning the previous one.
    ///
    /// Entering `ReferenceTracker` invalidates the engine's zero pose and
    /// reference state. HMDs never become reference trackers.
    pub fn set_role(&self, role: DeviceRole, engine: &MotionCompensationEngine) -> CResult<DeviceRole> {
        if !self.is_valid() {
            return Err(CompensationError::StaleHandle);
        }
        if role == DeviceRole::ReferenceTracker && self.device_class == DeviceClass::Hmd {
            return Err(CompensationError::HmdAsReference(self.device_id));
        }

        let previous = DeviceRole::from_raw(self.role.swap(role.to_raw(), Ordering::AcqRel))
            .unwrap_or_default();
        if role == DeviceRole::ReferenceTracker && previous != DeviceRole::ReferenceTracker {
            engine.invalidate_reference();
        }
        if previous != role {
            log::info!(
                "Device {} ({}): {:?} -> {:?}",
                self.device_id,
                self.serial,
                previous,
                role
            );
        }
        Ok(previous)
    }

    /// Dispatch one pose by role; returns true when the engine consumed or changed it
    pub fn handle_pose_update(&self, sample: &mut PoseSample, engine: &MotionCompensationEngine) -> bool {
        if !self.is_valid() || !sample.is_trackable() {
            return false;
        }

        match self.role() {
            DeviceRole::ReferenceTracker => {
                if engine.is_zero_pose_valid() {
                    engine.update_reference(sample);
                } else if let Err(e) = engine.set_zero_pose(sample) {
                    // another thread captured it first
                    log::trace!("Device {}: {}", self.device_id, e);
                    engine.update_reference(sample);
                }
                true
            }
            DeviceRole::MotionCompensated => {
                *sample = engine.compensate(sample);
                true
            }
            DeviceRole::Default => false,
        }
    }
}
