//! Simulated motion platform feeding the driver with HMD, tracker and
//! controller poses.
//!
//! The reference tracker is bolted to the platform and the HMD rides on it,
//! so both share the platform motion. The head also sways on its own; that
//! component should survive compensation.

use crate::driver::PoseSource;
use crate::pose_math::from_euler_degrees;
use crate::types::{DeviceClass, PoseSample, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

pub const SIM_HMD_ID: u32 = 0;
pub const SIM_TRACKER_ID: u32 = 1;
pub const SIM_CONTROLLER_ID: u32 = 2;
pub const SIM_INTERFACE_VERSION: u32 = 6;

/// Sinusoidal platform excursion
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PlatformMotion {
    /// Peak displacement per axis [m]
    pub amplitude: [f64; 3],
    /// Peak roll/pitch/yaw [deg]
    pub rotation_amplitude: [f64; 3],
    pub frequency_hz: f64,
}

impl Default for PlatformMotion {
    fn default() -> Self {
        Self {
            amplitude: [0.02, 0.05, 0.03],
            rotation_amplitude: [4.0, 3.0, 0.0],
            frequency_hz: 0.5,
        }
    }
}

impl PlatformMotion {
    /// Platform pose at time `t` relative to its rest pose
    pub fn pose_at(&self, t: f64) -> (Vec3, Quat) {
        let phase = TAU * self.frequency_hz * t;
        let (s, c) = phase.sin_cos();
        // pitch and z run a quarter period ahead of the rest
        let position = Vec3::new(self.amplitude[0] * s, self.amplitude[1] * s, self.amplitude[2] * c);
        let rotation = from_euler_degrees(&Vec3::new(
            self.rotation_amplitude[0] * s,
            self.rotation_amplitude[1] * c,
            self.rotation_amplitude[2] * s,
        ));
        (position, rotation)
    }
}

#[derive(Clone, Debug)]
pub struct MotionPlatformSimulator {
    motion: PlatformMotion,
    /// Tracker mount point in platform coordinates
    tracker_mount: Vec3,
    /// Seated head position in platform coordinates
    head_rest: Vec3,
    /// Head yaw sway [deg] and its frequency
    head_sway_deg: f64,
    head_sway_hz: f64,
    start: Option<f64>,
}

impl MotionPlatformSimulator {
    pub fn new(motion: PlatformMotion) -> Self {
        Self {
            motion,
            tracker_mount: Vec3::new(0.0, 0.8, -0.4),
            head_rest: Vec3::new(0.0, 1.2, 0.0),
            head_sway_deg: 10.0,
            head_sway_hz: 0.2,
            start: None,
        }
    }

    /// Devices the simulator produces poses for
    pub fn devices() -> [(u32, &'static str, DeviceClass); 3] {
        [
            (SIM_HMD_ID, "SIM-HMD-0", DeviceClass::Hmd),
            (SIM_TRACKER_ID, "SIM-TRK-1", DeviceClass::GenericTracker),
            (SIM_CONTROLLER_ID, "SIM-CTL-2", DeviceClass::Controller),
        ]
    }

    fn elapsed(&mut self, timestamp: f64) -> f64 {
        let start = *self.start.get_or_insert(timestamp);
        timestamp - start
    }

    fn head_local(&self, t: f64) -> Quat {
        let yaw = self.head_sway_deg * (TAU * self.head_sway_hz * t).sin();
        from_euler_degrees(&Vec3::new(0.0, 0.0, yaw))
    }

    /// HMD pose with the platform frozen where it was at the first sample.
    ///
    /// A compensated HMD whose zero pose was captured on the first batch
    /// reports this pose. Before any sample, time counts from zero.
    pub fn expected_hmd(&self, timestamp: f64) -> (Vec3, Quat) {
        let t = timestamp - self.start.unwrap_or(0.0);
        let (platform_position, platform_rotation) = self.motion.pose_at(0.0);
        (
            platform_position + platform_rotation * self.head_rest,
            platform_rotation * self.head_local(t),
        )
    }

    pub fn sample(&mut self, timestamp: f64) -> Vec<(u32, PoseSample)> {
        let t = self.elapsed(timestamp);
        let (platform_position, platform_rotation) = self.motion.pose_at(t);

        let tracker_position = platform_position + platform_rotation * self.tracker_mount;
        let hmd_position = platform_position + platform_rotation * self.head_rest;
        let hmd_rotation = platform_rotation * self.head_local(t);

        let controller_position = Vec3::new(0.3, 1.0, -0.3);

        vec![
            (
                SIM_TRACKER_ID,
                PoseSample::new(timestamp, tracker_position, platform_rotation),
            ),
            (
                SIM_HMD_ID,
                PoseSample::new(timestamp, hmd_position, hmd_rotation),
            ),
            (
                SIM_CONTROLLER_ID,
                PoseSample::new(timestamp, controller_position, Quat::identity()),
            ),
        ]
    }
}

impl Default for MotionPlatformSimulator {
    fn default() -> Self {
        Self::new(PlatformMotion::default())
    }
}

impl PoseSource for MotionPlatformSimulator {
    fn interface_version(&self) -> u32 {
        SIM_INTERFACE_VERSION
    }

    fn next_poses(&mut self, timestamp: f64) -> Vec<(u32, PoseSample)> {
        self.sample(timestamp)
    }
}

/// Produce pose batches at `rate_hz` until the receiver goes away
pub async fn pose_loop(tx: Sender<Vec<(u32, PoseSample)>>, mut simulator: MotionPlatformSimulator, rate_hz: f64) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(1.0));
    let mut interval = interval(period);
    let mut tick = 0u64;
    let mut dropped = 0u64;

    loop {
        interval.tick().await;
        let timestamp = tick as f64 * period.as_secs_f64();
        tick += 1;

        match tx.try_send(simulator.sample(timestamp)) {
            Ok(_) => {}
            Err(TrySendError::Closed(_)) => {
                log::debug!("Pose channel closed after {} batches", tick);
                break;
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 100 == 1 {
                    log::warn!("Pose channel full, {} batches dropped", dropped);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn position_of(batch: &[(u32, PoseSample)], id: u32) -> Vec3 {
        batch.iter().find(|(d, _)| *d == id).unwrap().1.position
    }

    #[test]
    fn test_time_starts_at_first_sample() {
        let mut late = MotionPlatformSimulator::default();
        let mut fresh = MotionPlatformSimulator::default();
        let a = late.sample(10.0);
        let b = fresh.sample(0.0);
        assert_eq!(a.len(), 3);
        assert_relative_eq!(position_of(&a, SIM_HMD_ID), position_of(&b, SIM_HMD_ID), epsilon = 1e-12);
    }

    #[test]
    fn test_hmd_and_tracker_move_rigidly() {
        let mut sim = MotionPlatformSimulator::default();
        let first = sim.sample(0.0);
        let later = sim.sample(0.37);
        let d0 = position_of(&first, SIM_HMD_ID) - position_of(&first, SIM_TRACKER_ID);
        let d1 = position_of(&later, SIM_HMD_ID) - position_of(&later, SIM_TRACKER_ID);
        assert_relative_eq!(d0.norm(), d1.norm(), epsilon = 1e-12);
    }

    #[test]
    fn test_controller_static() {
        let mut sim = MotionPlatformSimulator::default();
        let a = position_of(&sim.sample(0.0), SIM_CONTROLLER_ID);
        let b = position_of(&sim.sample(1.3), SIM_CONTROLLER_ID);
        assert_eq!(a, b);
    }

    #[test]
    fn test_compensation_removes_platform_motion() {
        use crate::compensation::{CompensationParameters, WARMUP_SAMPLES};
        use crate::driver::CompensationDriver;
        use crate::types::CompensationMode;

        let driver = CompensationDriver::new(CompensationParameters {
            lpf_beta: 1.0,
            samples: 1,
            ..CompensationParameters::default()
        });
        for (id, serial, class) in MotionPlatformSimulator::devices() {
            driver.device_added(id, serial, class).unwrap();
        }
        driver
            .set_compensation_mode(SIM_HMD_ID, SIM_TRACKER_ID, CompensationMode::ReferenceTracker)
            .unwrap();

        let mut sim = MotionPlatformSimulator::default();
        let dt = 0.004;
        for tick in 0..=WARMUP_SAMPLES + 200 {
            let timestamp = tick as f64 * dt;
            let batch = driver.pump(&mut sim, timestamp);
            if tick > WARMUP_SAMPLES {
                let hmd = batch.iter().find(|(id, _)| *id == SIM_HMD_ID).unwrap().1;
                let (position, rotation) = sim.expected_hmd(timestamp);
                assert_relative_eq!(hmd.position, position, epsilon = 1e-9);
                assert!(hmd.rotation.angle_to(&rotation) < 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn test_pose_loop_stops_when_receiver_dropped() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let handle = tokio::spawn(pose_loop(tx, MotionPlatformSimulator::default(), 500.0));
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
