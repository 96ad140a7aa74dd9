//! Motion compensation engine
//!
//! Captures the reference tracker's zero pose, filters the reference stream
//! into a smoothed world-space pose plus motion derivatives, and applies the
//! inverse of the reference drift to motion-compensated devices.
//!
//! Four narrow locks are used so the pose callbacks of the reference tracker
//! and the compensated device never wait on each other for long:
//! settings, zero pose, filtered reference, reference motion.

use crate::error::{CResult, CompensationError};
use crate::pose_math::{driver_direction, from_euler_degrees, pose_from_world, pose_to_world};
use crate::smoothing::{
    clamp_beta, AngularRateEstimator, DemaVector3, FiniteDifference, QuaternionLowPass,
    VectorLowPass,
};
use crate::sync::SpinLock;
use crate::types::{vec3_from_array, vec3_to_array, CompensationMode, PoseSample, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reference updates required after (re-)arming before compensation is applied
pub const WARMUP_SAMPLES: u32 = 100;

pub const DEFAULT_LPF_BETA: f64 = 0.2;
pub const DEFAULT_SAMPLES: u32 = 100;

/// Offset applied to the compensated world pose
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseOffset {
    /// Added to the compensated position [m]
    pub translation: [f64; 3],
    /// Roll, pitch, yaw [deg], post-multiplied onto the compensated rotation
    pub rotation: [f64; 3],
}

impl PoseOffset {
    pub fn translation_vec(&self) -> Vec3 {
        vec3_from_array(self.translation)
    }

    pub fn rotation_quat(&self) -> Quat {
        from_euler_degrees(&vec3_from_array(self.rotation))
    }

    pub fn is_zero(&self) -> bool {
        self.translation == [0.0; 3] && self.rotation == [0.0; 3]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationParameters {
    /// Rotation and motion low-pass coefficient, clamped to [0, 1]
    pub lpf_beta: f64,
    /// Effective DEMA window for position; below 2 positions pass through raw
    pub samples: u32,
    /// Zero velocity and acceleration of compensated devices instead of subtracting
    pub zero_velocity: bool,
    pub offset: PoseOffset,
}

impl Default for CompensationParameters {
    fn default() -> Self {
        Self {
            lpf_beta: DEFAULT_LPF_BETA,
            samples: DEFAULT_SAMPLES,
            zero_velocity: false,
            offset: PoseOffset::default(),
        }
    }
}

impl CompensationParameters {
    /// Reject non-finite values and clamp `lpf_beta`
    pub fn validated(mut self) -> CResult<Self> {
        if !self.lpf_beta.is_finite() {
            return Err(CompensationError::InvalidParameters(format!(
                "lpf_beta must be finite, got {}",
                self.lpf_beta
            )));
        }
        let mut offsets = self.offset.translation.iter().chain(self.offset.rotation.iter());
        if offsets.any(|v| !v.is_finite()) {
            return Err(CompensationError::InvalidParameters(
                "offset must be finite".to_string(),
            ));
        }
        self.lpf_beta = clamp_beta(self.lpf_beta);
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug)]
struct EngineSettings {
    enabled: bool,
    mode: CompensationMode,
    reference_id: Option<u32>,
    target_id: Option<u32>,
    params: CompensationParameters,
}

#[derive(Clone, Copy, Debug)]
struct ZeroPose {
    valid: bool,
    position: Vec3,
    rotation: Quat,
}

impl Default for ZeroPose {
    fn default() -> Self {
        Self {
            valid: false,
            position: Vec3::zeros(),
            rotation: Quat::identity(),
        }
    }
}

/// Filter state fed by the reference tracker
#[derive(Debug)]
struct ReferenceState {
    valid: bool,
    warmup: u32,

    position_filter: DemaVector3,
    rotation_filter: QuaternionLowPass,
    velocity_diff: FiniteDifference,
    acceleration_diff: FiniteDifference,
    angular_rate: AngularRateEstimator,
    angular_acceleration_diff: FiniteDifference,
    velocity_lpf: VectorLowPass,
    acceleration_lpf: VectorLowPass,
    angular_velocity_lpf: VectorLowPass,
    angular_acceleration_lpf: VectorLowPass,

    /// Filtered world pose
    position: Vec3,
    rotation: Quat,
}

impl ReferenceState {
    fn new(params: &CompensationParameters) -> Self {
        Self {
            valid: false,
            warmup: 0,
            position_filter: DemaVector3::new(params.samples),
            rotation_filter: QuaternionLowPass::new(params.lpf_beta),
            velocity_diff: FiniteDifference::new(),
            acceleration_diff: FiniteDifference::new(),
            angular_rate: AngularRateEstimator::new(),
            angular_acceleration_diff: FiniteDifference::new(),
            velocity_lpf: VectorLowPass::new(params.lpf_beta),
            acceleration_lpf: VectorLowPass::new(params.lpf_beta),
            angular_velocity_lpf: VectorLowPass::new(params.lpf_beta),
            angular_acceleration_lpf: VectorLowPass::new(params.lpf_beta),
            position: Vec3::zeros(),
            rotation: Quat::identity(),
        }
    }

    fn apply_params(&mut self, params: &CompensationParameters) {
        self.position_filter.set_samples(params.samples);
        self.rotation_filter.set_beta(params.lpf_beta);
        for lpf in [
            &mut self.velocity_lpf,
            &mut self.acceleration_lpf,
            &mut self.angular_velocity_lpf,
            &mut self.angular_acceleration_lpf,
        ] {
            lpf.set_beta(params.lpf_beta);
        }
    }

    /// Drop validity, warm-up progress and filter history
    fn invalidate(&mut self) {
        self.valid = false;
        self.warmup = 0;
        self.position_filter.reset();
        self.rotation_filter.reset();
        self.velocity_diff.reset();
        self.acceleration_diff.reset();
        self.angular_rate.reset();
        self.angular_acceleration_diff.reset();
        self.velocity_lpf.reset();
        self.acceleration_lpf.reset();
        self.angular_velocity_lpf.reset();
        self.angular_acceleration_lpf.reset();
    }

    /// Advance every filter with one world-space sample
    fn filter(&mut self, timestamp: f64, position: &Vec3, rotation: &Quat) -> ReferenceMotion {
        self.position = self.position_filter.apply(position);
        self.rotation = self.rotation_filter.apply(rotation);

        let velocity = self.velocity_diff.update(timestamp, &self.position);
        let acceleration = self.acceleration_diff.update(timestamp, &velocity);
        let angular_velocity = self.angular_rate.update(timestamp, &self.rotation);
        let angular_acceleration = self
            .angular_acceleration_diff
            .update(timestamp, &angular_velocity);

        ReferenceMotion {
            velocity: self.velocity_lpf.apply(&velocity),
            acceleration: self.acceleration_lpf.apply(&acceleration),
            angular_velocity: self.angular_velocity_lpf.apply(&angular_velocity),
            angular_acceleration: self.angular_acceleration_lpf.apply(&angular_acceleration),
        }
    }
}

/// Smoothed world-space motion of the reference tracker
#[derive(Clone, Copy, Debug, Default)]
struct ReferenceMotion {
    velocity: Vec3,
    acceleration: Vec3,
    angular_velocity: Vec3,
    angular_acceleration: Vec3,
}

/// Point-in-time view of the engine for status reporting
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub enabled: bool,
    pub mode: CompensationMode,
    pub reference_id: Option<u32>,
    pub target_id: Option<u32>,
    pub parameters: CompensationParameters,
    pub zero_pose_valid: bool,
    pub zero_position: [f64; 3],
    pub reference_valid: bool,
    pub warmup_samples: u32,
    pub reference_position: [f64; 3],
    pub reference_velocity: [f64; 3],
    pub reference_samples: u64,
    pub compensated_samples: u64,
}

pub struct MotionCompensationEngine {
    settings: SpinLock<EngineSettings>,
    zero: SpinLock<ZeroPose>,
    reference: SpinLock<ReferenceState>,
    motion: SpinLock<ReferenceMotion>,
    reference_samples: AtomicU64,
    compensated_samples: AtomicU64,
}

impl MotionCompensationEngine {
    pub fn new(params: CompensationParameters) -> Self {
        let params = params.validated().unwrap_or_else(|e| {
            log::warn!("{}, using default compensation parameters", e);
            CompensationParameters::default()
        });
        Self {
            settings: SpinLock::new(EngineSettings {
                enabled: false,
                mode: CompensationMode::Disabled,
                reference_id: None,
                target_id: None,
                params,
            }),
            zero: SpinLock::new(ZeroPose::default()),
            reference: SpinLock::new(ReferenceState::new(&params)),
            motion: SpinLock::new(ReferenceMotion::default()),
            reference_samples: AtomicU64::new(0),
            compensated_samples: AtomicU64::new(0),
        }
    }

    // ===== Mode =====

    /// Enable compensation for a reference/target pairing.
    ///
    /// Resets the zero pose and the warm-up counter. Calling again with the
    /// same ids while enabled changes nothing. `Disabled` disables.
    pub fn arm(&self, mode: CompensationMode, reference_id: u32, target_id: u32) {
        if mode == CompensationMode::Disabled {
            self.disable();
            return;
        }

        {
            let mut settings = self.settings.lock();
            if settings.enabled
                && settings.mode == mode
                && settings.reference_id == Some(reference_id)
                && settings.target_id == Some(target_id)
            {
                return;
            }
            settings.enabled = true;
            settings.mode = mode;
            settings.reference_id = Some(reference_id);
            settings.target_id = Some(target_id);
        }
        self.invalidate_reference();
        log::info!(
            "Motion compensation armed: reference {} target {}",
            reference_id,
            target_id
        );
    }

    pub fn disable(&self) {
        {
            let mut settings = self.settings.lock();
            settings.enabled = false;
            settings.mode = CompensationMode::Disabled;
            settings.reference_id = None;
            settings.target_id = None;
        }
        self.invalidate_reference();
        log::info!("Motion compensation disabled");
    }

    /// Swap the reference tracker of an active pairing; forces re-acquisition
    pub fn set_new_reference_tracker(&self, reference_id: u32) {
        self.settings.lock().reference_id = Some(reference_id);
        self.invalidate_reference();
        log::info!("New reference tracker {}", reference_id);
    }

    /// Swap the compensated device of an active pairing
    pub fn set_new_target(&self, target_id: u32) {
        self.settings.lock().target_id = Some(target_id);
        log::info!("New motion compensated device {}", target_id);
    }

    /// The reference tracker detached
    pub fn reference_lost(&self) {
        self.invalidate_reference();
        log::warn!("Reference tracker lost, waiting for a new zero pose");
    }

    /// Invalidate zero pose, reference validity and filter history
    pub fn invalidate_reference(&self) {
        self.zero.lock().valid = false;
        self.reference.lock().invalidate();
        *self.motion.lock() = ReferenceMotion::default();
    }

    // ===== Parameters =====

    /// Replace the compensation parameters; returns the values in effect
    pub fn set_parameters(&self, params: CompensationParameters) -> CResult<CompensationParameters> {
        let params = params.validated()?;
        self.settings.lock().params = params;
        self.reference.lock().apply_params(&params);
        log::info!(
            "Compensation parameters: beta {:.3} samples {} zero velocity {} offset {:?}",
            params.lpf_beta,
            params.samples,
            params.zero_velocity,
            params.offset
        );
        Ok(params)
    }

    pub fn parameters(&self) -> CompensationParameters {
        self.settings.lock().params
    }

    /// Capture a new zero pose from the next reference sample
    pub fn reset_zero_pose(&self) {
        self.invalidate_reference();
        log::info!("Zero pose reset");
    }

    // ===== Reference path =====

    /// Capture the reference tracker's current world pose as origin.
    ///
    /// Fails with `ZeroPoseAlreadySet` until the zero pose is reset or the
    /// engine is re-armed.
    pub fn set_zero_pose(&self, sample: &PoseSample) -> CResult<()> {
        let (position, rotation) = pose_to_world(sample);
        {
            let mut zero = self.zero.lock();
            if zero.valid {
                return Err(CompensationError::ZeroPoseAlreadySet);
            }
            *zero = ZeroPose {
                valid: true,
                position,
                rotation,
            };
        }

        let motion = {
            let mut reference = self.reference.lock();
            reference.invalidate();
            reference.filter(sample.timestamp, &position, &rotation)
        };
        *self.motion.lock() = motion;

        log::debug!(
            "Zero pose captured at [{:.3}, {:.3}, {:.3}]",
            position.x,
            position.y,
            position.z
        );
        Ok(())
    }

    /// Advance the reference filters with a new raw reference sample
    pub fn update_reference(&self, sample: &PoseSample) {
        let (position, rotation) = pose_to_world(sample);

        let (motion, became_valid) = {
            let mut reference = self.reference.lock();
            let motion = reference.filter(sample.timestamp, &position, &rotation);
            let mut became_valid = false;
            if !reference.valid {
                reference.warmup += 1;
                if reference.warmup >= WARMUP_SAMPLES {
                    reference.valid = true;
                    became_valid = true;
                }
            }
            (motion, became_valid)
        };
        *self.motion.lock() = motion;
        self.reference_samples.fetch_add(1, Ordering::Relaxed);

        if became_valid {
            log::info!("Reference pose valid after {} samples", WARMUP_SAMPLES);
        }
    }

    // ===== Target path =====

    /// Apply compensation to a target sample.
    ///
    /// Returns the input unchanged unless the engine is enabled, the zero pose
    /// is captured and the reference has warmed up.
    pub fn compensate(&self, sample: &PoseSample) -> PoseSample {
        let settings = *self.settings.lock();
        if !settings.enabled {
            return *sample;
        }
        let zero = *self.zero.lock();
        if !zero.valid {
            return *sample;
        }
        let (reference_valid, reference_position, reference_rotation) = {
            let reference = self.reference.lock();
            (reference.valid, reference.position, reference.rotation)
        };
        if !reference_valid {
            return *sample;
        }
        let motion = *self.motion.lock();

        let drift = reference_rotation * zero.rotation.inverse();
        let inverse_drift = drift.inverse();

        let (world_position, world_rotation) = pose_to_world(sample);
        let params = settings.params;
        let position = zero.position
            + inverse_drift.transform_vector(&(world_position - reference_position))
            + params.offset.translation_vec();
        let rotation = inverse_drift * world_rotation * params.offset.rotation_quat();

        let mut out = pose_from_world(sample, &position, &rotation);
        if params.zero_velocity {
            out.velocity = Vec3::zeros();
            out.acceleration = Vec3::zeros();
            out.angular_velocity = Vec3::zeros();
            out.angular_acceleration = Vec3::zeros();
        } else {
            let frame = &sample.world_from_driver;
            out.velocity -= driver_direction(frame, &motion.velocity);
            out.acceleration -= driver_direction(frame, &motion.acceleration);
            out.angular_velocity -= driver_direction(frame, &motion.angular_velocity);
            out.angular_acceleration -= driver_direction(frame, &motion.angular_acceleration);
        }

        self.compensated_samples.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "compensated [{:.4}, {:.4}, {:.4}] -> [{:.4}, {:.4}, {:.4}]",
            sample.position.x,
            sample.position.y,
            sample.position.z,
            out.position.x,
            out.position.y,
            out.position.z
        );
        out
    }

    // ===== Queries =====

    pub fn is_enabled(&self) -> bool {
        self.settings.lock().enabled
    }

    pub fn mode(&self) -> CompensationMode {
        self.settings.lock().mode
    }

    pub fn reference_id(&self) -> Option<u32> {
        self.settings.lock().reference_id
    }

    pub fn target_id(&self) -> Option<u32> {
        self.settings.lock().target_id
    }

    pub fn is_zero_pose_valid(&self) -> bool {
        self.zero.lock().valid
    }

    pub fn is_reference_valid(&self) -> bool {
        self.reference.lock().valid
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let settings = *self.settings.lock();
        let zero = *self.zero.lock();
        let (reference_valid, warmup_samples, reference_position) = {
            let reference = self.reference.lock();
            (reference.valid, reference.warmup, reference.position)
        };
        let motion = *self.motion.lock();

        EngineSnapshot {
            enabled: settings.enabled,
            mode: settings.mode,
            reference_id: settings.reference_id,
            target_id: settings.target_id,
            parameters: settings.params,
            zero_pose_valid: zero.valid,
            zero_position: vec3_to_array(&zero.position),
            reference_valid,
            warmup_samples,
            reference_position: vec3_to_array(&reference_position),
            reference_velocity: vec3_to_array(&motion.velocity),
            reference_samples: self.reference_samples.load(Ordering::Relaxed),
            compensated_samples: self.compensated_samples.load(Ordering::Relaxed),
        }
    }
}

impl Default for MotionCompensationEngine {
    fn default() -> Self {
        Self::new(CompensationParameters::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameTransform;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    const DT: f64 = 0.01;

    fn sample_at(tick: u32, position: Vec3) -> PoseSample {
        PoseSample::new(tick as f64 * DT, position, Quat::identity())
    }

    /// Engine without smoothing so filtered values equal raw input
    fn unfiltered_engine() -> MotionCompensationEngine {
        MotionCompensationEngine::new(CompensationParameters {
            lpf_beta: 1.0,
            samples: 1,
            ..CompensationParameters::default()
        })
    }

    /// Zero capture plus enough updates to finish warm-up
    fn warm_up(engine: &MotionCompensationEngine, position: Vec3) -> u32 {
        engine.set_zero_pose(&sample_at(0, position)).unwrap();
        for tick in 1..=WARMUP_SAMPLES {
            engine.update_reference(&sample_at(tick, position));
        }
        WARMUP_SAMPLES
    }

    #[test]
    fn test_default_parameters() {
        let params = CompensationParameters::default();
        assert_eq!(params.lpf_beta, 0.2);
        assert_eq!(params.samples, 100);
        assert!(!params.zero_velocity);
        assert!(params.offset.is_zero());
    }

    #[test]
    fn test_disabled_engine_passes_through() {
        let engine = unfiltered_engine();
        let sample = sample_at(0, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(engine.compensate(&sample), sample);
    }

    #[test]
    fn test_warmup_passthrough() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        let target = sample_at(0, Vec3::new(0.0, 1.6, 0.0));

        engine.set_zero_pose(&sample_at(0, Vec3::zeros())).unwrap();
        for tick in 1..WARMUP_SAMPLES {
            engine.update_reference(&sample_at(tick, Vec3::new(0.0, 0.5, 0.0)));
            assert_eq!(engine.compensate(&target), target);
        }
        assert!(!engine.is_reference_valid());

        engine.update_reference(&sample_at(WARMUP_SAMPLES, Vec3::new(0.0, 0.5, 0.0)));
        assert!(engine.is_reference_valid());
        let out = engine.compensate(&target);
        assert_relative_eq!(out.position, Vec3::new(0.0, 1.1, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_reference_displacement_is_inverted() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);

        // 100 ticks at the origin: the zero capture plus 99 updates
        engine.set_zero_pose(&sample_at(0, Vec3::zeros())).unwrap();
        for tick in 1..WARMUP_SAMPLES {
            engine.update_reference(&sample_at(tick, Vec3::zeros()));
        }
        engine.update_reference(&sample_at(WARMUP_SAMPLES, Vec3::new(0.0, 0.1, 0.0)));

        let raw = Vec3::new(0.2, 1.7, -0.3);
        let out = engine.compensate(&sample_at(WARMUP_SAMPLES, raw));
        assert_relative_eq!(out.position - raw, Vec3::new(0.0, -0.1, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_filtered_step_settles() {
        let engine = MotionCompensationEngine::default();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        let raw = Vec3::new(0.2, 1.7, -0.3);
        let target = sample_at(0, raw);

        engine.set_zero_pose(&sample_at(0, Vec3::zeros())).unwrap();
        for tick in 1..WARMUP_SAMPLES {
            engine.update_reference(&sample_at(tick, Vec3::zeros()));
            assert_eq!(engine.compensate(&target), target);
        }

        let step = Vec3::new(0.0, 0.1, 0.0);
        engine.update_reference(&sample_at(WARMUP_SAMPLES, step));
        assert!(engine.is_reference_valid());
        // smoothing lags the step
        let first = engine.compensate(&target);
        assert!((first.position - raw).y.abs() < 0.05);

        let mut out = first;
        for tick in WARMUP_SAMPLES + 1..WARMUP_SAMPLES + 2000 {
            engine.update_reference(&sample_at(tick, step));
            out = engine.compensate(&sample_at(tick, raw));
            assert!(out.position.iter().all(|v| v.is_finite()));
            assert!(out.velocity.iter().all(|v| v.is_finite()));
            assert!(out.acceleration.iter().all(|v| v.is_finite()));
        }
        assert_relative_eq!(out.position - raw, Vec3::new(0.0, -0.1, 0.0), epsilon = 1e-6);
        assert_relative_eq!(out.velocity, Vec3::zeros(), epsilon = 1e-6);
        assert!(out.rotation.angle_to(&Quat::identity()) < 1e-9);
    }

    #[test]
    fn test_reference_rotation_is_inverted() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        let tick = warm_up(&engine, Vec3::zeros());

        let yaw = Quat::from_euler_angles(0.0, 0.0, 0.3);
        let reference = PoseSample::new((tick + 1) as f64 * DT, Vec3::zeros(), yaw);
        engine.update_reference(&reference);

        // A device rigidly attached to the rotating platform
        let attached = Vec3::new(1.0, 0.0, 0.0);
        let target = PoseSample::new(0.0, yaw * attached, yaw);
        let out = engine.compensate(&target);
        assert_relative_eq!(out.position, attached, epsilon = 1e-9);
        assert_abs_diff_eq!(out.rotation.angle_to(&Quat::identity()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_compensation_respects_driver_frame() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());
        engine.update_reference(&sample_at(WARMUP_SAMPLES + 1, Vec3::new(0.0, 0.0, 0.2)));

        let frame = FrameTransform::new(Quat::from_euler_angles(0.0, 0.0, 1.0), Vec3::new(1.0, 2.0, 0.0));
        let target = sample_at(0, Vec3::new(0.5, 0.5, 0.5)).with_frame(frame);
        let (world_in, _) = pose_to_world(&target);
        let out = engine.compensate(&target);
        let (world_out, _) = pose_to_world(&out);
        assert_relative_eq!(world_out - world_in, Vec3::new(0.0, 0.0, -0.2), epsilon = 1e-9);
    }

    #[test]
    fn test_offset_is_applied() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());
        engine
            .set_parameters(CompensationParameters {
                lpf_beta: 1.0,
                samples: 1,
                zero_velocity: false,
                offset: PoseOffset {
                    translation: [0.0, 0.0, 0.05],
                    rotation: [0.0, 0.0, 90.0],
                },
            })
            .unwrap();

        let out = engine.compensate(&sample_at(0, Vec3::zeros()));
        assert_relative_eq!(out.position, Vec3::new(0.0, 0.0, 0.05), epsilon = 1e-9);
        let expected = Quat::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        assert_abs_diff_eq!(out.rotation.angle_to(&expected), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reference_velocity_subtracted() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        let tick = warm_up(&engine, Vec3::zeros());
        // reference moving at 1 m/s along x
        engine.update_reference(&sample_at(tick + 1, Vec3::new(DT, 0.0, 0.0)));

        let target = sample_at(0, Vec3::zeros()).with_velocity(Vec3::new(1.5, 0.0, 0.0), Vec3::zeros());
        let out = engine.compensate(&target);
        assert_relative_eq!(out.velocity, Vec3::new(0.5, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_zero_velocity_mode() {
        let engine = MotionCompensationEngine::new(CompensationParameters {
            lpf_beta: 1.0,
            samples: 1,
            zero_velocity: true,
            ..CompensationParameters::default()
        });
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());

        let target = sample_at(0, Vec3::zeros())
            .with_velocity(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.1, 0.2, 0.3))
            .with_acceleration(Vec3::new(4.0, 5.0, 6.0), Vec3::new(0.4, 0.5, 0.6));
        let out = engine.compensate(&target);
        assert_eq!(out.velocity, Vec3::zeros());
        assert_eq!(out.acceleration, Vec3::zeros());
        assert_eq!(out.angular_velocity, Vec3::zeros());
        assert_eq!(out.angular_acceleration, Vec3::zeros());
    }

    #[test]
    fn test_zero_pose_only_once_per_arm() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        engine.set_zero_pose(&sample_at(0, Vec3::zeros())).unwrap();
        assert_eq!(
            engine.set_zero_pose(&sample_at(1, Vec3::zeros())),
            Err(CompensationError::ZeroPoseAlreadySet)
        );

        engine.reset_zero_pose();
        assert!(!engine.is_zero_pose_valid());
        assert!(engine.set_zero_pose(&sample_at(2, Vec3::zeros())).is_ok());
    }

    #[test]
    fn test_arm_idempotent_for_same_ids() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());
        assert!(engine.is_reference_valid());

        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        assert!(engine.is_zero_pose_valid());
        assert!(engine.is_reference_valid());

        engine.arm(CompensationMode::ReferenceTracker, 2, 0);
        assert!(!engine.is_zero_pose_valid());
        assert!(!engine.is_reference_valid());
        assert_eq!(engine.reference_id(), Some(2));
    }

    #[test]
    fn test_new_reference_tracker_forces_reacquire() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());

        engine.set_new_target(3);
        assert!(engine.is_reference_valid());
        assert_eq!(engine.target_id(), Some(3));

        engine.set_new_reference_tracker(4);
        assert!(!engine.is_zero_pose_valid());
        assert!(!engine.is_reference_valid());
        assert!(engine.is_enabled());
    }

    #[test]
    fn test_disable_resets_mode() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        engine.arm(CompensationMode::Disabled, 1, 0);
        assert!(!engine.is_enabled());
        assert_eq!(engine.mode(), CompensationMode::Disabled);
        assert_eq!(engine.reference_id(), None);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let engine = MotionCompensationEngine::default();
        let result = engine.set_parameters(CompensationParameters {
            lpf_beta: f64::NAN,
            ..CompensationParameters::default()
        });
        assert!(matches!(result, Err(CompensationError::InvalidParameters(_))));
        assert_eq!(engine.parameters(), CompensationParameters::default());

        let applied = engine
            .set_parameters(CompensationParameters {
                lpf_beta: 3.0,
                ..CompensationParameters::default()
            })
            .unwrap();
        assert_eq!(applied.lpf_beta, 1.0);
    }

    #[test]
    fn test_degenerate_window_position_passthrough() {
        let engine = MotionCompensationEngine::new(CompensationParameters {
            samples: 0,
            ..CompensationParameters::default()
        });
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());
        engine.update_reference(&sample_at(WARMUP_SAMPLES + 1, Vec3::new(0.3, 0.0, 0.0)));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.reference_position, [0.3, 0.0, 0.0]);
        assert!(snapshot.reference_position.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_snapshot_counters() {
        let engine = unfiltered_engine();
        engine.arm(CompensationMode::ReferenceTracker, 1, 0);
        warm_up(&engine, Vec3::zeros());
        engine.compensate(&sample_at(0, Vec3::zeros()));

        let snapshot = engine.snapshot();
        assert!(snapshot.enabled);
        assert!(snapshot.zero_pose_valid);
        assert!(snapshot.reference_valid);
        assert_eq!(snapshot.warmup_samples, WARMUP_SAMPLES);
        assert_eq!(snapshot.reference_samples, WARMUP_SAMPLES as u64);
        assert_eq!(snapshot.compensated_samples, 1);
        assert_eq!(snapshot.reference_id, Some(1));
        assert_eq!(snapshot.target_id, Some(0));
    }
}
