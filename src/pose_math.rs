//! Stateless pose math: quaternion algebra, spherical interpolation,
//! Euler conversion and driver/world frame conversion.

use crate::types::{FrameTransform, PoseSample, Quat, Vec3};
use nalgebra::Quaternion;

/// Below this `sin(theta)` slerp falls back to normalized lerp
const SLERP_EPSILON: f64 = 1e-9;

pub fn conjugate(q: &Quat) -> Quat {
    q.conjugate()
}

pub fn multiply(a: &Quat, b: &Quat) -> Quat {
    a * b
}

/// Rotate `v` by `q`. With `translate` set, `v` is a point and `translation`
/// is added after the rotation; otherwise `v` is a direction.
pub fn rotate_vector(q: &Quat, translation: &Vec3, v: &Vec3, translate: bool) -> Vec3 {
    let rotated = q.transform_vector(v);
    if translate {
        rotated + translation
    } else {
        rotated
    }
}

/// Spherical linear interpolation from `q1` (t = 0) to `q2` (t = 1).
///
/// Returns `q1` unmodified when the inputs are already aligned or opposed
/// (|dot| >= 1), where `sin(theta)` would be zero.
pub fn slerp(q1: &Quat, q2: &Quat, t: f64) -> Quat {
    let dot = q1.coords.dot(&q2.coords);
    if dot >= 1.0 || dot <= -1.0 {
        return *q1;
    }

    // q and -q are the same rotation, take the short arc
    let (target, dot) = if dot < 0.0 {
        (-q2.coords, -dot)
    } else {
        (q2.coords, dot)
    };

    let theta = dot.acos();
    let sin_theta = theta.sin();
    let blended = if sin_theta < SLERP_EPSILON {
        q1.coords * (1.0 - t) + target * t
    } else {
        let a = ((1.0 - t) * theta).sin() / sin_theta;
        let b = (t * theta).sin() / sin_theta;
        q1.coords * a + target * b
    };

    Quat::new_normalize(Quaternion::from_vector(blended))
}

/// Quaternion to (roll, pitch, yaw) in radians.
///
/// Pitch is clamped to ±90° when `sin(pitch)` leaves [-1, 1] (gimbal lock).
pub fn to_euler_angles(q: &Quat) -> Vec3 {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let sinr_cosp = 2.0 * (w * x + y * z);
    let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
    let roll = sinr_cosp.atan2(cosr_cosp);

    let sinp = 2.0 * (w * y - z * x);
    let pitch = if sinp.abs() >= 1.0 {
        std::f64::consts::FRAC_PI_2.copysign(sinp)
    } else {
        sinp.asin()
    };

    let siny_cosp = 2.0 * (w * z + x * y);
    let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
    let yaw = siny_cosp.atan2(cosy_cosp);

    Vec3::new(roll, pitch, yaw)
}

/// Rotation from (roll, pitch, yaw) in degrees
pub fn from_euler_degrees(angles: &Vec3) -> Quat {
    Quat::from_euler_angles(
        angles.x.to_radians(),
        angles.y.to_radians(),
        angles.z.to_radians(),
    )
}

/// Signed shortest-path difference `new - old` in degrees, within [-180, 180)
pub fn angle_difference(old: f64, new: f64) -> f64 {
    (new - old + 180.0).rem_euclid(360.0) - 180.0
}

// ===== Frame conversion =====

pub fn world_position(frame: &FrameTransform, driver_position: &Vec3) -> Vec3 {
    rotate_vector(&frame.rotation, &frame.translation, driver_position, true)
}

pub fn world_rotation(frame: &FrameTransform, driver_rotation: &Quat) -> Quat {
    frame.rotation * driver_rotation
}

pub fn world_direction(frame: &FrameTransform, driver_direction: &Vec3) -> Vec3 {
    frame.rotation.transform_vector(driver_direction)
}

pub fn driver_position(frame: &FrameTransform, world_position: &Vec3) -> Vec3 {
    frame
        .rotation
        .inverse_transform_vector(&(world_position - frame.translation))
}

pub fn driver_rotation(frame: &FrameTransform, world_rotation: &Quat) -> Quat {
    frame.rotation.inverse() * world_rotation
}

pub fn driver_direction(frame: &FrameTransform, world_direction: &Vec3) -> Vec3 {
    frame.rotation.inverse_transform_vector(world_direction)
}

/// World-space position and rotation of a sample
pub fn pose_to_world(sample: &PoseSample) -> (Vec3, Quat) {
    (
        world_position(&sample.world_from_driver, &sample.position),
        world_rotation(&sample.world_from_driver, &sample.rotation),
    )
}

/// Copy of `sample` with its position and rotation replaced by the given world pose
pub fn pose_from_world(sample: &PoseSample, position: &Vec3, rotation: &Quat) -> PoseSample {
    let mut out = *sample;
    out.position = driver_position(&sample.world_from_driver, position);
    out.rotation = driver_rotation(&sample.world_from_driver, rotation);
    out
}
