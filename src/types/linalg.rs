//! Linear algebra type system for pose compensation
//!
//! Clean aliases over nalgebra so the engine, filters and codec
//! all speak the same vector and quaternion types.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

// ===== Core Types =====
pub type Vec3 = Vector3<f64>;
pub type Quat = UnitQuaternion<f64>;

// ===== Constructors =====

/// Zero vector
pub fn vec3_zero() -> Vec3 {
    Vec3::zeros()
}

/// Build a vector from a plain array (wire and config representation)
pub fn vec3_from_array(v: [f64; 3]) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

/// Inverse of [`vec3_from_array`]
pub fn vec3_to_array(v: &Vec3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

/// Build a unit quaternion from (w, x, y, z) components, normalizing on the way in
pub fn quat_from_wxyz(w: f64, x: f64, y: f64, z: f64) -> Quat {
    UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
}

/// Quaternion components as (w, x, y, z)
pub fn quat_to_wxyz(q: &Quat) -> [f64; 4] {
    [q.w, q.i, q.j, q.k]
}

// ===== Limits =====
pub const MAX_TRACKED_DEVICES: u32 = 64; // host runtime device slot count
