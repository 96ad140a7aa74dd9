use crate::pose_math::{angle_difference, slerp, to_euler_angles};
use crate::types::{Quat, Vec3};

/// Clamp a low-pass coefficient into [0, 1]; non-finite values fall back to 1 (no smoothing)
pub fn clamp_beta(beta: f64) -> f64 {
    if beta.is_finite() {
        beta.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// DEMA coefficient for an effective window of `samples`.
///
/// Returns `None` when the window is degenerate (`samples < 2`) and the
/// filter should pass raw values through.
pub fn dema_alpha(samples: u32) -> Option<f64> {
    if samples < 2 {
        None
    } else {
        Some(2.0 / (1.0 + samples as f64))
    }
}

/// Double exponential moving average for a single axis
#[derive(Clone, Debug, Default)]
pub struct Dema {
    alpha: Option<f64>,
    ema1: f64,
    ema2: f64,
    seeded: bool,
}

impl Dema {
    pub fn new(samples: u32) -> Self {
        Self {
            alpha: dema_alpha(samples),
            ..Self::default()
        }
    }

    /// Change the effective window; filter history is kept
    pub fn set_samples(&mut self, samples: u32) {
        self.alpha = dema_alpha(samples);
    }

    /// Feed one raw value and return the smoothed value
    pub fn apply(&mut self, raw: f64) -> f64 {
        let Some(alpha) = self.alpha else {
            // Degenerate window: keep the stages tracking the input so a later
            // switch to a real window starts from here.
            self.ema1 = raw;
            self.ema2 = raw;
            self.seeded = true;
            return raw;
        };

        if !self.seeded {
            self.ema1 = raw;
            self.ema2 = raw;
            self.seeded = true;
            return raw;
        }

        self.ema1 += alpha * (raw - self.ema1);
        self.ema2 += alpha * (self.ema1 - self.ema2);
        2.0 * self.ema1 - self.ema2
    }

    pub fn reset(&mut self) {
        self.ema1 = 0.0;
        self.ema2 = 0.0;
        self.seeded = false;
    }
}

/// Per-axis DEMA over a 3D vector
#[derive(Clone, Debug, Default)]
pub struct DemaVector3 {
    axes: [Dema; 3],
}

impl DemaVector3 {
    pub fn new(samples: u32) -> Self {
        Self {
            axes: [Dema::new(samples), Dema::new(samples), Dema::new(samples)],
        }
    }

    pub fn set_samples(&mut self, samples: u32) {
        self.axes.iter_mut().for_each(|a| a.set_samples(samples));
    }

    pub fn apply(&mut self, raw: &Vec3) -> Vec3 {
        Vec3::new(
            self.axes[0].apply(raw.x),
            self.axes[1].apply(raw.y),
            self.axes[2].apply(raw.z),
        )
    }

    pub fn reset(&mut self) {
        self.axes.iter_mut().for_each(Dema::reset);
    }
}

/// Single-stage exponential low-pass for vectors: `s += beta * (x - s)`
#[derive(Clone, Debug)]
pub struct VectorLowPass {
    beta: f64,
    state: Option<Vec3>,
}

impl VectorLowPass {
    pub fn new(beta: f64) -> Self {
        Self {
            beta: clamp_beta(beta),
            state: None,
        }
    }

    pub fn set_beta(&mut self, beta: f64) {
        self.beta = clamp_beta(beta);
    }

    pub fn apply(&mut self, raw: &Vec3) -> Vec3 {
        let next = match self.state {
            Some(smooth) => smooth + (raw - smooth) * self.beta,
            None => *raw,
        };
        self.state = Some(next);
        next
    }

    pub fn value(&self) -> Option<Vec3> {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

/// Two cascaded slerp low-pass stages for rotations
#[derive(Clone, Debug)]
pub struct QuaternionLowPass {
    beta: f64,
    stages: Option<[Quat; 2]>,
}

impl QuaternionLowPass {
    pub fn new(beta: f64) -> Self {
        Self {
            beta: clamp_beta(beta),
            stages: None,
        }
    }

    pub fn set_beta(&mut self, beta: f64) {
        self.beta = clamp_beta(beta);
    }

    pub fn apply(&mut self, raw: &Quat) -> Quat {
        let stages = match self.stages {
            Some([first, second]) => {
                let first = slerp(&first, raw, self.beta);
                let second = slerp(&second, &first, self.beta);
                [first, second]
            }
            None => [*raw, *raw],
        };
        self.stages = Some(stages);
        stages[1]
    }

    pub fn reset(&mut self) {
        self.stages = None;
    }
}

/// Time derivative of a vector stream by finite differences
#[derive(Clone, Debug, Default)]
pub struct FiniteDifference {
    last: Option<(f64, Vec3)>,
    rate: Vec3,
}

impl FiniteDifference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a value at `timestamp` [s]; returns the current rate estimate.
    ///
    /// Zero until two samples exist. A non-increasing timestamp keeps the
    /// previous estimate.
    pub fn update(&mut self, timestamp: f64, value: &Vec3) -> Vec3 {
        if let Some((last_time, last_value)) = self.last {
            let dt = timestamp - last_time;
            if dt <= 0.0 || !dt.is_finite() {
                return self.rate;
            }
            self.rate = (value - last_value) / dt;
        }
        self.last = Some((timestamp, *value));
        self.rate
    }

    pub fn rate(&self) -> Vec3 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.rate = Vec3::zeros();
    }
}

/// Angular rate [rad/s] from consecutive rotations, via Euler angle differences
#[derive(Clone, Debug, Default)]
pub struct AngularRateEstimator {
    /// (timestamp, euler angles in degrees)
    last: Option<(f64, Vec3)>,
    rate: Vec3,
}

impl AngularRateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, timestamp: f64, rotation: &Quat) -> Vec3 {
        let euler = to_euler_angles(rotation).map(f64::to_degrees);
        if let Some((last_time, last_euler)) = self.last {
            let dt = timestamp - last_time;
            if dt <= 0.0 || !dt.is_finite() {
                return self.rate;
            }
            let diff = Vec3::new(
                angle_difference(last_euler.x, euler.x),
                angle_difference(last_euler.y, euler.y),
                angle_difference(last_euler.z, euler.z),
            );
            self.rate = diff.map(f64::to_radians) / dt;
        }
        self.last = Some((timestamp, euler));
        self.rate
    }

    pub fn rate(&self) -> Vec3 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.rate = Vec3::zeros();
    }
}
