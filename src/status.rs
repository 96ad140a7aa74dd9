use crate::compensation::{CompensationParameters, EngineSnapshot};
use crate::types::{CompensationMode, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Driver state written periodically for external monitoring
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DriverStatus {
    pub timestamp: f64,
    pub mode: CompensationMode,
    pub enabled: bool,
    pub target_id: Option<u32>,
    pub reference_id: Option<u32>,
    pub parameters: CompensationParameters,
    // Reference acquisition
    pub zero_pose_valid: bool,
    pub reference_valid: bool,
    pub warmup_samples: u32,
    pub reference_position: [f64; 3],
    pub reference_velocity: [f64; 3],
    // Counters
    pub reference_samples: u64,
    pub compensated_samples: u64,
    pub ipc_clients: usize,
    pub devices: Vec<DeviceInfo>,
}

impl DriverStatus {
    pub fn new(snapshot: EngineSnapshot, devices: Vec<DeviceInfo>) -> Self {
        Self {
            timestamp: current_timestamp(),
            mode: snapshot.mode,
            enabled: snapshot.enabled,
            target_id: snapshot.target_id,
            reference_id: snapshot.reference_id,
            parameters: snapshot.parameters,
            zero_pose_valid: snapshot.zero_pose_valid,
            reference_valid: snapshot.reference_valid,
            warmup_samples: snapshot.warmup_samples,
            reference_position: snapshot.reference_position,
            reference_velocity: snapshot.reference_velocity,
            reference_samples: snapshot.reference_samples,
            compensated_samples: snapshot.compensated_samples,
            ipc_clients: 0,
            devices,
        }
    }

    pub fn with_ipc_clients(mut self, clients: usize) -> Self {
        self.ipc_clients = clients;
        self
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
