use crate::device::DeviceHandle;
use crate::error::{CResult, CompensationError};
use crate::types::{DeviceClass, DeviceRole, MAX_TRACKED_DEVICES};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Generation-checked reference to a registry slot.
///
/// A key taken before a detach no longer resolves after it, even if the same
/// device id is attached again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub index: u32,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    handle: Option<Arc<DeviceHandle>>,
}

/// Fixed arena of device slots indexed by host device id
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let slots = (0..MAX_TRACKED_DEVICES).map(|_| Slot::default()).collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> CResult<RwLockWriteGuard<'_, Vec<Slot>>> {
        self.slots
            .write()
            .map_err(|_| CompensationError::Internal("Failed to acquire registry lock".to_string()))
    }

    /// Register a newly attached device
    pub fn attach(
        &self,
        device_id: u32,
        serial: &str,
        device_class: DeviceClass,
    ) -> CResult<(DeviceKey, Arc<DeviceHandle>)> {
        if device_id >= MAX_TRACKED_DEVICES {
            return Err(CompensationError::InvalidDeviceId(device_id));
        }
        let mut slots = self.write()?;
        let slot = &mut slots[device_id as usize];
        if slot.handle.is_some() {
            return Err(CompensationError::AlreadyInUse(device_id));
        }

        let handle = Arc::new(DeviceHandle::new(device_id, serial, device_class));
        slot.handle = Some(Arc::clone(&handle));
        log::info!(
            "Device {} attached: {} ({:?})",
            device_id,
            serial,
            device_class
        );
        Ok((
            DeviceKey {
                index: device_id,
                generation: slot.generation,
            },
            handle,
        ))
    }

    /// Remove a device; its handle and any outstanding keys become invalid
    pub fn detach(&self, device_id: u32) -> CResult<Arc<DeviceHandle>> {
        if device_id >= MAX_TRACKED_DEVICES {
            return Err(CompensationError::InvalidDeviceId(device_id));
        }
        let mut slots = self.write()?;
        let slot = &mut slots[device_id as usize];
        let handle = slot
            .handle
            .take()
            .ok_or(CompensationError::DeviceNotFound(device_id))?;
        slot.generation += 1;
        handle.invalidate();
        log::info!("Device {} detached: {}", device_id, handle.serial());
        Ok(handle)
    }

    pub fn get(&self, device_id: u32) -> Option<Arc<DeviceHandle>> {
        if device_id >= MAX_TRACKED_DEVICES {
            return None;
        }
        self.read()[device_id as usize].handle.clone()
    }

    pub fn key_of(&self, device_id: u32) -> Option<DeviceKey> {
        if device_id >= MAX_TRACKED_DEVICES {
            return None;
        }
        let slots = self.read();
        let slot = &slots[device_id as usize];
        slot.handle.as_ref().map(|_| DeviceKey {
            index: device_id,
            generation: slot.generation,
        })
    }

    /// Look up a handle by key, failing if the slot was recycled
    pub fn resolve(&self, key: DeviceKey) -> CResult<Arc<DeviceHandle>> {
        let slots = self.read();
        let slot = slots
            .get(key.index as usize)
            .ok_or(CompensationError::InvalidDeviceId(key.index))?;
        if slot.generation != key.generation {
            return Err(CompensationError::StaleHandle);
        }
        slot.handle
            .clone()
            .ok_or(CompensationError::DeviceNotFound(key.index))
    }

    /// Attached devices in id order
    pub fn devices(&self) -> Vec<Arc<DeviceHandle>> {
        self.read()
            .iter()
            .filter_map(|slot| slot.handle.clone())
            .collect()
    }

    pub fn with_role(&self, role: DeviceRole) -> Vec<Arc<DeviceHandle>> {
        self.devices()
            .into_iter()
            .filter(|handle| handle.role() == role)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().iter().filter(|slot| slot.handle.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
