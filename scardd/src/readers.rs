// Copyright 2023 Gravitational, Inc
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The reader registry: owns the slot table, loads and reference-counts
//! driver modules, allocates unique display names and runs one event
//! worker per slot.

use crate::cards::CardHandle;
use crate::errors::{ScardResult, Status};
use crate::events;
use crate::ifd::{
    load_driver, DriverBinding, DriverLoadError, DriverModule, IfdHandler,
};
use crate::state::{ReaderState, StateTable};
use crate::MAX_READERS;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Sharing and transaction-lock bookkeeping for one slot. Mutated only
/// under this mutex, which is distinct from the driver mutex so state
/// updates never wait behind a long transmit.
#[derive(Debug, Default)]
pub struct SlotConn {
    /// 0 = free, n > 0 = shared by n handles, negative = exclusive.
    pub sharing: i32,
    /// Handle id holding the transaction lock, 0 when unlocked.
    pub lock_owner: u32,
    pub lock_depth: u32,
}

/// One physical card slot under management.
pub struct ReaderSlot {
    /// Full display name, unique process-wide.
    pub name: String,
    /// Display name as configured, before suffix allocation.
    pub base_name: String,
    pub library: String,
    pub device: String,
    pub channel: u32,
    /// Row in the published state table.
    pub index: usize,
    /// Slot number within the driver module.
    pub slot: u32,
    pub handler: IfdHandler,
    pub max_input: usize,
    pub shutdown: AtomicBool,
    /// Raised once the reader is torn down; operations on surviving
    /// handles fail with READER_UNAVAILABLE.
    pub defunct: AtomicBool,
    pub conn: Mutex<SlotConn>,
    /// Signalled when the transaction lock is released.
    pub lock_cv: Condvar,
    /// Open handles bound to this slot, for sticky event delivery.
    pub handles: Mutex<HashMap<u32, Arc<CardHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReaderSlot {
    /// Sets sticky event bits on every open handle of this slot.
    pub fn mark_handles(&self, bits: u32) {
        for handle in self.handles.lock().values() {
            handle.events.fetch_or(bits, Ordering::SeqCst);
        }
    }

    pub fn attach_handle(&self, handle: Arc<CardHandle>) {
        self.handles.lock().insert(handle.id, handle);
    }

    pub fn detach_handle(&self, id: u32) {
        self.handles.lock().remove(&id);
    }
}

struct ModuleRef {
    module: Weak<DriverModule>,
    /// Shared across all slots of the module when the driver does not
    /// advertise simultaneous access.
    lock: Weak<Mutex<()>>,
    simultaneous: bool,
}

/// Raised when a driver shared object cannot be loaded or bound. There is
/// no defensible way to continue; callers abort the daemon.
#[derive(Debug)]
pub struct FatalDriverError(pub DriverLoadError);

pub enum AddReaderError {
    Fatal(FatalDriverError),
    Status(Status),
}

impl From<Status> for AddReaderError {
    fn from(status: Status) -> Self {
        AddReaderError::Status(status)
    }
}

impl AddReaderError {
    pub fn status(&self) -> Status {
        match self {
            AddReaderError::Fatal(_) => Status::SCARD_F_UNKNOWN_ERROR,
            AddReaderError::Status(status) => *status,
        }
    }
}

pub struct Registry {
    slots: RwLock<Vec<Option<Arc<ReaderSlot>>>>,
    modules: Mutex<HashMap<String, ModuleRef>>,
    state: Arc<StateTable>,
}

impl Registry {
    pub fn new(state: Arc<StateTable>) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new((0..MAX_READERS).map(|_| None).collect()),
            modules: Mutex::new(HashMap::new()),
            state,
        })
    }

    pub fn state(&self) -> &Arc<StateTable> {
        &self.state
    }

    /// Adds a reader backed by the driver at `library`, loading the shared
    /// object on first use. Multi-slot readers get one managed slot (and
    /// one event worker) per driver slot.
    pub fn add(
        self: &Arc<Self>,
        name: &str,
        device: &str,
        library: &str,
        channel: u32,
    ) -> Result<(), AddReaderError> {
        let (module, lock_template, simultaneous) = self.module_for(library)?;
        self.add_slots(name, device, channel, module, lock_template, simultaneous)
    }

    /// Adds a reader backed by an in-process driver binding. The reference
    /// implementation ships a fake driver library for its test suite; this
    /// is the equivalent injection point.
    pub fn add_with_binding(
        self: &Arc<Self>,
        name: &str,
        device: &str,
        channel: u32,
        binding: Box<dyn DriverBinding>,
    ) -> Result<(), AddReaderError> {
        let module = DriverModule::new(format!("<builtin:{}>", name), binding);
        let simultaneous = module.simultaneous_access();
        let lock = Arc::new(Mutex::new(()));
        self.add_slots(name, device, channel, module, lock, simultaneous)
    }

    fn module_for(
        &self,
        library: &str,
    ) -> Result<(Arc<DriverModule>, Arc<Mutex<()>>, bool), AddReaderError> {
        let mut modules = self.modules.lock();
        if let Some(entry) = modules.get(library) {
            if let (Some(module), Some(lock)) =
                (entry.module.upgrade(), entry.lock.upgrade())
            {
                return Ok((module, lock, entry.simultaneous));
            }
        }
        let binding = load_driver(library)
            .map_err(|e| AddReaderError::Fatal(FatalDriverError(e)))?;
        let module = DriverModule::new(library.to_string(), binding);
        let simultaneous = module.simultaneous_access();
        let lock = Arc::new(Mutex::new(()));
        modules.insert(
            library.to_string(),
            ModuleRef {
                module: Arc::downgrade(&module),
                lock: Arc::downgrade(&lock),
                simultaneous,
            },
        );
        Ok((module, lock, simultaneous))
    }

    fn add_slots(
        self: &Arc<Self>,
        name: &str,
        device: &str,
        channel: u32,
        module: Arc<DriverModule>,
        shared_lock: Arc<Mutex<()>>,
        simultaneous: bool,
    ) -> Result<(), AddReaderError> {
        let digit = {
            let slots = self.slots.read();
            for slot in slots.iter().flatten() {
                if slot.base_name == name && slot.channel == channel {
                    warn!("reader {} on channel {:#x} already present", name, channel);
                    return Err(Status::SCARD_E_DUPLICATE_READER.into());
                }
            }
            let used: Vec<u32> = slots
                .iter()
                .flatten()
                .filter(|slot| slot.base_name == name)
                .map(|slot| slot.digit())
                .collect();
            match (0..MAX_READERS as u32).find(|d| !used.contains(d)) {
                Some(digit) => digit,
                None => return Err(Status::SCARD_E_NO_MEMORY.into()),
            }
        };

        let slot_count = module.slot_count();
        let mut created: Vec<Arc<ReaderSlot>> = Vec::with_capacity(slot_count);

        for slot_number in 0..slot_count as u32 {
            let lock = if simultaneous {
                Arc::new(Mutex::new(()))
            } else {
                shared_lock.clone()
            };
            let handler = IfdHandler::new(module.clone(), slot_number, lock);
            let full_name = format!("{} {:X} {}", name, digit, slot_number);

            if let Err(e) = handler.open_channel(channel, device) {
                error!("cannot open {} (channel {:#x}): {:?}", full_name, channel, e);
                self.rollback(created);
                return Err(Status::SCARD_E_CARD_UNSUPPORTED.into());
            }

            let index = match self
                .state
                .publish(ReaderState::new(full_name.clone()))
            {
                Some(index) => index,
                None => {
                    let _ = handler.close_channel();
                    self.rollback(created);
                    return Err(Status::SCARD_E_NO_MEMORY.into());
                }
            };

            let max_input = handler.max_input();
            let reader = Arc::new(ReaderSlot {
                name: full_name,
                base_name: name.to_string(),
                library: module.library.clone(),
                device: device.to_string(),
                channel,
                index,
                slot: slot_number,
                handler,
                max_input,
                shutdown: AtomicBool::new(false),
                defunct: AtomicBool::new(false),
                conn: Mutex::new(SlotConn::default()),
                lock_cv: Condvar::new(),
                handles: Mutex::new(HashMap::new()),
                worker: Mutex::new(None),
            });

            let mut table = self.slots.write();
            match table.iter().position(|s| s.is_none()) {
                Some(free) => table[free] = Some(reader.clone()),
                None => {
                    drop(table);
                    self.state.clear(index);
                    let _ = reader.handler.close_channel();
                    self.rollback(created);
                    return Err(Status::SCARD_E_NO_MEMORY.into());
                }
            }
            drop(table);

            let worker = events::spawn(reader.clone(), self.state.clone());
            *reader.worker.lock() = Some(worker);
            info!("reader {} added (slot {}/{})", reader.name, slot_number, slot_count);
            created.push(reader);
        }

        Ok(())
    }

    fn rollback(&self, created: Vec<Arc<ReaderSlot>>) {
        for reader in created {
            self.retire(&reader);
        }
    }

    /// Removes every slot registered under `(name, channel)`. Open handles
    /// observe the removal through their sticky event bit and fail all
    /// further operations.
    pub fn remove(&self, name: &str, channel: u32) -> ScardResult<()> {
        let victims: Vec<Arc<ReaderSlot>> = self
            .slots
            .read()
            .iter()
            .flatten()
            .filter(|slot| slot.base_name == name && slot.channel == channel)
            .cloned()
            .collect();
        if victims.is_empty() {
            return Err(Status::SCARD_E_UNKNOWN_READER);
        }
        for reader in victims {
            self.retire(&reader);
            info!("reader {} removed", reader.name);
        }
        Ok(())
    }

    fn retire(&self, reader: &Arc<ReaderSlot>) {
        // Worker first, then the driver channel, then the module reference
        // (the shared object unloads with the last Arc).
        reader.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = reader.worker.lock().take() {
            let _ = worker.join();
        }
        reader.defunct.store(true, Ordering::SeqCst);
        reader.mark_handles(crate::cards::EVENT_REMOVED);
        {
            // Break any transaction so blocked clients fail over.
            let mut conn = reader.conn.lock();
            conn.lock_owner = 0;
            conn.lock_depth = 0;
            reader.lock_cv.notify_all();
        }
        if let Err(e) = reader.handler.close_channel() {
            debug!("close channel on {}: {:?}", reader.name, e);
        }
        let mut table = self.slots.write();
        if let Some(entry) = table
            .iter_mut()
            .find(|s| s.as_ref().map(|s| s.index) == Some(reader.index))
        {
            *entry = None;
        }
        drop(table);
        self.state.clear(reader.index);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ReaderSlot>> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|slot| slot.name == name)
            .cloned()
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// Tears down every reader. Used by the daemon drain path.
    pub fn shutdown(&self) {
        let all: Vec<Arc<ReaderSlot>> = self.slots.read().iter().flatten().cloned().collect();
        for reader in all {
            self.retire(&reader);
        }
    }
}

impl ReaderSlot {
    /// The suffix digit allocated for this reader, parsed back out of the
    /// display name.
    fn digit(&self) -> u32 {
        self.name
            .get(self.base_name.len() + 1..)
            .and_then(|rest| rest.split(' ').next())
            .and_then(|digit| u32::from_str_radix(digit, 16).ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifd::fake::FakeDriver;

    fn registry() -> Arc<Registry> {
        Registry::new(Arc::new(StateTable::new()))
    }

    #[test]
    fn add_publishes_reader_state() {
        let registry = registry();
        let (binding, _handle) = FakeDriver::new();
        registry
            .add_with_binding("Gemstone", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        assert_eq!(registry.reader_names(), vec!["Gemstone 0 0".to_string()]);
        let state = registry.state().find_by_name("Gemstone 0 0").unwrap();
        assert_eq!(state.sharing, 0);
        registry.shutdown();
    }

    #[test]
    fn duplicate_name_and_channel_is_rejected() {
        let registry = registry();
        let (binding, _h1) = FakeDriver::new();
        registry
            .add_with_binding("Gemstone", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let (binding, _h2) = FakeDriver::new();
        let err = registry
            .add_with_binding("Gemstone", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap_err();
        assert_eq!(err, Status::SCARD_E_DUPLICATE_READER);
        registry.shutdown();
    }

    #[test]
    fn same_name_different_channel_gets_a_fresh_digit() {
        let registry = registry();
        let (binding, _h1) = FakeDriver::new();
        registry
            .add_with_binding("Twin", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let (binding, _h2) = FakeDriver::new();
        registry
            .add_with_binding("Twin", "", 1, binding)
            .map_err(|e| e.status())
            .unwrap();
        let mut names = registry.reader_names();
        names.sort();
        assert_eq!(names, vec!["Twin 0 0".to_string(), "Twin 1 0".to_string()]);
        registry.shutdown();
    }

    #[test]
    fn multi_slot_reader_gets_one_entry_per_slot() {
        let registry = registry();
        let (binding, _handle) = FakeDriver::with_slots(2);
        registry
            .add_with_binding("Duo", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let mut names = registry.reader_names();
        names.sort();
        assert_eq!(names, vec!["Duo 0 0".to_string(), "Duo 0 1".to_string()]);
        registry.shutdown();
    }

    #[test]
    fn remove_clears_state_and_frees_the_name() {
        let registry = registry();
        let (binding, _h1) = FakeDriver::new();
        registry
            .add_with_binding("Solo", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        registry.remove("Solo", 0).unwrap();
        assert!(registry.reader_names().is_empty());
        assert!(registry.state().find_by_name("Solo 0 0").is_none());
        // The (name, channel) pair is usable again.
        let (binding, _h2) = FakeDriver::new();
        registry
            .add_with_binding("Solo", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        registry.shutdown();
    }

    #[test]
    fn remove_of_unknown_reader_fails() {
        let registry = registry();
        assert_eq!(
            registry.remove("nope", 0).unwrap_err(),
            Status::SCARD_E_UNKNOWN_READER
        );
    }
}
