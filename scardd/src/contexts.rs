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

//! Context bookkeeping. A context is the per-client ownership root for
//! card handles and the anchor for cancellation: `SCardCancel` raises the
//! context's flag and any `GetStatusChange` bound to it unblocks.

use crate::errors::{ScardResult, Status};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ContextEntry {
    session: u64,
    cancelled: Arc<AtomicBool>,
    handles: HashSet<u32>,
}

/// Process-wide table of established contexts. Sessions own their
/// contexts; cancellation is reachable from any connection since clients
/// deliver `SCardCancel` over a fresh one.
#[derive(Default)]
pub struct ContextTable {
    entries: Mutex<HashMap<u32, ContextEntry>>,
}

impl ContextTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a context owned by `session` and returns its identifier.
    pub fn establish(&self, session: u64) -> u32 {
        let mut entries = self.entries.lock();
        let id = loop {
            let id: u32 = rand::random();
            if id != 0 && !entries.contains_key(&id) {
                break id;
            }
        };
        entries.insert(
            id,
            ContextEntry {
                session,
                cancelled: Arc::new(AtomicBool::new(false)),
                handles: HashSet::new(),
            },
        );
        debug!("context {:#x} established for session {}", id, session);
        id
    }

    /// Releases a context, returning the handles that must be torn down
    /// with it. Fails when the context does not exist or belongs to a
    /// different session.
    pub fn release(&self, session: u64, id: u32) -> ScardResult<Vec<u32>> {
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            Some(entry) if entry.session == session => {
                debug!("context {:#x} released", id);
                Ok(entry.handles.into_iter().collect())
            }
            Some(entry) => {
                // Not ours; put it back.
                entries.insert(id, entry);
                Err(Status::SCARD_E_INVALID_HANDLE)
            }
            None => Err(Status::SCARD_E_INVALID_HANDLE),
        }
    }

    /// Drops every context a disconnected session owned, returning
    /// `(context, handles)` pairs for the cascade.
    pub fn release_session(&self, session: u64) -> Vec<(u32, Vec<u32>)> {
        let mut entries = self.entries.lock();
        let ids: Vec<u32> = entries
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                entries
                    .remove(&id)
                    .map(|entry| (id, entry.handles.into_iter().collect()))
            })
            .collect()
    }

    pub fn owns(&self, session: u64, id: u32) -> bool {
        self.entries
            .lock()
            .get(&id)
            .map(|entry| entry.session == session)
            .unwrap_or(false)
    }

    /// Raises the cancellation flag. The caller is responsible for
    /// kicking the state-change notifier afterwards.
    pub fn cancel(&self, id: u32) -> ScardResult<()> {
        match self.entries.lock().get(&id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Status::SCARD_E_INVALID_HANDLE),
        }
    }

    /// The cancellation flag a blocking wait on this context must watch.
    /// The flag is rearmed here: each wait observes cancellations issued
    /// after it started.
    pub fn cancel_flag(&self, id: u32) -> ScardResult<Arc<AtomicBool>> {
        match self.entries.lock().get(&id) {
            Some(entry) => {
                entry.cancelled.store(false, Ordering::SeqCst);
                Ok(entry.cancelled.clone())
            }
            None => Err(Status::SCARD_E_INVALID_HANDLE),
        }
    }

    pub fn attach_handle(&self, context: u32, handle: u32) {
        if let Some(entry) = self.entries.lock().get_mut(&context) {
            entry.handles.insert(handle);
        }
    }

    pub fn detach_handle(&self, context: u32, handle: u32) {
        if let Some(entry) = self.entries.lock().get_mut(&context) {
            entry.handles.remove(&handle);
        }
    }

    pub fn exists(&self, id: u32) -> bool {
        self.entries.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn establish_and_release() {
        let table = ContextTable::new();
        let id = table.establish(1);
        assert!(table.exists(id));
        assert!(table.owns(1, id));
        assert!(!table.owns(2, id));
        assert!(table.release(1, id).unwrap().is_empty());
        assert!(!table.exists(id));
    }

    #[test]
    fn release_checks_ownership() {
        let table = ContextTable::new();
        let id = table.establish(1);
        assert_eq!(
            table.release(2, id).unwrap_err(),
            Status::SCARD_E_INVALID_HANDLE
        );
        assert!(table.exists(id));
    }

    #[test]
    fn release_returns_attached_handles() {
        let table = ContextTable::new();
        let id = table.establish(1);
        table.attach_handle(id, 42);
        table.attach_handle(id, 43);
        table.detach_handle(id, 43);
        assert_eq!(table.release(1, id).unwrap(), vec![42]);
    }

    #[test]
    fn session_cascade_collects_every_context() {
        let table = ContextTable::new();
        let a = table.establish(7);
        let b = table.establish(7);
        let other = table.establish(8);
        table.attach_handle(a, 1);
        let released = table.release_session(7);
        assert_eq!(released.len(), 2);
        assert!(!table.exists(a));
        assert!(!table.exists(b));
        assert!(table.exists(other));
    }

    #[test]
    fn cancel_raises_the_flag() {
        let table = ContextTable::new();
        let id = table.establish(1);
        let flag = table.cancel_flag(id).unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        table.cancel(id).unwrap();
        assert!(flag.load(Ordering::SeqCst));
        // Starting a fresh wait rearms the flag.
        assert!(!table.cancel_flag(id).unwrap().load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_of_unknown_context_fails() {
        let table = ContextTable::new();
        assert_eq!(
            table.cancel(0x1234).unwrap_err(),
            Status::SCARD_E_INVALID_HANDLE
        );
    }
}
