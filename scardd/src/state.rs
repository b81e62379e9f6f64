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

//! The read-mostly reader state table every client observes. Event workers
//! write rows under the table's write lock; dispatchers read snapshots
//! under the read lock. Any observable change bumps the row's monotonic
//! counter and wakes everything blocked on the change notifier.

use crate::MAX_READERS;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

bitflags! {
    /// Internal slot status bits maintained by the event worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReaderFlags: u32 {
        const UNKNOWN = 0x0001;
        const ABSENT = 0x0002;
        const PRESENT = 0x0004;
        const SWALLOWED = 0x0008;
        const POWERED = 0x0010;
        const NEGOTIABLE = 0x0020;
        const SPECIFIC = 0x0040;
    }
}

bitflags! {
    /// Reader-state bits as returned to clients in `event_state`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReaderStateBits: u32 {
        const UNAWARE = 0x0000;
        const IGNORE = 0x0001;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const UNAVAILABLE = 0x0008;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
        const ATRMATCH = 0x0040;
        const EXCLUSIVE = 0x0080;
        const INUSE = 0x0100;
        const MUTE = 0x0200;
        const UNPOWERED = 0x0400;
    }
}

/// One published row: what clients learn about a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    pub name: String,
    pub flags: ReaderFlags,
    /// Strictly monotonic; ticks on every observable change of this row.
    pub counter: u32,
    /// 0 = free, n > 0 = shared by n handles, negative = held exclusively.
    pub sharing: i32,
    /// Currently negotiated protocol bit, 0 when none.
    pub protocol: u32,
    pub atr: Vec<u8>,
}

impl ReaderState {
    pub fn new(name: String) -> Self {
        Self {
            name,
            flags: ReaderFlags::UNKNOWN,
            counter: 0,
            sharing: 0,
            protocol: 0,
            atr: Vec::new(),
        }
    }

    pub fn card_present(&self) -> bool {
        self.flags.contains(ReaderFlags::PRESENT)
    }

    /// Derives the client-visible state mask (without CHANGED, which is
    /// relative to what the client already knows).
    pub fn event_bits(&self) -> ReaderStateBits {
        let mut bits = ReaderStateBits::UNAWARE;
        if self.flags.contains(ReaderFlags::UNKNOWN) {
            bits |= ReaderStateBits::UNAVAILABLE;
        }
        if self.flags.contains(ReaderFlags::ABSENT) {
            bits |= ReaderStateBits::EMPTY;
        }
        if self.flags.contains(ReaderFlags::PRESENT) {
            bits |= ReaderStateBits::PRESENT;
            if self.flags.contains(ReaderFlags::SWALLOWED) {
                bits |= ReaderStateBits::MUTE;
            } else if !self.flags.contains(ReaderFlags::POWERED) {
                bits |= ReaderStateBits::UNPOWERED;
            }
            if self.sharing > 0 {
                bits |= ReaderStateBits::INUSE;
            }
        }
        if self.sharing < 0 {
            bits |= ReaderStateBits::EXCLUSIVE;
        }
        bits
    }
}

/// Outcome of a blocking wait for a state change.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The generation advanced; carries the newly observed generation.
    Changed(u64),
    Timeout,
    Cancelled,
}

type WaitCallback = Box<dyn FnOnce(u32) + Send>;

pub struct StateTable {
    rows: RwLock<Vec<Option<ReaderState>>>,
    generation: Mutex<u64>,
    cond: Condvar,
    /// Sessions parked in CMD_WAIT_READER_STATE_CHANGE, keyed by session
    /// id. Completed with SCARD_S_SUCCESS on the next change, or with
    /// SCARD_E_TIMEOUT when the session stops waiting.
    waiters: Mutex<HashMap<u64, WaitCallback>>,
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTable {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new((0..MAX_READERS).map(|_| None).collect()),
            generation: Mutex::new(0),
            cond: Condvar::new(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Claims a free row and publishes the initial state. Returns the row
    /// index, or None when the table is full.
    pub fn publish(&self, state: ReaderState) -> Option<usize> {
        let mut rows = self.rows.write();
        let index = rows.iter().position(|row| row.is_none())?;
        rows[index] = Some(state);
        drop(rows);
        self.signal();
        Some(index)
    }

    /// Applies a mutation to a row, ticking its counter and waking
    /// observers. The closure runs under the write lock; keep it short.
    pub fn update<F: FnOnce(&mut ReaderState)>(&self, index: usize, f: F) {
        {
            let mut rows = self.rows.write();
            let row = match rows.get_mut(index).and_then(Option::as_mut) {
                Some(row) => row,
                None => return,
            };
            f(row);
            row.counter = row.counter.wrapping_add(1);
        }
        self.signal();
    }

    pub fn clear(&self, index: usize) {
        self.rows.write()[index] = None;
        self.signal();
    }

    pub fn get(&self, index: usize) -> Option<ReaderState> {
        self.rows.read().get(index).and_then(Clone::clone)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ReaderState> {
        self.rows
            .read()
            .iter()
            .flatten()
            .find(|row| row.name == name)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Option<ReaderState>> {
        self.rows.read().clone()
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.rows
            .read()
            .iter()
            .flatten()
            .map(|row| row.name.clone())
            .collect()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wakes all blocked waits without publishing a change. Used by
    /// cancellation and shutdown.
    pub fn kick(&self) {
        let _gen = self.generation.lock();
        self.cond.notify_all();
    }

    /// Blocks until the generation advances past `seen`, the deadline
    /// passes, or the cancellation flag is raised.
    pub fn wait(
        &self,
        seen: u64,
        deadline: Option<Instant>,
        cancelled: &AtomicBool,
    ) -> WaitOutcome {
        let mut gen = self.generation.lock();
        loop {
            if *gen != seen {
                return WaitOutcome::Changed(*gen);
            }
            if cancelled.load(Ordering::SeqCst) {
                return WaitOutcome::Cancelled;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.cond.wait_until(&mut gen, deadline).timed_out()
                    {
                        // Give a raised flag or a late change precedence
                        // over the timeout.
                        if *gen != seen {
                            return WaitOutcome::Changed(*gen);
                        }
                        if cancelled.load(Ordering::SeqCst) {
                            return WaitOutcome::Cancelled;
                        }
                        return WaitOutcome::Timeout;
                    }
                }
                None => {
                    // Bounded slices so a raised cancellation flag is
                    // noticed even if the kick raced the wait.
                    self.cond
                        .wait_for(&mut gen, Duration::from_millis(500));
                }
            }
        }
    }

    /// Registers an asynchronous state-change waiter for a session.
    /// Returns false when the session already has one pending.
    pub fn add_waiter(&self, session: u64, complete: WaitCallback) -> bool {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&session) {
            return false;
        }
        waiters.insert(session, complete);
        true
    }

    pub fn take_waiter(&self, session: u64) -> Option<WaitCallback> {
        self.waiters.lock().remove(&session)
    }

    fn signal(&self) {
        {
            let mut gen = self.generation.lock();
            *gen += 1;
            self.cond.notify_all();
        }
        let drained: Vec<WaitCallback> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().map(|(_, cb)| cb).collect()
        };
        for complete in drained {
            complete(crate::errors::Status::SCARD_S_SUCCESS.rv());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn publish_and_update_tick_the_counter() {
        let table = StateTable::new();
        let index = table.publish(ReaderState::new("R 0 0".to_string())).unwrap();
        let before = table.get(index).unwrap().counter;
        table.update(index, |row| {
            row.flags = ReaderFlags::PRESENT | ReaderFlags::POWERED;
        });
        table.update(index, |row| row.sharing = 1);
        let after = table.get(index).unwrap();
        assert_eq!(after.counter, before + 2);
    }

    #[test]
    fn table_capacity_is_bounded() {
        let table = StateTable::new();
        for i in 0..MAX_READERS {
            assert!(table
                .publish(ReaderState::new(format!("reader {}", i)))
                .is_some());
        }
        assert!(table.publish(ReaderState::new("overflow".to_string())).is_none());
    }

    #[test]
    fn cleared_rows_are_reused() {
        let table = StateTable::new();
        let index = table.publish(ReaderState::new("a".to_string())).unwrap();
        table.clear(index);
        assert_eq!(table.publish(ReaderState::new("b".to_string())), Some(index));
    }

    #[test]
    fn event_bits_for_empty_reader() {
        let state = ReaderState {
            flags: ReaderFlags::ABSENT,
            ..ReaderState::new("r".to_string())
        };
        assert_eq!(state.event_bits(), ReaderStateBits::EMPTY);
    }

    #[test]
    fn event_bits_for_present_shared_card() {
        let state = ReaderState {
            flags: ReaderFlags::PRESENT | ReaderFlags::POWERED | ReaderFlags::NEGOTIABLE,
            sharing: 2,
            ..ReaderState::new("r".to_string())
        };
        assert_eq!(
            state.event_bits(),
            ReaderStateBits::PRESENT | ReaderStateBits::INUSE
        );
    }

    #[test]
    fn event_bits_for_exclusive_holder() {
        let state = ReaderState {
            flags: ReaderFlags::PRESENT | ReaderFlags::POWERED,
            sharing: -1,
            ..ReaderState::new("r".to_string())
        };
        assert!(state.event_bits().contains(ReaderStateBits::EXCLUSIVE));
        assert!(!state.event_bits().contains(ReaderStateBits::INUSE));
    }

    #[test]
    fn event_bits_for_mute_card() {
        let state = ReaderState {
            flags: ReaderFlags::PRESENT | ReaderFlags::SWALLOWED,
            ..ReaderState::new("r".to_string())
        };
        assert!(state.event_bits().contains(ReaderStateBits::MUTE));
    }

    #[test]
    fn wait_returns_on_change() {
        let table = Arc::new(StateTable::new());
        let index = table.publish(ReaderState::new("r".to_string())).unwrap();
        let gen = table.generation();
        let cancelled = AtomicBool::new(false);

        let waiter = {
            let updater_table = table.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                updater_table.update(index, |row| row.flags = ReaderFlags::PRESENT);
            });
            table.wait(
                gen,
                Some(Instant::now() + Duration::from_secs(5)),
                &cancelled,
            )
        };
        assert!(matches!(waiter, WaitOutcome::Changed(_)));
    }

    #[test]
    fn wait_honors_timeout() {
        let table = StateTable::new();
        let cancelled = AtomicBool::new(false);
        let outcome = table.wait(
            table.generation(),
            Some(Instant::now() + Duration::from_millis(10)),
            &cancelled,
        );
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn wait_observes_cancellation() {
        let table = Arc::new(StateTable::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let gen = table.generation();
        {
            let table = table.clone();
            let cancelled = cancelled.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cancelled.store(true, Ordering::SeqCst);
                table.kick();
            });
        }
        let outcome = table.wait(
            gen,
            Some(Instant::now() + Duration::from_secs(5)),
            cancelled.as_ref(),
        );
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[test]
    fn waiters_drain_on_change() {
        let table = Arc::new(StateTable::new());
        let index = table.publish(ReaderState::new("r".to_string())).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        {
            let seen = seen.clone();
            assert!(table.add_waiter(7, Box::new(move |rv| seen.store(rv, Ordering::SeqCst))));
        }
        // A second registration for the same session is refused.
        assert!(!table.add_waiter(7, Box::new(|_| {})));
        table.update(index, |row| row.sharing = 1);
        assert_eq!(
            seen.load(Ordering::SeqCst),
            crate::errors::Status::SCARD_S_SUCCESS.rv()
        );
        assert!(table.take_waiter(7).is_none());
    }
}
