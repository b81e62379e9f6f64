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

//! Per-slot event workers. Each worker polls its reader for card
//! presence, powers freshly inserted cards, publishes transitions to the
//! state table and delivers sticky removal events to open handles.

use crate::atr;
use crate::cards::EVENT_REMOVED;
use crate::ifd::{Presence, PowerAction};
use crate::readers::ReaderSlot;
use crate::state::{ReaderFlags, StateTable};
use crate::STATUS_POLL_INTERVAL;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What the worker believes about the slot between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    Unknown,
    Absent,
    Present,
}

pub fn spawn(slot: Arc<ReaderSlot>, state: Arc<StateTable>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("event {}", slot.name))
        .spawn(move || run(slot, state))
        .expect("spawning an event worker cannot fail")
}

fn run(slot: Arc<ReaderSlot>, state: Arc<StateTable>) {
    debug!("event worker for {} starting", slot.name);
    let mut current = CardState::Unknown;

    loop {
        if slot.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let observed = match slot.handler.icc_presence() {
            Presence::Present => CardState::Present,
            Presence::Absent => CardState::Absent,
            Presence::Unknown => CardState::Unknown,
        };

        if observed != current {
            match observed {
                CardState::Absent => on_removed(&slot, &state, current),
                CardState::Present => on_inserted(&slot, &state),
                CardState::Unknown => on_lost(&slot, &state),
            }
            current = observed;
        }

        if slot.shutdown.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(STATUS_POLL_INTERVAL);
    }
    debug!("event worker for {} exiting", slot.name);
}

fn on_removed(slot: &ReaderSlot, state: &StateTable, previous: CardState) {
    if previous != CardState::Unknown {
        info!("card removed from {}", slot.name);
        slot.mark_handles(EVENT_REMOVED);
    }
    state.update(slot.index, |row| {
        row.flags = ReaderFlags::ABSENT;
        row.atr.clear();
        row.protocol = 0;
    });
}

fn on_inserted(slot: &ReaderSlot, state: &StateTable) {
    // Give the contacts a moment to settle before powering.
    thread::sleep(Duration::from_millis(10));
    match slot.handler.power(PowerAction::Up) {
        Ok(card_atr) => {
            let protocol = atr::default_protocol(&card_atr).bits();
            info!("card inserted into {}, ATR {:02X?}", slot.name, card_atr);
            state.update(slot.index, |row| {
                row.flags =
                    ReaderFlags::PRESENT | ReaderFlags::POWERED | ReaderFlags::NEGOTIABLE;
                row.atr = card_atr.clone();
                row.protocol = protocol;
            });
        }
        Err(e) => {
            warn!("card in {} did not power up: {:?}", slot.name, e);
            state.update(slot.index, |row| {
                row.flags = ReaderFlags::PRESENT | ReaderFlags::SWALLOWED;
                row.atr.clear();
                row.protocol = 0;
            });
        }
    }
}

fn on_lost(slot: &ReaderSlot, state: &StateTable) {
    warn!("cannot poll {}", slot.name);
    state.update(slot.index, |row| {
        row.flags = ReaderFlags::UNKNOWN;
        row.atr.clear();
        row.protocol = 0;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::Protocols;
    use crate::ifd::fake::FakeDriver;
    use crate::readers::Registry;
    use crate::state::{ReaderStateBits, StateTable};
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn insertion_publishes_atr_and_protocol() {
        let registry = Registry::new(Arc::new(StateTable::new()));
        let (binding, card) = FakeDriver::new();
        registry
            .add_with_binding("Evt", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let state = registry.state().clone();

        wait_until(|| {
            state
                .find_by_name("Evt 0 0")
                .map(|row| row.event_bits().contains(ReaderStateBits::EMPTY))
                .unwrap_or(false)
        });

        card.insert_card(0, &[0x3B, 0x95, 0x13, 0x81, 0x01, 0x80, 0x73, 0xFF, 0x01, 0x00, 0x0B]);
        wait_until(|| {
            state
                .find_by_name("Evt 0 0")
                .map(|row| row.card_present())
                .unwrap_or(false)
        });
        let row = state.find_by_name("Evt 0 0").unwrap();
        assert_eq!(row.protocol, Protocols::T1.bits());
        assert_eq!(row.atr.len(), 11);

        registry.shutdown();
    }

    #[test]
    fn removal_clears_atr_and_bumps_counter() {
        let registry = Registry::new(Arc::new(StateTable::new()));
        let (binding, card) = FakeDriver::new();
        registry
            .add_with_binding("Evt", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let state = registry.state().clone();

        card.insert_card(0, &[0x3B, 0x00]);
        wait_until(|| {
            state
                .find_by_name("Evt 0 0")
                .map(|row| row.card_present())
                .unwrap_or(false)
        });
        let counter = state.find_by_name("Evt 0 0").unwrap().counter;

        card.remove_card(0);
        wait_until(|| {
            state
                .find_by_name("Evt 0 0")
                .map(|row| row.event_bits().contains(ReaderStateBits::EMPTY))
                .unwrap_or(false)
        });
        let row = state.find_by_name("Evt 0 0").unwrap();
        assert!(row.atr.is_empty());
        assert_eq!(row.protocol, 0);
        assert!(row.counter > counter);

        registry.shutdown();
    }

    #[test]
    fn swallowed_card_reports_mute() {
        let registry = Registry::new(Arc::new(StateTable::new()));
        let (binding, card) = FakeDriver::new();
        registry
            .add_with_binding("Evt", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let state = registry.state().clone();

        card.fail_power(0, true);
        card.insert_card(0, &[0x3B, 0x00]);
        wait_until(|| {
            state
                .find_by_name("Evt 0 0")
                .map(|row| row.event_bits().contains(ReaderStateBits::MUTE))
                .unwrap_or(false)
        });

        registry.shutdown();
    }
}
