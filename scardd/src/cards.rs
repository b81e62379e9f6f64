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

//! The card-handle manager: allocates opaque handles, enforces the
//! exclusive/shared/direct sharing disciplines and the recursive
//! transaction lock, and funnels transmit/control/status traffic through
//! the driver wrapper.

use crate::atr::{self, Protocols};
use crate::contexts::ContextTable;
use crate::errors::{ScardResult, Status};
use crate::ifd::{IoHeader, PowerAction};
use crate::readers::{ReaderSlot, Registry};
use crate::state::{ReaderFlags, StateTable};
use crate::{MAX_BUFFER_SIZE_EXTENDED, TRANSACTION_WAIT};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Sticky event bits on a handle. Set by the event engine (or a peer's
/// reset) and reported by every subsequent call until the client
/// reconnects or disconnects.
pub const EVENT_RESET: u32 = 0x01;
pub const EVENT_REMOVED: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShareMode {
    Exclusive = 1,
    Shared = 2,
    Direct = 3,
}

impl ShareMode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ShareMode::Exclusive),
            2 => Some(ShareMode::Shared),
            3 => Some(ShareMode::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Disposition {
    Leave = 0,
    Reset = 1,
    Unpower = 2,
    Eject = 3,
}

impl Disposition {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Disposition::Leave),
            1 => Some(Disposition::Reset),
            2 => Some(Disposition::Unpower),
            3 => Some(Disposition::Eject),
            _ => None,
        }
    }
}

pub struct CardHandle {
    pub id: u32,
    pub context: u32,
    pub slot: Arc<ReaderSlot>,
    pub mode: Mutex<ShareMode>,
    /// Active protocol bit; 0 for a direct connection with no protocol.
    pub protocol: Mutex<u32>,
    pub events: AtomicU32,
}

impl std::fmt::Debug for CardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardHandle")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("mode", &self.mode)
            .field("protocol", &self.protocol)
            .field("events", &self.events)
            .finish()
    }
}

impl CardHandle {
    fn sticky_status(&self) -> Option<Status> {
        let bits = self.events.load(Ordering::SeqCst);
        if bits & EVENT_REMOVED != 0 {
            Some(Status::SCARD_W_REMOVED_CARD)
        } else if bits & EVENT_RESET != 0 {
            Some(Status::SCARD_W_RESET_CARD)
        } else {
            None
        }
    }
}

pub struct CardService {
    registry: Arc<Registry>,
    state: Arc<StateTable>,
    contexts: Arc<ContextTable>,
    handles: RwLock<HashMap<u32, Arc<CardHandle>>>,
}

impl CardService {
    pub fn new(registry: Arc<Registry>, contexts: Arc<ContextTable>) -> Arc<Self> {
        let state = registry.state().clone();
        Arc::new(Self {
            registry,
            state,
            contexts,
            handles: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, id: u32) -> ScardResult<Arc<CardHandle>> {
        self.handles
            .read()
            .get(&id)
            .cloned()
            .ok_or(Status::SCARD_E_INVALID_HANDLE)
    }

    /// `SCardConnect`: binds a new handle to `reader_name` under the given
    /// sharing mode, negotiating one of `preferred` protocols.
    pub fn connect(
        &self,
        context: u32,
        reader_name: &str,
        mode: ShareMode,
        preferred: Protocols,
    ) -> ScardResult<(u32, u32)> {
        if !self.contexts.exists(context) {
            return Err(Status::SCARD_E_INVALID_HANDLE);
        }
        if preferred.is_empty() && mode != ShareMode::Direct {
            return Err(Status::SCARD_E_PROTO_MISMATCH);
        }
        let slot = self
            .registry
            .lookup(reader_name)
            .ok_or(Status::SCARD_E_UNKNOWN_READER)?;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }

        // Fail fast before touching the driver; the authoritative check
        // repeats under the lock at commit time.
        self.check_sharing(&slot, mode)?;

        let row = self
            .state
            .get(slot.index)
            .ok_or(Status::SCARD_E_READER_UNAVAILABLE)?;
        if mode != ShareMode::Direct && !row.card_present() {
            debug!("connect to {} without a card", reader_name);
            return Err(Status::SCARD_E_NO_SMARTCARD);
        }

        let protocol = self.select_protocol(&slot, mode, preferred)?;

        let handle = {
            let mut handles = self.handles.write();
            let mut conn = slot.conn.lock();
            match mode {
                ShareMode::Exclusive => {
                    if conn.sharing != 0 {
                        return Err(Status::SCARD_E_SHARING_VIOLATION);
                    }
                    conn.sharing = -1;
                }
                ShareMode::Shared | ShareMode::Direct => {
                    if conn.sharing < 0 {
                        return Err(Status::SCARD_E_SHARING_VIOLATION);
                    }
                    conn.sharing += 1;
                }
            }
            let sharing = conn.sharing;
            drop(conn);

            let id = loop {
                let id: u32 = rand::random();
                if id != 0 && !handles.contains_key(&id) {
                    break id;
                }
            };
            let handle = Arc::new(CardHandle {
                id,
                context,
                slot: slot.clone(),
                mode: Mutex::new(mode),
                protocol: Mutex::new(protocol),
                events: AtomicU32::new(0),
            });
            handles.insert(id, handle.clone());
            self.state.update(slot.index, |row| row.sharing = sharing);
            handle
        };

        slot.attach_handle(handle.clone());
        self.contexts.attach_handle(context, handle.id);
        debug!(
            "connect {:#x} to {} mode {:?} protocol {:#x}",
            handle.id, reader_name, mode, protocol
        );
        Ok((handle.id, protocol))
    }

    /// `SCardReconnect`: renegotiates sharing mode and protocol on an
    /// existing handle, optionally power-cycling or ejecting the card.
    pub fn reconnect(
        &self,
        id: u32,
        mode: ShareMode,
        preferred: Protocols,
        init: Disposition,
    ) -> ScardResult<u32> {
        let handle = self.get(id)?;
        let slot = handle.slot.clone();
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        self.check_transaction(&slot, id)?;

        match init {
            Disposition::Reset | Disposition::Unpower => {
                // A reset observed since the last call already left the
                // card freshly powered; don't cycle it twice.
                if handle.events.load(Ordering::SeqCst) & EVENT_RESET == 0 {
                    self.power_cycle(&slot);
                }
            }
            Disposition::Eject => self.eject(&slot),
            Disposition::Leave => {}
        }

        {
            let mut conn = slot.conn.lock();
            let old = *handle.mode.lock();
            match (old, mode) {
                (ShareMode::Exclusive, ShareMode::Exclusive) => {}
                (_, ShareMode::Exclusive) => {
                    // Upgrading requires being the only connection.
                    if conn.sharing != 1 {
                        return Err(Status::SCARD_E_SHARING_VIOLATION);
                    }
                    conn.sharing = -1;
                }
                (ShareMode::Exclusive, _) => conn.sharing = 1,
                _ => {}
            }
            *handle.mode.lock() = mode;
            let sharing = conn.sharing;
            drop(conn);
            self.state.update(slot.index, |row| row.sharing = sharing);
        }

        let row = self
            .state
            .get(slot.index)
            .ok_or(Status::SCARD_E_READER_UNAVAILABLE)?;
        if mode != ShareMode::Direct && !row.card_present() {
            return Err(Status::SCARD_E_NO_SMARTCARD);
        }

        let protocol = self.select_protocol(&slot, mode, preferred)?;
        *handle.protocol.lock() = protocol;
        // Reconnect acknowledges whatever event was pending.
        handle.events.store(0, Ordering::SeqCst);
        Ok(protocol)
    }

    /// `SCardDisconnect`: applies the disposition, releases the sharing
    /// claim and destroys the handle.
    pub fn disconnect(&self, id: u32, disposition: Disposition) -> ScardResult<()> {
        let handle = {
            let mut handles = self.handles.write();
            handles
                .remove(&id)
                .ok_or(Status::SCARD_E_INVALID_HANDLE)?
        };
        let slot = handle.slot.clone();

        {
            let mut conn = slot.conn.lock();
            if conn.lock_owner == id {
                conn.lock_owner = 0;
                conn.lock_depth = 0;
                slot.lock_cv.notify_all();
            }
        }

        let removed = handle.events.load(Ordering::SeqCst) & EVENT_REMOVED != 0;
        if !slot.defunct.load(Ordering::SeqCst) && !removed {
            match disposition {
                Disposition::Leave => {}
                Disposition::Reset => self.power_cycle(&slot),
                Disposition::Unpower => self.power_down(&slot),
                Disposition::Eject => self.eject(&slot),
            }
        }

        {
            let mut conn = slot.conn.lock();
            if *handle.mode.lock() == ShareMode::Exclusive {
                conn.sharing = 0;
            } else if conn.sharing > 0 {
                conn.sharing -= 1;
            }
            let sharing = conn.sharing;
            drop(conn);
            self.state.update(slot.index, |row| row.sharing = sharing);
        }

        slot.detach_handle(id);
        self.contexts.detach_handle(handle.context, id);
        debug!("handle {:#x} disconnected from {}", id, slot.name);
        Ok(())
    }

    /// `SCardBeginTransaction`: acquires (or re-enters) the per-slot
    /// transaction lock, waiting a bounded time for another holder.
    pub fn begin_transaction(&self, id: u32) -> ScardResult<()> {
        let handle = self.get(id)?;
        if let Some(event) = handle.sticky_status() {
            return Err(event);
        }
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }

        let mut conn = slot.conn.lock();
        if conn.lock_owner == id {
            conn.lock_depth += 1;
            return Ok(());
        }
        if conn.lock_owner != 0
            && slot
                .lock_cv
                .wait_for(&mut conn, TRANSACTION_WAIT)
                .timed_out()
            && conn.lock_owner != 0
        {
            return Err(Status::SCARD_E_SHARING_VIOLATION);
        }
        if conn.lock_owner != 0 {
            return Err(Status::SCARD_E_SHARING_VIOLATION);
        }
        conn.lock_owner = id;
        conn.lock_depth = 1;
        Ok(())
    }

    /// `SCardEndTransaction`: unwinds one level of the lock; on reaching
    /// depth zero releases it and applies the disposition.
    pub fn end_transaction(&self, id: u32, disposition: Disposition) -> ScardResult<()> {
        let handle = self.get(id)?;
        if let Some(event) = handle.sticky_status() {
            return Err(event);
        }
        let slot = handle.slot.clone();

        {
            let mut conn = slot.conn.lock();
            if conn.lock_owner != id {
                return Err(Status::SCARD_E_SHARING_VIOLATION);
            }
            conn.lock_depth -= 1;
            if conn.lock_depth > 0 {
                return Ok(());
            }
            conn.lock_owner = 0;
            slot.lock_cv.notify_all();
        }

        if !slot.defunct.load(Ordering::SeqCst) {
            match disposition {
                Disposition::Leave => {}
                Disposition::Reset => self.power_cycle(&slot),
                Disposition::Unpower => self.power_down(&slot),
                Disposition::Eject => self.eject(&slot),
            }
        }
        Ok(())
    }

    /// `SCardCancelTransaction` is historical; validating the handle is
    /// all the reference behavior amounts to.
    pub fn cancel_transaction(&self, id: u32) -> ScardResult<()> {
        self.get(id).map(|_| ())
    }

    /// `SCardTransmit`: forwards an APDU, enforcing protocol agreement,
    /// the driver's input ceiling and the transaction lock.
    pub fn transmit(
        &self,
        id: u32,
        send_pci: IoHeader,
        apdu: &[u8],
        recv_cap: usize,
    ) -> ScardResult<(IoHeader, Vec<u8>)> {
        let handle = self.get(id)?;
        if let Some(event) = handle.sticky_status() {
            return Err(event);
        }
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        if apdu.len() > MAX_BUFFER_SIZE_EXTENDED || apdu.len() > slot.max_input {
            return Err(Status::SCARD_E_INSUFFICIENT_BUFFER);
        }
        self.check_transaction(slot, id)?;

        let row = self
            .state
            .get(slot.index)
            .ok_or(Status::SCARD_E_READER_UNAVAILABLE)?;
        if !row.card_present() {
            return Err(Status::SCARD_W_REMOVED_CARD);
        }

        let active = *handle.protocol.lock();
        let requested = send_pci.protocol;
        let agreeable = requested == active
            || requested == Protocols::RAW.bits()
            || requested == Protocols::ANY.bits()
            || active == Protocols::RAW.bits();
        if active != 0 && !agreeable {
            return Err(Status::SCARD_E_PROTO_MISMATCH);
        }

        let cap = recv_cap.min(MAX_BUFFER_SIZE_EXTENDED);
        slot.handler.transmit(send_pci, apdu, cap)
    }

    /// `SCardControl`: forwards a reader ioctl unconditionally.
    pub fn control(
        &self,
        id: u32,
        code: u32,
        data: &[u8],
        recv_cap: usize,
    ) -> ScardResult<Vec<u8>> {
        let handle = self.get(id)?;
        if let Some(event) = handle.sticky_status() {
            return Err(event);
        }
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        if data.len() > MAX_BUFFER_SIZE_EXTENDED {
            return Err(Status::SCARD_E_INSUFFICIENT_BUFFER);
        }
        self.check_transaction(slot, id)?;
        slot.handler
            .control(code, data, recv_cap.min(MAX_BUFFER_SIZE_EXTENDED))
    }

    /// `SCardStatus`: a snapshot of the published state for the handle's
    /// reader.
    pub fn status(&self, id: u32) -> ScardResult<(String, u32, u32, Vec<u8>)> {
        let handle = self.get(id)?;
        if let Some(event) = handle.sticky_status() {
            return Err(event);
        }
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        let row = self
            .state
            .get(slot.index)
            .ok_or(Status::SCARD_E_READER_UNAVAILABLE)?;
        let protocol = *handle.protocol.lock();
        Ok((slot.name.clone(), row.flags.bits(), protocol, row.atr))
    }

    /// `SCardGetAttrib`: forwarded to the driver's capability query.
    pub fn get_attrib(&self, id: u32, tag: u32) -> ScardResult<Vec<u8>> {
        let handle = self.get(id)?;
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        slot.handler.get_capability(tag)
    }

    /// `SCardSetAttrib`: forwarded to the driver's capability setter.
    pub fn set_attrib(&self, id: u32, tag: u32, value: &[u8]) -> ScardResult<()> {
        let handle = self.get(id)?;
        let slot = &handle.slot;
        if slot.defunct.load(Ordering::SeqCst) {
            return Err(Status::SCARD_E_READER_UNAVAILABLE);
        }
        slot.handler.set_capability(tag, value)
    }

    /// Tears down every handle in `ids` as part of a context or session
    /// cascade: locks broken, sharing returned, card left alone.
    pub fn release_handles(&self, ids: &[u32]) {
        for &id in ids {
            if let Err(e) = self.disconnect(id, Disposition::Leave) {
                debug!("cascade disconnect of {:#x}: {:?}", id, e);
            }
        }
    }

    fn check_sharing(&self, slot: &ReaderSlot, mode: ShareMode) -> ScardResult<()> {
        let conn = slot.conn.lock();
        if conn.sharing < 0 {
            return Err(Status::SCARD_E_SHARING_VIOLATION);
        }
        if mode == ShareMode::Exclusive && conn.sharing != 0 {
            return Err(Status::SCARD_E_SHARING_VIOLATION);
        }
        Ok(())
    }

    fn check_transaction(&self, slot: &ReaderSlot, id: u32) -> ScardResult<()> {
        let conn = slot.conn.lock();
        if conn.lock_owner != 0 && conn.lock_owner != id {
            return Err(Status::SCARD_E_SHARING_VIOLATION);
        }
        Ok(())
    }

    /// Direct connections skip negotiation entirely; everything else runs
    /// protocol selection against the card.
    fn select_protocol(
        &self,
        slot: &Arc<ReaderSlot>,
        mode: ShareMode,
        preferred: Protocols,
    ) -> ScardResult<u32> {
        if mode == ShareMode::Direct {
            if preferred.contains(Protocols::RAW) {
                return Ok(Protocols::RAW.bits());
            }
            return Ok(0);
        }
        self.negotiate(slot, preferred)
    }

    /// Negotiates a protocol for the current card per the preference mask.
    fn negotiate(&self, slot: &Arc<ReaderSlot>, preferred: Protocols) -> ScardResult<u32> {
        if preferred.contains(Protocols::RAW) {
            return Ok(Protocols::RAW.bits());
        }
        let row = self
            .state
            .get(slot.index)
            .ok_or(Status::SCARD_E_READER_UNAVAILABLE)?;
        let current = row.protocol;
        if current != 0 && preferred.bits() & current != 0 {
            return Ok(current);
        }
        let available = atr::available_protocols(&row.atr);
        let target = [Protocols::T0, Protocols::T1]
            .into_iter()
            .find(|p| preferred.contains(*p) && available.contains(*p))
            .ok_or(Status::SCARD_E_PROTO_MISMATCH)?;
        match slot.handler.set_protocol_parameters(target.bits()) {
            Ok(()) => {
                self.state
                    .update(slot.index, |row| row.protocol = target.bits());
                Ok(target.bits())
            }
            // Drivers without PTS stay on the post-reset default.
            Err(Status::SCARD_E_UNSUPPORTED_FEATURE) if current != 0 => Ok(current),
            Err(_) => Err(Status::SCARD_E_PROTO_MISMATCH),
        }
    }

    /// Resets the card and publishes the outcome; peers see the sticky
    /// reset bit.
    fn power_cycle(&self, slot: &Arc<ReaderSlot>) {
        let outcome = slot.handler.power(PowerAction::Reset);
        slot.mark_handles(EVENT_RESET);
        match outcome {
            Ok(card_atr) => {
                let protocol = atr::default_protocol(&card_atr).bits();
                self.state.update(slot.index, |row| {
                    row.flags =
                        ReaderFlags::PRESENT | ReaderFlags::POWERED | ReaderFlags::NEGOTIABLE;
                    row.atr = card_atr.clone();
                    row.protocol = protocol;
                });
            }
            Err(e) => {
                warn!("reset on {} failed: {:?}", slot.name, e);
                self.state.update(slot.index, |row| {
                    row.flags = ReaderFlags::PRESENT | ReaderFlags::SWALLOWED;
                    row.atr.clear();
                    row.protocol = 0;
                });
            }
        }
    }

    fn power_down(&self, slot: &Arc<ReaderSlot>) {
        if let Err(e) = slot.handler.power(PowerAction::Down) {
            warn!("power down on {} failed: {:?}", slot.name, e);
        }
        slot.mark_handles(EVENT_RESET);
        self.state.update(slot.index, |row| {
            row.flags = ReaderFlags::PRESENT;
            row.atr.clear();
            row.protocol = 0;
        });
    }

    /// Issues the CTBCS eject sequence through the control channel.
    /// Failures are logged and ignored.
    fn eject(&self, slot: &Arc<ReaderSlot>) {
        let apdu = [0x20, 0x15, slot.slot as u8 + 1, 0x00, 0x00];
        if let Err(e) = slot.handler.control(0, &apdu, 2) {
            info!("eject on {} not honored: {:?}", slot.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifd::fake::{FakeDriver, FakeHandle};
    use std::time::{Duration, Instant};

    fn service() -> (Arc<CardService>, Arc<ContextTable>, FakeHandle, Arc<Registry>) {
        let registry = Registry::new(Arc::new(StateTable::new()));
        let (binding, card) = FakeDriver::new();
        registry
            .add_with_binding("Test", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        let contexts = ContextTable::new();
        let service = CardService::new(registry.clone(), contexts.clone());
        (service, contexts, card, registry)
    }

    fn wait_for_card(service: &CardService, present: bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let row = service.state.find_by_name("Test 0 0").unwrap();
            if row.card_present() == present {
                return;
            }
            assert!(Instant::now() < deadline, "card state never settled");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn connect_negotiates_t0_and_disconnect_restores_sharing() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);

        let ctx = contexts.establish(1);
        let (handle, protocol) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        assert_eq!(protocol, Protocols::T0.bits());
        assert_eq!(
            service.state.find_by_name("Test 0 0").unwrap().sharing,
            1
        );

        service.disconnect(handle, Disposition::Leave).unwrap();
        assert_eq!(
            service.state.find_by_name("Test 0 0").unwrap().sharing,
            0
        );
        registry.shutdown();
    }

    #[test]
    fn unknown_reader_is_rejected() {
        let (service, contexts, _card, registry) = service();
        let ctx = contexts.establish(1);
        assert_eq!(
            service
                .connect(ctx, "nope", ShareMode::Shared, Protocols::T0)
                .unwrap_err(),
            Status::SCARD_E_UNKNOWN_READER
        );
        registry.shutdown();
    }

    #[test]
    fn connect_without_card_requires_direct_mode() {
        let (service, contexts, _card, registry) = service();
        wait_for_card(&service, false);
        let ctx = contexts.establish(1);
        assert_eq!(
            service
                .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::ANY)
                .unwrap_err(),
            Status::SCARD_E_NO_SMARTCARD
        );
        let (handle, protocol) = service
            .connect(ctx, "Test 0 0", ShareMode::Direct, Protocols::empty())
            .unwrap();
        assert_eq!(protocol, 0);
        service.disconnect(handle, Disposition::Leave).unwrap();
        registry.shutdown();
    }

    #[test]
    fn exclusive_holder_blocks_shared_connect() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);

        let ctx_a = contexts.establish(1);
        let ctx_b = contexts.establish(2);
        let (h1, _) = service
            .connect(ctx_a, "Test 0 0", ShareMode::Exclusive, Protocols::T0)
            .unwrap();
        assert!(service.state.find_by_name("Test 0 0").unwrap().sharing < 0);
        assert_eq!(
            service
                .connect(ctx_b, "Test 0 0", ShareMode::Shared, Protocols::T0)
                .unwrap_err(),
            Status::SCARD_E_SHARING_VIOLATION
        );
        service.disconnect(h1, Disposition::Leave).unwrap();
        let (h2, _) = service
            .connect(ctx_b, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        service.disconnect(h2, Disposition::Leave).unwrap();
        registry.shutdown();
    }

    #[test]
    fn shared_holder_blocks_exclusive_connect() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (h1, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        assert_eq!(
            service
                .connect(ctx, "Test 0 0", ShareMode::Exclusive, Protocols::T0)
                .unwrap_err(),
            Status::SCARD_E_SHARING_VIOLATION
        );
        service.disconnect(h1, Disposition::Leave).unwrap();
        registry.shutdown();
    }

    #[test]
    fn preferred_protocol_not_offered_by_card() {
        let (service, contexts, card, registry) = service();
        // ATR offering only T=1.
        card.insert_card(
            0,
            &[0x3B, 0x95, 0x13, 0x81, 0x01, 0x80, 0x73, 0xFF, 0x01, 0x00, 0x0B],
        );
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        assert_eq!(
            service
                .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
                .unwrap_err(),
            Status::SCARD_E_PROTO_MISMATCH
        );
        registry.shutdown();
    }

    #[test]
    fn transmit_forwards_apdu_and_reply() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();

        let apdu = [0x00, 0xA4, 0x00, 0x00, 0x02, 0x3F, 0x00];
        let (pci, reply) = service
            .transmit(
                handle,
                IoHeader::new(Protocols::T0.bits()),
                &apdu,
                crate::MAX_BUFFER_SIZE,
            )
            .unwrap();
        assert_eq!(pci.protocol, Protocols::T0.bits());
        assert_eq!(reply, vec![0x90, 0x00]);
        assert_eq!(card.transmitted(), vec![apdu.to_vec()]);
        registry.shutdown();
    }

    #[test]
    fn transmit_with_wrong_protocol_is_a_mismatch() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        assert_eq!(
            service
                .transmit(
                    handle,
                    IoHeader::new(Protocols::T1.bits()),
                    &[0x00, 0xB0, 0x00, 0x00],
                    64,
                )
                .unwrap_err(),
            Status::SCARD_E_PROTO_MISMATCH
        );
        registry.shutdown();
    }

    #[test]
    fn oversized_apdu_is_refused_before_the_driver() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        let oversized = vec![0u8; MAX_BUFFER_SIZE_EXTENDED + 1];
        assert_eq!(
            service
                .transmit(handle, IoHeader::new(Protocols::T0.bits()), &oversized, 64)
                .unwrap_err(),
            Status::SCARD_E_INSUFFICIENT_BUFFER
        );
        assert!(card.transmitted().is_empty());
        registry.shutdown();
    }

    #[test]
    fn transaction_recursion_balances_out() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();

        service.begin_transaction(handle).unwrap();
        service.begin_transaction(handle).unwrap();
        service
            .transmit(
                handle,
                IoHeader::new(Protocols::T0.bits()),
                &[0x00, 0xB0, 0x00, 0x00],
                64,
            )
            .unwrap();
        service.end_transaction(handle, Disposition::Leave).unwrap();
        service.end_transaction(handle, Disposition::Leave).unwrap();

        let slot = service.get(handle).unwrap().slot.clone();
        assert_eq!(slot.conn.lock().lock_depth, 0);
        assert_eq!(slot.conn.lock().lock_owner, 0);
        assert_eq!(service.state.find_by_name("Test 0 0").unwrap().sharing, 1);
        registry.shutdown();
    }

    #[test]
    fn transaction_lock_excludes_other_handles() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (h1, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        let (h2, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();

        service.begin_transaction(h1).unwrap();
        assert_eq!(
            service.begin_transaction(h2).unwrap_err(),
            Status::SCARD_E_SHARING_VIOLATION
        );
        assert_eq!(
            service
                .transmit(
                    h2,
                    IoHeader::new(Protocols::T0.bits()),
                    &[0x00, 0xB0, 0x00, 0x00],
                    64,
                )
                .unwrap_err(),
            Status::SCARD_E_SHARING_VIOLATION
        );
        service.end_transaction(h1, Disposition::Leave).unwrap();
        service.begin_transaction(h2).unwrap();
        service.end_transaction(h2, Disposition::Leave).unwrap();
        registry.shutdown();
    }

    #[test]
    fn end_transaction_requires_the_holder() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        assert_eq!(
            service
                .end_transaction(handle, Disposition::Leave)
                .unwrap_err(),
            Status::SCARD_E_SHARING_VIOLATION
        );
        registry.shutdown();
    }

    #[test]
    fn removal_is_sticky_until_reconnect() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();

        card.remove_card(0);
        wait_for_card(&service, false);
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);

        // Sticky across calls until acknowledged by reconnect.
        for _ in 0..2 {
            assert_eq!(
                service
                    .transmit(
                        handle,
                        IoHeader::new(Protocols::T0.bits()),
                        &[0x00, 0xB0, 0x00, 0x00],
                        64,
                    )
                    .unwrap_err(),
                Status::SCARD_W_REMOVED_CARD
            );
        }
        service
            .reconnect(handle, ShareMode::Shared, Protocols::T0, Disposition::Reset)
            .unwrap();
        service
            .transmit(
                handle,
                IoHeader::new(Protocols::T0.bits()),
                &[0x00, 0xB0, 0x00, 0x00],
                64,
            )
            .unwrap();
        registry.shutdown();
    }

    #[test]
    fn peer_reset_is_sticky_on_other_handles() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (h1, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        let (h2, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();

        service
            .reconnect(h1, ShareMode::Shared, Protocols::T0, Disposition::Reset)
            .unwrap();
        assert_eq!(
            service.status(h2).unwrap_err(),
            Status::SCARD_W_RESET_CARD
        );
        service
            .reconnect(h2, ShareMode::Shared, Protocols::T0, Disposition::Leave)
            .unwrap();
        assert!(service.status(h2).is_ok());
        registry.shutdown();
    }

    #[test]
    fn eject_sends_the_ctbcs_sequence() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        service.disconnect(handle, Disposition::Eject).unwrap();
        let controlled = card.controlled();
        assert_eq!(controlled.len(), 1);
        assert_eq!(controlled[0].1, vec![0x20, 0x15, 0x01, 0x00, 0x00]);
        registry.shutdown();
    }

    #[test]
    fn status_reports_name_protocol_and_atr() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (handle, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        let (name, state_bits, protocol, card_atr) = service.status(handle).unwrap();
        assert_eq!(name, "Test 0 0");
        assert_ne!(state_bits & ReaderFlags::PRESENT.bits(), 0);
        assert_eq!(protocol, Protocols::T0.bits());
        assert_eq!(card_atr, vec![0x3B, 0x00]);
        registry.shutdown();
    }

    #[test]
    fn release_handles_breaks_locks_and_sharing() {
        let (service, contexts, card, registry) = service();
        card.insert_card(0, &[0x3B, 0x00]);
        wait_for_card(&service, true);
        let ctx = contexts.establish(1);
        let (h1, _) = service
            .connect(ctx, "Test 0 0", ShareMode::Shared, Protocols::T0)
            .unwrap();
        service.begin_transaction(h1).unwrap();

        service.release_handles(&[h1]);
        assert_eq!(service.state.find_by_name("Test 0 0").unwrap().sharing, 0);
        assert_eq!(
            service.get(h1).unwrap_err(),
            Status::SCARD_E_INVALID_HANDLE
        );
        registry.shutdown();
    }
}
