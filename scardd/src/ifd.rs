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

//! The IFD handler wrapper: a uniform, serialized call surface over the
//! driver ABI generations. Drivers are shared objects exporting one of
//! three entry-point families, probed at load time:
//!
//! - v3: `IFDHCreateChannelByName` plus the full `IFDH*` set and the
//!   ioctl-style `IFDHControl`,
//! - v2: `IFDHCreateChannel` and the `IFDH*` set with the older two-buffer
//!   `IFDHControl`,
//! - v1 (legacy): `IO_Create_Channel` and the `IFD_*` set, accepted with
//!   reduced functionality (no control, slot selected via a capability tag
//!   before every call).
//!
//! Every call for a given slot is serialized on that slot's mutex. Unless
//! the driver advertises `TAG_IFD_SIMULTANEOUS_ACCESS > 1`, all slots of
//! one module share a single mutex.

use crate::atr::Atr;
use crate::errors::{IfdCode, ScardResult, Status};
use crate::{MAX_ATR_SIZE, MAX_BUFFER_SIZE};
use libloading::os::unix::Symbol as RawSymbol;
use libloading::Library;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

pub const TAG_IFD_ATR: u32 = 0x0303;
pub const TAG_IFD_SLOTNUM: u32 = 0x0180;
pub const TAG_IFD_SLOTS_NUMBER: u32 = 0x0FAE;
pub const TAG_IFD_SIMULTANEOUS_ACCESS: u32 = 0x0FAF;
/// Largest APDU the driver accepts, as a vendor attribute.
pub const SCARD_ATTR_MAXINPUT: u32 = 0x0007_A007;

/// Fallback when the driver does not report `SCARD_ATTR_MAXINPUT`: a short
/// APDU (5 header + 255 data + Le).
pub const DEFAULT_MAX_INPUT: usize = 261;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PowerAction {
    Up = 500,
    Down = 501,
    Reset = 502,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// The driver failed to answer the presence query.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfdVersion {
    V1,
    V2,
    V3,
}

/// PCI header accompanying a transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHeader {
    pub protocol: u32,
    pub length: u32,
}

impl IoHeader {
    pub fn new(protocol: u32) -> Self {
        Self {
            protocol,
            length: 8,
        }
    }
}

type Dword = libc::c_ulong;
type RawCode = libc::c_long;

/// `SCARD_IO_HEADER` as the driver ABI sees it (two unsigned longs).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawIoHeader {
    protocol: Dword,
    length: Dword,
}

impl From<IoHeader> for RawIoHeader {
    fn from(h: IoHeader) -> Self {
        Self {
            protocol: h.protocol as Dword,
            length: h.length as Dword,
        }
    }
}

impl From<RawIoHeader> for IoHeader {
    fn from(h: RawIoHeader) -> Self {
        Self {
            protocol: h.protocol as u32,
            length: h.length as u32,
        }
    }
}

/// The normalized driver surface. One implementation per ABI generation,
/// selected by symbol probing; the test suite provides an in-process fake.
///
/// Buffer parameters follow the ABI convention: the caller presizes the
/// vector to its capacity and the callee truncates it to the returned
/// length.
pub trait DriverBinding: Send + Sync {
    fn version(&self) -> IfdVersion;
    fn create_channel(&self, slot: u32, channel: u32) -> IfdCode;
    fn create_channel_by_name(&self, slot: u32, device: &str) -> IfdCode;
    fn close_channel(&self, slot: u32) -> IfdCode;
    fn get_capabilities(&self, slot: u32, tag: u32, value: &mut Vec<u8>) -> IfdCode;
    fn set_capabilities(&self, slot: u32, tag: u32, value: &[u8]) -> IfdCode;
    fn set_protocol_parameters(
        &self,
        slot: u32,
        protocol: u32,
        flags: u8,
        pts1: u8,
        pts2: u8,
        pts3: u8,
    ) -> IfdCode;
    fn power_icc(&self, slot: u32, action: PowerAction, atr: &mut Vec<u8>) -> IfdCode;
    fn transmit(
        &self,
        slot: u32,
        send_pci: IoHeader,
        tx: &[u8],
        rx: &mut Vec<u8>,
    ) -> (IfdCode, IoHeader);
    fn control(&self, slot: u32, code: u32, tx: &[u8], rx: &mut Vec<u8>) -> IfdCode;
    fn icc_presence(&self, slot: u32) -> IfdCode;
}

#[derive(Debug)]
pub enum DriverLoadError {
    Open(String, libloading::Error),
    /// Neither `IFDHCreateChannelByName`, `IFDHCreateChannel` nor
    /// `IO_Create_Channel` is exported.
    NoEntryPoint(String),
    MissingSymbol(String, &'static str),
}

impl fmt::Display for DriverLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverLoadError::Open(path, err) => write!(f, "cannot load {}: {}", path, err),
            DriverLoadError::NoEntryPoint(path) => {
                write!(f, "{} exports no known IFD handler entry point", path)
            }
            DriverLoadError::MissingSymbol(path, sym) => {
                write!(f, "{} is missing required symbol {}", path, sym)
            }
        }
    }
}

type CreateChannelFn = unsafe extern "C" fn(Dword, Dword) -> RawCode;
type CreateChannelByNameFn = unsafe extern "C" fn(Dword, *const libc::c_char) -> RawCode;
type CloseChannelFn = unsafe extern "C" fn(Dword) -> RawCode;
type GetCapabilitiesFn = unsafe extern "C" fn(Dword, Dword, *mut Dword, *mut u8) -> RawCode;
type SetCapabilitiesFn = unsafe extern "C" fn(Dword, Dword, Dword, *const u8) -> RawCode;
type SetProtocolFn = unsafe extern "C" fn(Dword, Dword, u8, u8, u8, u8) -> RawCode;
type PowerIccFn = unsafe extern "C" fn(Dword, Dword, *mut u8, *mut Dword) -> RawCode;
type TransmitFn = unsafe extern "C" fn(
    Dword,
    RawIoHeader,
    *const u8,
    Dword,
    *mut u8,
    *mut Dword,
    *mut RawIoHeader,
) -> RawCode;
type PresenceFn = unsafe extern "C" fn(Dword) -> RawCode;
type ControlV2Fn = unsafe extern "C" fn(Dword, *const u8, Dword, *mut u8, *mut Dword) -> RawCode;
type ControlV3Fn = unsafe extern "C" fn(
    Dword,
    Dword,
    *const libc::c_void,
    Dword,
    *mut libc::c_void,
    Dword,
    *mut Dword,
) -> RawCode;

type V1CreateChannelFn = unsafe extern "C" fn(Dword) -> RawCode;
type V1CloseChannelFn = unsafe extern "C" fn() -> RawCode;
type V1GetCapabilitiesFn = unsafe extern "C" fn(Dword, *mut u8) -> RawCode;
type V1SetCapabilitiesFn = unsafe extern "C" fn(Dword, *const u8) -> RawCode;
type V1SetProtocolFn = unsafe extern "C" fn(Dword, u8, u8, u8, u8) -> RawCode;
type V1PowerFn = unsafe extern "C" fn(Dword) -> RawCode;
type V1TransmitFn = unsafe extern "C" fn(
    RawIoHeader,
    *const u8,
    Dword,
    *mut u8,
    *mut Dword,
    *mut RawIoHeader,
) -> RawCode;
type V1PresenceFn = unsafe extern "C" fn() -> RawCode;

macro_rules! bind {
    ($lib:expr, $path:expr, $name:literal) => {
        unsafe {
            match $lib.get($name) {
                Ok(sym) => libloading::Symbol::into_raw(sym),
                Err(_) => {
                    return Err(DriverLoadError::MissingSymbol(
                        $path.to_string(),
                        std::str::from_utf8($name).unwrap(),
                    ))
                }
            }
        }
    };
}

/// Probes the shared object at `path` and binds the matching ABI
/// generation.
pub fn load_driver(path: &str) -> Result<Box<dyn DriverBinding>, DriverLoadError> {
    let lib = unsafe { Library::new(path) }
        .map_err(|e| DriverLoadError::Open(path.to_string(), e))?;

    let has = |name: &[u8]| unsafe { lib.get::<*const ()>(name).is_ok() };

    if has(b"IFDHCreateChannelByName\0") {
        debug!("{}: IFD handler v3", path);
        Ok(Box::new(V3Binding {
            create: bind!(lib, path, b"IFDHCreateChannel\0"),
            create_by_name: bind!(lib, path, b"IFDHCreateChannelByName\0"),
            close: bind!(lib, path, b"IFDHCloseChannel\0"),
            get_caps: bind!(lib, path, b"IFDHGetCapabilities\0"),
            set_caps: bind!(lib, path, b"IFDHSetCapabilities\0"),
            set_protocol: bind!(lib, path, b"IFDHSetProtocolParameters\0"),
            power: bind!(lib, path, b"IFDHPowerICC\0"),
            transmit: bind!(lib, path, b"IFDHTransmitToICC\0"),
            control: bind!(lib, path, b"IFDHControl\0"),
            presence: bind!(lib, path, b"IFDHICCPresence\0"),
            _lib: lib,
        }))
    } else if has(b"IFDHCreateChannel\0") {
        debug!("{}: IFD handler v2", path);
        Ok(Box::new(V2Binding {
            create: bind!(lib, path, b"IFDHCreateChannel\0"),
            close: bind!(lib, path, b"IFDHCloseChannel\0"),
            get_caps: bind!(lib, path, b"IFDHGetCapabilities\0"),
            set_caps: bind!(lib, path, b"IFDHSetCapabilities\0"),
            set_protocol: bind!(lib, path, b"IFDHSetProtocolParameters\0"),
            power: bind!(lib, path, b"IFDHPowerICC\0"),
            transmit: bind!(lib, path, b"IFDHTransmitToICC\0"),
            control: bind!(lib, path, b"IFDHControl\0"),
            presence: bind!(lib, path, b"IFDHICCPresence\0"),
            _lib: lib,
        }))
    } else if has(b"IO_Create_Channel\0") {
        warn!("{}: legacy v1 IFD handler, reduced functionality", path);
        Ok(Box::new(V1Binding {
            create: bind!(lib, path, b"IO_Create_Channel\0"),
            close: bind!(lib, path, b"IO_Close_Channel\0"),
            get_caps: bind!(lib, path, b"IFD_Get_Capabilities\0"),
            set_caps: bind!(lib, path, b"IFD_Set_Capabilities\0"),
            set_protocol: bind!(lib, path, b"IFD_Set_Protocol_Parameters\0"),
            power: bind!(lib, path, b"IFD_Power_ICC\0"),
            transmit: bind!(lib, path, b"IFD_Transmit_to_ICC\0"),
            presence: bind!(lib, path, b"IFD_Is_ICC_Present\0"),
            _lib: lib,
        }))
    } else {
        Err(DriverLoadError::NoEntryPoint(path.to_string()))
    }
}

struct V3Binding {
    create: RawSymbol<CreateChannelFn>,
    create_by_name: RawSymbol<CreateChannelByNameFn>,
    close: RawSymbol<CloseChannelFn>,
    get_caps: RawSymbol<GetCapabilitiesFn>,
    set_caps: RawSymbol<SetCapabilitiesFn>,
    set_protocol: RawSymbol<SetProtocolFn>,
    power: RawSymbol<PowerIccFn>,
    transmit: RawSymbol<TransmitFn>,
    control: RawSymbol<ControlV3Fn>,
    presence: RawSymbol<PresenceFn>,
    _lib: Library,
}

struct V2Binding {
    create: RawSymbol<CreateChannelFn>,
    close: RawSymbol<CloseChannelFn>,
    get_caps: RawSymbol<GetCapabilitiesFn>,
    set_caps: RawSymbol<SetCapabilitiesFn>,
    set_protocol: RawSymbol<SetProtocolFn>,
    power: RawSymbol<PowerIccFn>,
    transmit: RawSymbol<TransmitFn>,
    control: RawSymbol<ControlV2Fn>,
    presence: RawSymbol<PresenceFn>,
    _lib: Library,
}

struct V1Binding {
    create: RawSymbol<V1CreateChannelFn>,
    close: RawSymbol<V1CloseChannelFn>,
    get_caps: RawSymbol<V1GetCapabilitiesFn>,
    set_caps: RawSymbol<V1SetCapabilitiesFn>,
    set_protocol: RawSymbol<V1SetProtocolFn>,
    power: RawSymbol<V1PowerFn>,
    transmit: RawSymbol<V1TransmitFn>,
    presence: RawSymbol<V1PresenceFn>,
    _lib: Library,
}

unsafe impl Send for V3Binding {}
unsafe impl Sync for V3Binding {}
unsafe impl Send for V2Binding {}
unsafe impl Sync for V2Binding {}
unsafe impl Send for V1Binding {}
unsafe impl Sync for V1Binding {}

fn modern_get_capabilities(
    f: &RawSymbol<GetCapabilitiesFn>,
    slot: u32,
    tag: u32,
    value: &mut Vec<u8>,
) -> IfdCode {
    let mut len = value.len() as Dword;
    let rc = unsafe { (**f)(slot as Dword, tag as Dword, &mut len, value.as_mut_ptr()) };
    let code = IfdCode::from_raw(rc);
    if code == IfdCode::IFD_SUCCESS {
        value.truncate(len as usize);
    } else {
        value.clear();
    }
    code
}

impl DriverBinding for V3Binding {
    fn version(&self) -> IfdVersion {
        IfdVersion::V3
    }

    fn create_channel(&self, slot: u32, channel: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.create)(slot as Dword, channel as Dword) })
    }

    fn create_channel_by_name(&self, slot: u32, device: &str) -> IfdCode {
        let device = match CString::new(device) {
            Ok(s) => s,
            Err(_) => return IfdCode::IFD_COMMUNICATION_ERROR,
        };
        IfdCode::from_raw(unsafe { (*self.create_by_name)(slot as Dword, device.as_ptr()) })
    }

    fn close_channel(&self, slot: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.close)(slot as Dword) })
    }

    fn get_capabilities(&self, slot: u32, tag: u32, value: &mut Vec<u8>) -> IfdCode {
        modern_get_capabilities(&self.get_caps, slot, tag, value)
    }

    fn set_capabilities(&self, slot: u32, tag: u32, value: &[u8]) -> IfdCode {
        IfdCode::from_raw(unsafe {
            (*self.set_caps)(
                slot as Dword,
                tag as Dword,
                value.len() as Dword,
                value.as_ptr(),
            )
        })
    }

    fn set_protocol_parameters(
        &self,
        slot: u32,
        protocol: u32,
        flags: u8,
        pts1: u8,
        pts2: u8,
        pts3: u8,
    ) -> IfdCode {
        IfdCode::from_raw(unsafe {
            (*self.set_protocol)(slot as Dword, protocol as Dword, flags, pts1, pts2, pts3)
        })
    }

    fn power_icc(&self, slot: u32, action: PowerAction, atr: &mut Vec<u8>) -> IfdCode {
        let mut len = atr.len() as Dword;
        let rc = unsafe {
            (*self.power)(slot as Dword, action as u32 as Dword, atr.as_mut_ptr(), &mut len)
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            atr.truncate(len as usize);
        } else {
            atr.clear();
        }
        code
    }

    fn transmit(
        &self,
        slot: u32,
        send_pci: IoHeader,
        tx: &[u8],
        rx: &mut Vec<u8>,
    ) -> (IfdCode, IoHeader) {
        let mut rx_len = rx.len() as Dword;
        let mut recv_pci = RawIoHeader::from(IoHeader::new(send_pci.protocol));
        let rc = unsafe {
            (*self.transmit)(
                slot as Dword,
                send_pci.into(),
                tx.as_ptr(),
                tx.len() as Dword,
                rx.as_mut_ptr(),
                &mut rx_len,
                &mut recv_pci,
            )
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            rx.truncate(rx_len as usize);
        } else {
            rx.clear();
        }
        (code, recv_pci.into())
    }

    fn control(&self, slot: u32, code: u32, tx: &[u8], rx: &mut Vec<u8>) -> IfdCode {
        let mut rx_len: Dword = 0;
        let rc = unsafe {
            (*self.control)(
                slot as Dword,
                code as Dword,
                tx.as_ptr() as *const libc::c_void,
                tx.len() as Dword,
                rx.as_mut_ptr() as *mut libc::c_void,
                rx.len() as Dword,
                &mut rx_len,
            )
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            rx.truncate(rx_len as usize);
        } else {
            rx.clear();
        }
        code
    }

    fn icc_presence(&self, slot: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.presence)(slot as Dword) })
    }
}

impl DriverBinding for V2Binding {
    fn version(&self) -> IfdVersion {
        IfdVersion::V2
    }

    fn create_channel(&self, slot: u32, channel: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.create)(slot as Dword, channel as Dword) })
    }

    fn create_channel_by_name(&self, _slot: u32, _device: &str) -> IfdCode {
        IfdCode::IFD_NOT_SUPPORTED
    }

    fn close_channel(&self, slot: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.close)(slot as Dword) })
    }

    fn get_capabilities(&self, slot: u32, tag: u32, value: &mut Vec<u8>) -> IfdCode {
        modern_get_capabilities(&self.get_caps, slot, tag, value)
    }

    fn set_capabilities(&self, slot: u32, tag: u32, value: &[u8]) -> IfdCode {
        IfdCode::from_raw(unsafe {
            (*self.set_caps)(
                slot as Dword,
                tag as Dword,
                value.len() as Dword,
                value.as_ptr(),
            )
        })
    }

    fn set_protocol_parameters(
        &self,
        slot: u32,
        protocol: u32,
        flags: u8,
        pts1: u8,
        pts2: u8,
        pts3: u8,
    ) -> IfdCode {
        IfdCode::from_raw(unsafe {
            (*self.set_protocol)(slot as Dword, protocol as Dword, flags, pts1, pts2, pts3)
        })
    }

    fn power_icc(&self, slot: u32, action: PowerAction, atr: &mut Vec<u8>) -> IfdCode {
        let mut len = atr.len() as Dword;
        let rc = unsafe {
            (*self.power)(slot as Dword, action as u32 as Dword, atr.as_mut_ptr(), &mut len)
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            atr.truncate(len as usize);
        } else {
            atr.clear();
        }
        code
    }

    fn transmit(
        &self,
        slot: u32,
        send_pci: IoHeader,
        tx: &[u8],
        rx: &mut Vec<u8>,
    ) -> (IfdCode, IoHeader) {
        let mut rx_len = rx.len() as Dword;
        let mut recv_pci = RawIoHeader::from(IoHeader::new(send_pci.protocol));
        let rc = unsafe {
            (*self.transmit)(
                slot as Dword,
                send_pci.into(),
                tx.as_ptr(),
                tx.len() as Dword,
                rx.as_mut_ptr(),
                &mut rx_len,
                &mut recv_pci,
            )
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            rx.truncate(rx_len as usize);
        } else {
            rx.clear();
        }
        (code, recv_pci.into())
    }

    fn control(&self, slot: u32, _code: u32, tx: &[u8], rx: &mut Vec<u8>) -> IfdCode {
        // The v2 control entry has no ioctl code parameter.
        let mut rx_len = rx.len() as Dword;
        let rc = unsafe {
            (*self.control)(
                slot as Dword,
                tx.as_ptr(),
                tx.len() as Dword,
                rx.as_mut_ptr(),
                &mut rx_len,
            )
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            rx.truncate(rx_len as usize);
        } else {
            rx.clear();
        }
        code
    }

    fn icc_presence(&self, slot: u32) -> IfdCode {
        IfdCode::from_raw(unsafe { (*self.presence)(slot as Dword) })
    }
}

impl V1Binding {
    /// v1 drivers address a single implicit slot; the active one is
    /// selected through the SLOTNUM capability before each call.
    fn select_slot(&self, slot: u32) {
        let value = [slot as u8];
        unsafe {
            (*self.set_caps)(TAG_IFD_SLOTNUM as Dword, value.as_ptr());
        }
    }
}

impl DriverBinding for V1Binding {
    fn version(&self) -> IfdVersion {
        IfdVersion::V1
    }

    fn create_channel(&self, slot: u32, channel: u32) -> IfdCode {
        self.select_slot(slot);
        IfdCode::from_raw(unsafe { (*self.create)(channel as Dword) })
    }

    fn create_channel_by_name(&self, _slot: u32, _device: &str) -> IfdCode {
        IfdCode::IFD_NOT_SUPPORTED
    }

    fn close_channel(&self, slot: u32) -> IfdCode {
        self.select_slot(slot);
        IfdCode::from_raw(unsafe { (*self.close)() })
    }

    fn get_capabilities(&self, slot: u32, tag: u32, value: &mut Vec<u8>) -> IfdCode {
        self.select_slot(slot);
        let rc = unsafe { (*self.get_caps)(tag as Dword, value.as_mut_ptr()) };
        IfdCode::from_raw(rc)
    }

    fn set_capabilities(&self, slot: u32, tag: u32, value: &[u8]) -> IfdCode {
        self.select_slot(slot);
        IfdCode::from_raw(unsafe { (*self.set_caps)(tag as Dword, value.as_ptr()) })
    }

    fn set_protocol_parameters(
        &self,
        slot: u32,
        protocol: u32,
        flags: u8,
        pts1: u8,
        pts2: u8,
        pts3: u8,
    ) -> IfdCode {
        self.select_slot(slot);
        IfdCode::from_raw(unsafe {
            (*self.set_protocol)(protocol as Dword, flags, pts1, pts2, pts3)
        })
    }

    fn power_icc(&self, slot: u32, action: PowerAction, atr: &mut Vec<u8>) -> IfdCode {
        self.select_slot(slot);
        let rc = IfdCode::from_raw(unsafe { (*self.power)(action as u32 as Dword) });
        if rc != IfdCode::IFD_SUCCESS || action == PowerAction::Down {
            atr.clear();
            return rc;
        }
        // v1 power does not hand the ATR back; fetch it via the ATR tag.
        // Drivers fill the whole buffer, so the decoder determines the
        // real length.
        atr.resize(MAX_ATR_SIZE, 0);
        let fetch = unsafe { (*self.get_caps)(TAG_IFD_ATR as Dword, atr.as_mut_ptr()) };
        if IfdCode::from_raw(fetch) != IfdCode::IFD_SUCCESS {
            atr.clear();
            return rc;
        }
        match Atr::decode(atr) {
            Ok(decoded) => atr.truncate(decoded.len()),
            Err(_) => atr.clear(),
        }
        rc
    }

    fn transmit(
        &self,
        slot: u32,
        send_pci: IoHeader,
        tx: &[u8],
        rx: &mut Vec<u8>,
    ) -> (IfdCode, IoHeader) {
        self.select_slot(slot);
        let mut rx_len = rx.len() as Dword;
        let mut recv_pci = RawIoHeader::from(IoHeader::new(send_pci.protocol));
        let rc = unsafe {
            (*self.transmit)(
                send_pci.into(),
                tx.as_ptr(),
                tx.len() as Dword,
                rx.as_mut_ptr(),
                &mut rx_len,
                &mut recv_pci,
            )
        };
        let code = IfdCode::from_raw(rc);
        if code == IfdCode::IFD_SUCCESS {
            rx.truncate(rx_len as usize);
        } else {
            rx.clear();
        }
        (code, recv_pci.into())
    }

    fn control(&self, _slot: u32, _code: u32, _tx: &[u8], rx: &mut Vec<u8>) -> IfdCode {
        rx.clear();
        IfdCode::IFD_NOT_SUPPORTED
    }

    fn icc_presence(&self, slot: u32) -> IfdCode {
        self.select_slot(slot);
        IfdCode::from_raw(unsafe { (*self.presence)() })
    }
}

/// One loaded driver shared object, shared by every slot it backs.
pub struct DriverModule {
    pub library: String,
    binding: Box<dyn DriverBinding>,
}

impl DriverModule {
    pub fn new(library: String, binding: Box<dyn DriverBinding>) -> Arc<Self> {
        Arc::new(Self { library, binding })
    }

    pub fn version(&self) -> IfdVersion {
        self.binding.version()
    }

    /// Number of slots the driver exposes, from `TAG_IFD_SLOTS_NUMBER`;
    /// defaults to one.
    pub fn slot_count(&self) -> usize {
        let mut value = vec![0u8; 1];
        match self
            .binding
            .get_capabilities(0, TAG_IFD_SLOTS_NUMBER, &mut value)
        {
            IfdCode::IFD_SUCCESS if !value.is_empty() && value[0] > 0 => value[0] as usize,
            _ => 1,
        }
    }

    /// Whether slots of this module may be driven concurrently
    /// (`TAG_IFD_SIMULTANEOUS_ACCESS > 1`).
    pub fn simultaneous_access(&self) -> bool {
        let mut value = vec![0u8; 1];
        matches!(
            self.binding
                .get_capabilities(0, TAG_IFD_SIMULTANEOUS_ACCESS, &mut value),
            IfdCode::IFD_SUCCESS
        ) && !value.is_empty()
            && value[0] > 1
    }
}

/// The per-slot serialized facade every core operation funnels through.
/// Holds the slot's driver mutex; nothing else may call the driver.
pub struct IfdHandler {
    module: Arc<DriverModule>,
    slot: u32,
    lock: Arc<Mutex<()>>,
}

impl IfdHandler {
    pub fn new(module: Arc<DriverModule>, slot: u32, lock: Arc<Mutex<()>>) -> Self {
        Self { module, slot, lock }
    }

    pub fn version(&self) -> IfdVersion {
        self.module.version()
    }

    pub fn module(&self) -> &Arc<DriverModule> {
        &self.module
    }

    pub fn open_channel(&self, channel: u32, device: &str) -> ScardResult<()> {
        let _guard = self.lock.lock();
        let code = if self.module.version() == IfdVersion::V3 && !device.is_empty() {
            self.module
                .binding
                .create_channel_by_name(self.slot, device)
        } else {
            self.module.binding.create_channel(self.slot, channel)
        };
        match code {
            IfdCode::IFD_SUCCESS => Ok(()),
            code => {
                warn!(
                    "open channel {:#x} on {} slot {} failed: {:?}",
                    channel, self.module.library, self.slot, code
                );
                Err(Status::SCARD_E_INVALID_TARGET)
            }
        }
    }

    pub fn close_channel(&self) -> ScardResult<()> {
        let _guard = self.lock.lock();
        match self.module.binding.close_channel(self.slot) {
            IfdCode::IFD_SUCCESS => Ok(()),
            _ => Err(Status::SCARD_E_INVALID_TARGET),
        }
    }

    pub fn get_capability(&self, tag: u32) -> ScardResult<Vec<u8>> {
        let _guard = self.lock.lock();
        let mut value = vec![0u8; MAX_BUFFER_SIZE];
        match self
            .module
            .binding
            .get_capabilities(self.slot, tag, &mut value)
        {
            IfdCode::IFD_SUCCESS => Ok(value),
            IfdCode::IFD_ERROR_TAG => Err(Status::SCARD_E_UNSUPPORTED_FEATURE),
            IfdCode::IFD_ERROR_INSUFFICIENT_BUFFER => Err(Status::SCARD_E_INSUFFICIENT_BUFFER),
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    pub fn set_capability(&self, tag: u32, value: &[u8]) -> ScardResult<()> {
        let _guard = self.lock.lock();
        match self
            .module
            .binding
            .set_capabilities(self.slot, tag, value)
        {
            IfdCode::IFD_SUCCESS => Ok(()),
            IfdCode::IFD_ERROR_TAG => Err(Status::SCARD_E_UNSUPPORTED_FEATURE),
            IfdCode::IFD_ERROR_VALUE_READ_ONLY => Err(Status::SCARD_E_UNSUPPORTED_FEATURE),
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    /// Runs protocol type selection. `protocol` is a single protocol bit.
    pub fn set_protocol_parameters(&self, protocol: u32) -> ScardResult<()> {
        let _guard = self.lock.lock();
        match self
            .module
            .binding
            .set_protocol_parameters(self.slot, protocol, 0, 0, 0, 0)
        {
            IfdCode::IFD_SUCCESS => Ok(()),
            IfdCode::IFD_ERROR_PTS_FAILURE | IfdCode::IFD_PROTOCOL_NOT_SUPPORTED => {
                Err(Status::SCARD_E_PROTO_MISMATCH)
            }
            IfdCode::IFD_NOT_SUPPORTED | IfdCode::IFD_ERROR_NOT_SUPPORTED => {
                Err(Status::SCARD_E_UNSUPPORTED_FEATURE)
            }
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    /// Powers the card up, down or through a reset. Returns the ATR for
    /// up/reset, an empty vector for down.
    pub fn power(&self, action: PowerAction) -> ScardResult<Vec<u8>> {
        let _guard = self.lock.lock();
        let mut atr = vec![0u8; MAX_ATR_SIZE];
        match self.module.binding.power_icc(self.slot, action, &mut atr) {
            IfdCode::IFD_SUCCESS => Ok(atr),
            IfdCode::IFD_ERROR_POWER_ACTION => Err(Status::SCARD_W_UNRESPONSIVE_CARD),
            IfdCode::IFD_ICC_NOT_PRESENT => Err(Status::SCARD_W_REMOVED_CARD),
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    pub fn transmit(
        &self,
        send_pci: IoHeader,
        apdu: &[u8],
        response_cap: usize,
    ) -> ScardResult<(IoHeader, Vec<u8>)> {
        let _guard = self.lock.lock();
        let mut rx = vec![0u8; response_cap];
        let (code, recv_pci) = self
            .module
            .binding
            .transmit(self.slot, send_pci, apdu, &mut rx);
        match code {
            IfdCode::IFD_SUCCESS => Ok((recv_pci, rx)),
            IfdCode::IFD_ICC_NOT_PRESENT => Err(Status::SCARD_W_REMOVED_CARD),
            IfdCode::IFD_RESPONSE_TIMEOUT => Err(Status::SCARD_E_TIMEOUT),
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    pub fn control(&self, code: u32, data: &[u8], response_cap: usize) -> ScardResult<Vec<u8>> {
        let _guard = self.lock.lock();
        let mut rx = vec![0u8; response_cap];
        match self.module.binding.control(self.slot, code, data, &mut rx) {
            IfdCode::IFD_SUCCESS => Ok(rx),
            IfdCode::IFD_NOT_SUPPORTED | IfdCode::IFD_ERROR_NOT_SUPPORTED => {
                Err(Status::SCARD_E_UNSUPPORTED_FEATURE)
            }
            _ => Err(Status::SCARD_E_NOT_TRANSACTED),
        }
    }

    pub fn icc_presence(&self) -> Presence {
        let _guard = self.lock.lock();
        match self.module.binding.icc_presence(self.slot) {
            IfdCode::IFD_SUCCESS | IfdCode::IFD_ICC_PRESENT => Presence::Present,
            IfdCode::IFD_ICC_NOT_PRESENT => Presence::Absent,
            code => {
                trace!(
                    "presence poll failed on {} slot {}: {:?}",
                    self.module.library,
                    self.slot,
                    code
                );
                Presence::Unknown
            }
        }
    }

    /// The driver's APDU input ceiling.
    pub fn max_input(&self) -> usize {
        match self.get_capability(SCARD_ATTR_MAXINPUT) {
            Ok(value) if value.len() >= 4 => {
                u32::from_ne_bytes([value[0], value[1], value[2], value[3]]) as usize
            }
            _ => DEFAULT_MAX_INPUT,
        }
    }
}

pub mod fake {
    //! An in-process stand-in for a reader driver, backing the test suite
    //! the way the reference implementation's fake driver library does.
    //! The [`FakeHandle`] half stays with the test and scripts card
    //! insertion, removal and canned APDU responses.

    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    struct SlotScript {
        present: bool,
        atr: Vec<u8>,
        reply: Vec<u8>,
        fail_power: bool,
    }

    impl Default for SlotScript {
        fn default() -> Self {
            Self {
                present: false,
                atr: vec![0x3B, 0x00],
                reply: vec![0x90, 0x00],
                fail_power: false,
            }
        }
    }

    #[derive(Default)]
    struct FakeState {
        slots: HashMap<u32, SlotScript>,
        slot_count: u8,
        simultaneous: u8,
        transmitted: Vec<Vec<u8>>,
        controlled: Vec<(u32, Vec<u8>)>,
    }

    pub struct FakeDriver {
        state: Arc<Mutex<FakeState>>,
    }

    /// Scripting handle kept by tests while the driver itself is owned by
    /// the registry.
    #[derive(Clone)]
    pub struct FakeHandle {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeDriver {
        pub fn new() -> (Box<dyn DriverBinding>, FakeHandle) {
            Self::with_slots(1)
        }

        pub fn with_slots(slot_count: u8) -> (Box<dyn DriverBinding>, FakeHandle) {
            let state = Arc::new(Mutex::new(FakeState {
                slot_count,
                simultaneous: 1,
                ..Default::default()
            }));
            (
                Box::new(FakeDriver {
                    state: state.clone(),
                }),
                FakeHandle { state },
            )
        }
    }

    impl FakeHandle {
        pub fn insert_card(&self, slot: u32, atr: &[u8]) {
            let mut state = self.state.lock();
            let script = state.slots.entry(slot).or_default();
            script.present = true;
            script.atr = atr.to_vec();
        }

        pub fn remove_card(&self, slot: u32) {
            self.state.lock().slots.entry(slot).or_default().present = false;
        }

        pub fn set_reply(&self, slot: u32, reply: &[u8]) {
            self.state.lock().slots.entry(slot).or_default().reply = reply.to_vec();
        }

        pub fn fail_power(&self, slot: u32, fail: bool) {
            self.state.lock().slots.entry(slot).or_default().fail_power = fail;
        }

        pub fn transmitted(&self) -> Vec<Vec<u8>> {
            self.state.lock().transmitted.clone()
        }

        pub fn controlled(&self) -> Vec<(u32, Vec<u8>)> {
            self.state.lock().controlled.clone()
        }
    }

    impl DriverBinding for FakeDriver {
        fn version(&self) -> IfdVersion {
            IfdVersion::V3
        }

        fn create_channel(&self, slot: u32, _channel: u32) -> IfdCode {
            self.state.lock().slots.entry(slot).or_default();
            IfdCode::IFD_SUCCESS
        }

        fn create_channel_by_name(&self, slot: u32, _device: &str) -> IfdCode {
            self.create_channel(slot, 0)
        }

        fn close_channel(&self, _slot: u32) -> IfdCode {
            IfdCode::IFD_SUCCESS
        }

        fn get_capabilities(&self, _slot: u32, tag: u32, value: &mut Vec<u8>) -> IfdCode {
            let state = self.state.lock();
            match tag {
                TAG_IFD_SLOTS_NUMBER => {
                    value.clear();
                    value.push(state.slot_count);
                    IfdCode::IFD_SUCCESS
                }
                TAG_IFD_SIMULTANEOUS_ACCESS => {
                    value.clear();
                    value.push(state.simultaneous);
                    IfdCode::IFD_SUCCESS
                }
                SCARD_ATTR_MAXINPUT => {
                    value.clear();
                    value.extend_from_slice(&(DEFAULT_MAX_INPUT as u32).to_ne_bytes());
                    IfdCode::IFD_SUCCESS
                }
                _ => IfdCode::IFD_ERROR_TAG,
            }
        }

        fn set_capabilities(&self, _slot: u32, _tag: u32, _value: &[u8]) -> IfdCode {
            IfdCode::IFD_SUCCESS
        }

        fn set_protocol_parameters(
            &self,
            _slot: u32,
            _protocol: u32,
            _flags: u8,
            _pts1: u8,
            _pts2: u8,
            _pts3: u8,
        ) -> IfdCode {
            IfdCode::IFD_SUCCESS
        }

        fn power_icc(&self, slot: u32, action: PowerAction, atr: &mut Vec<u8>) -> IfdCode {
            let state = self.state.lock();
            let script = match state.slots.get(&slot) {
                Some(script) => script,
                None => return IfdCode::IFD_COMMUNICATION_ERROR,
            };
            if !script.present {
                atr.clear();
                return IfdCode::IFD_ICC_NOT_PRESENT;
            }
            if script.fail_power {
                atr.clear();
                return IfdCode::IFD_ERROR_POWER_ACTION;
            }
            match action {
                PowerAction::Down => atr.clear(),
                PowerAction::Up | PowerAction::Reset => {
                    atr.clear();
                    atr.extend_from_slice(&script.atr);
                }
            }
            IfdCode::IFD_SUCCESS
        }

        fn transmit(
            &self,
            slot: u32,
            send_pci: IoHeader,
            tx: &[u8],
            rx: &mut Vec<u8>,
        ) -> (IfdCode, IoHeader) {
            let mut state = self.state.lock();
            let script = match state.slots.get(&slot) {
                Some(script) => script.clone(),
                None => return (IfdCode::IFD_COMMUNICATION_ERROR, IoHeader::new(0)),
            };
            if !script.present {
                rx.clear();
                return (IfdCode::IFD_ICC_NOT_PRESENT, IoHeader::new(0));
            }
            state.transmitted.push(tx.to_vec());
            rx.clear();
            rx.extend_from_slice(&script.reply);
            (IfdCode::IFD_SUCCESS, IoHeader::new(send_pci.protocol))
        }

        fn control(&self, _slot: u32, code: u32, tx: &[u8], rx: &mut Vec<u8>) -> IfdCode {
            self.state.lock().controlled.push((code, tx.to_vec()));
            rx.clear();
            IfdCode::IFD_SUCCESS
        }

        fn icc_presence(&self, slot: u32) -> IfdCode {
            match self.state.lock().slots.get(&slot) {
                Some(script) if script.present => IfdCode::IFD_ICC_PRESENT,
                Some(_) => IfdCode::IFD_ICC_NOT_PRESENT,
                None => IfdCode::IFD_ICC_NOT_PRESENT,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeDriver;
    use super::*;

    fn handler() -> (IfdHandler, fake::FakeHandle) {
        let (binding, handle) = FakeDriver::new();
        let module = DriverModule::new("fake".to_string(), binding);
        let lock = Arc::new(Mutex::new(()));
        let handler = IfdHandler::new(module, 0, lock);
        handler.open_channel(0, "").unwrap();
        (handler, handle)
    }

    #[test]
    fn presence_follows_card_state() {
        let (handler, handle) = handler();
        assert_eq!(handler.icc_presence(), Presence::Absent);
        handle.insert_card(0, &[0x3B, 0x00]);
        assert_eq!(handler.icc_presence(), Presence::Present);
        handle.remove_card(0);
        assert_eq!(handler.icc_presence(), Presence::Absent);
    }

    #[test]
    fn power_up_returns_atr() {
        let (handler, handle) = handler();
        handle.insert_card(0, &[0x3B, 0x90, 0x11, 0x00]);
        let atr = handler.power(PowerAction::Up).unwrap();
        assert_eq!(atr, vec![0x3B, 0x90, 0x11, 0x00]);
    }

    #[test]
    fn power_failure_maps_to_unresponsive() {
        let (handler, handle) = handler();
        handle.insert_card(0, &[0x3B, 0x00]);
        handle.fail_power(0, true);
        assert_eq!(
            handler.power(PowerAction::Up).unwrap_err(),
            Status::SCARD_W_UNRESPONSIVE_CARD
        );
    }

    #[test]
    fn transmit_round_trip() {
        let (handler, handle) = handler();
        handle.insert_card(0, &[0x3B, 0x00]);
        handle.set_reply(0, &[0x6A, 0x82]);
        let (pci, rx) = handler
            .transmit(IoHeader::new(1), &[0x00, 0xA4, 0x04, 0x00], 256)
            .unwrap();
        assert_eq!(pci.protocol, 1);
        assert_eq!(rx, vec![0x6A, 0x82]);
        assert_eq!(handle.transmitted(), vec![vec![0x00, 0xA4, 0x04, 0x00]]);
    }

    #[test]
    fn transmit_without_card_reports_removal() {
        let (handler, _handle) = handler();
        assert_eq!(
            handler
                .transmit(IoHeader::new(1), &[0x00, 0xB0, 0x00, 0x00], 256)
                .unwrap_err(),
            Status::SCARD_W_REMOVED_CARD
        );
    }

    #[test]
    fn unknown_capability_tag_is_unsupported() {
        let (handler, _handle) = handler();
        assert_eq!(
            handler.get_capability(0x1234).unwrap_err(),
            Status::SCARD_E_UNSUPPORTED_FEATURE
        );
    }

    #[test]
    fn max_input_comes_from_the_driver() {
        let (handler, _handle) = handler();
        assert_eq!(handler.max_input(), DEFAULT_MAX_INPUT);
    }

    #[test]
    fn module_reports_slot_count() {
        let (binding, _handle) = FakeDriver::with_slots(2);
        let module = DriverModule::new("fake".to_string(), binding);
        assert_eq!(module.slot_count(), 2);
        assert!(!module.simultaneous_access());
    }
}
