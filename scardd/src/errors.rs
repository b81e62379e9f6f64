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

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Result alias for every resource-manager operation. The error side is a
/// status code from the SCARD space; none of the core operations panic or
/// carry any richer error payload, mirroring the wire contract where a
/// single `rv` field travels back to the client.
pub type ScardResult<T> = Result<T, Status>;

// The status values are the public SCARD_* constants. The names are kept
// verbatim so the code reads against the PC/SC documentation.
#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum Status {
    SCARD_S_SUCCESS = 0x00000000,
    SCARD_F_INTERNAL_ERROR = 0x80100001,
    SCARD_E_CANCELLED = 0x80100002,
    SCARD_E_INVALID_HANDLE = 0x80100003,
    SCARD_E_INVALID_PARAMETER = 0x80100004,
    SCARD_E_INVALID_TARGET = 0x80100005,
    SCARD_E_NO_MEMORY = 0x80100006,
    SCARD_F_WAITED_TOO_LONG = 0x80100007,
    SCARD_E_INSUFFICIENT_BUFFER = 0x80100008,
    SCARD_E_UNKNOWN_READER = 0x80100009,
    SCARD_E_TIMEOUT = 0x8010000A,
    SCARD_E_SHARING_VIOLATION = 0x8010000B,
    SCARD_E_NO_SMARTCARD = 0x8010000C,
    SCARD_E_UNKNOWN_CARD = 0x8010000D,
    SCARD_E_CANT_DISPOSE = 0x8010000E,
    SCARD_E_PROTO_MISMATCH = 0x8010000F,
    SCARD_E_NOT_READY = 0x80100010,
    SCARD_E_INVALID_VALUE = 0x80100011,
    SCARD_E_SYSTEM_CANCELLED = 0x80100012,
    SCARD_F_COMM_ERROR = 0x80100013,
    SCARD_F_UNKNOWN_ERROR = 0x80100014,
    SCARD_E_INVALID_ATR = 0x80100015,
    SCARD_E_NOT_TRANSACTED = 0x80100016,
    SCARD_E_READER_UNAVAILABLE = 0x80100017,
    SCARD_P_SHUTDOWN = 0x80100018,
    SCARD_E_PCI_TOO_SMALL = 0x80100019,
    SCARD_E_READER_UNSUPPORTED = 0x8010001A,
    SCARD_E_DUPLICATE_READER = 0x8010001B,
    SCARD_E_CARD_UNSUPPORTED = 0x8010001C,
    SCARD_E_NO_SERVICE = 0x8010001D,
    SCARD_E_SERVICE_STOPPED = 0x8010001E,
    SCARD_E_UNEXPECTED = 0x8010001F,
    SCARD_E_UNSUPPORTED_FEATURE = 0x80100022,
    SCARD_E_NO_READERS_AVAILABLE = 0x8010002E,
    SCARD_W_UNSUPPORTED_CARD = 0x80100065,
    SCARD_W_UNRESPONSIVE_CARD = 0x80100066,
    SCARD_W_UNPOWERED_CARD = 0x80100067,
    SCARD_W_RESET_CARD = 0x80100068,
    SCARD_W_REMOVED_CARD = 0x80100069,
}

impl Status {
    /// The raw value carried in a response's `rv` field.
    pub fn rv(self) -> u32 {
        self.to_u32().unwrap()
    }

    pub fn from_rv(rv: u32) -> Self {
        Status::from_u32(rv).unwrap_or(Status::SCARD_F_UNKNOWN_ERROR)
    }
}

/// Collapses an operation result into the `rv` value sent on the wire.
pub fn rv_of<T>(res: &ScardResult<T>) -> u32 {
    match res {
        Ok(_) => Status::SCARD_S_SUCCESS.rv(),
        Err(status) => status.rv(),
    }
}

// Response codes produced by IFD handler drivers. The wrapper translates
// these into the SCARD space before anything else sees them.
#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
#[repr(i64)]
pub enum IfdCode {
    IFD_SUCCESS = 0,
    IFD_ERROR_TAG = 600,
    IFD_ERROR_SET_FAILURE = 601,
    IFD_ERROR_VALUE_READ_ONLY = 602,
    IFD_ERROR_PTS_FAILURE = 605,
    IFD_ERROR_NOT_SUPPORTED = 606,
    IFD_PROTOCOL_NOT_SUPPORTED = 607,
    IFD_ERROR_POWER_ACTION = 608,
    IFD_ERROR_SWALLOW = 609,
    IFD_ERROR_EJECT = 610,
    IFD_ERROR_CONFISCATE = 611,
    IFD_COMMUNICATION_ERROR = 612,
    IFD_RESPONSE_TIMEOUT = 613,
    IFD_NOT_SUPPORTED = 614,
    IFD_ICC_PRESENT = 615,
    IFD_ICC_NOT_PRESENT = 616,
    IFD_NO_SUCH_DEVICE = 617,
    IFD_ERROR_INSUFFICIENT_BUFFER = 618,
}

impl IfdCode {
    pub fn from_raw(raw: libc::c_long) -> Self {
        IfdCode::from_i64(raw as i64).unwrap_or(IfdCode::IFD_COMMUNICATION_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_rv() {
        for status in [
            Status::SCARD_S_SUCCESS,
            Status::SCARD_E_SHARING_VIOLATION,
            Status::SCARD_W_REMOVED_CARD,
        ] {
            assert_eq!(Status::from_rv(status.rv()), status);
        }
    }

    #[test]
    fn unknown_rv_maps_to_unknown_error() {
        assert_eq!(Status::from_rv(0xdeadbeef), Status::SCARD_F_UNKNOWN_ERROR);
    }

    #[test]
    fn ifd_code_from_raw() {
        assert_eq!(IfdCode::from_raw(616), IfdCode::IFD_ICC_NOT_PRESENT);
        assert_eq!(IfdCode::from_raw(-1), IfdCode::IFD_COMMUNICATION_ERROR);
    }
}
