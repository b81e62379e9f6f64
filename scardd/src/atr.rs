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

//! Answer-To-Reset decoding per ISO 7816-3. The decoder walks the
//! TA/TB/TC/TD interface character groups, derives the protocols the card
//! offers and the one it boots into, and captures the historical bytes.

use crate::errors::{ScardResult, Status};
use crate::MAX_ATR_SIZE;
use bitflags::bitflags;

bitflags! {
    /// Protocol bit masks as used in `dwPreferredProtocols` and friends.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protocols: u32 {
        const T0 = 0x0001;
        const T1 = 0x0002;
        const RAW = 0x0004;
        const T15 = 0x0008;
    }
}

impl Protocols {
    pub const ANY: Protocols = Protocols::T0.union(Protocols::T1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// TS = 0x3B.
    Direct,
    /// TS = 0x3F.
    Inverse,
}

/// A decoded ATR. Holds enough of the raw structure that [`Atr::encode`]
/// reproduces the input byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    /// Union of the protocols named by the TD bytes.
    pub available: Protocols,
    /// Protocol selected immediately after reset (first TD's low nibble).
    pub current: Protocols,
    /// The interface characters between T0 and the historical bytes.
    interface: Vec<u8>,
    t0: u8,
    pub historical: Vec<u8>,
    pub tck: Option<u8>,
}

impl Atr {
    /// Decodes an ATR. Trailing bytes past the structure are tolerated
    /// (drivers frequently hand back a full-size buffer); [`Atr::len`]
    /// reports how many bytes the ATR actually occupies.
    pub fn decode(bytes: &[u8]) -> ScardResult<Atr> {
        if bytes.len() < 2 {
            return Err(Status::SCARD_E_INVALID_ATR);
        }
        let bytes = &bytes[..bytes.len().min(MAX_ATR_SIZE)];

        let convention = match bytes[0] {
            0x3B => Convention::Direct,
            0x3F => Convention::Inverse,
            _ => return Err(Status::SCARD_E_INVALID_ATR),
        };

        let t0 = bytes[1];
        let mut y = t0 >> 4;
        let historical_len = (t0 & 0x0F) as usize;

        let mut p = 2;
        let mut available = Protocols::empty();
        let mut current = None;

        while y != 0 {
            // TA, TB and TC are skipped over; only TD carries protocol
            // information.
            for bit in [0x01u8, 0x02, 0x04] {
                if y & bit != 0 {
                    p += 1;
                }
            }
            if y & 0x08 != 0 {
                let td = *bytes.get(p).ok_or(Status::SCARD_E_INVALID_ATR)?;
                p += 1;
                let t = td & 0x0F;
                if current.is_none() {
                    current = Some(match t {
                        0 => Protocols::T0,
                        1 => Protocols::T1,
                        _ => return Err(Status::SCARD_E_INVALID_ATR),
                    });
                }
                match t {
                    0 => available |= Protocols::T0,
                    1 => available |= Protocols::T1,
                    // T=15 announces global interface bytes, not a protocol.
                    15 => (),
                    other => trace!("ignoring interface bytes for T={}", other),
                }
                y = td >> 4;
            } else {
                y = 0;
            }
            if p > bytes.len() {
                return Err(Status::SCARD_E_INVALID_ATR);
            }
        }

        // No TD at all: the card only ever speaks T=0.
        let current = current.unwrap_or_else(|| {
            available |= Protocols::T0;
            Protocols::T0
        });

        let interface = bytes[2..p].to_vec();

        let historical = bytes
            .get(p..p + historical_len)
            .ok_or(Status::SCARD_E_INVALID_ATR)?
            .to_vec();
        p += historical_len;

        // TCK is present exactly when a protocol other than T=0 is offered.
        let tck = if available.intersects(!Protocols::T0) {
            let tck = *bytes.get(p).ok_or(Status::SCARD_E_INVALID_ATR)?;
            Some(tck)
        } else {
            None
        };

        Ok(Atr {
            convention,
            available,
            current,
            interface,
            t0,
            historical,
            tck,
        })
    }

    /// Reassembles the ATR bytes this value was decoded from.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.push(match self.convention {
            Convention::Direct => 0x3B,
            Convention::Inverse => 0x3F,
        });
        out.push(self.t0);
        out.extend_from_slice(&self.interface);
        out.extend_from_slice(&self.historical);
        if let Some(tck) = self.tck {
            out.push(tck);
        }
        out
    }

    /// Number of bytes the ATR structure occupies.
    pub fn len(&self) -> usize {
        2 + self.interface.len() + self.historical.len() + usize::from(self.tck.is_some())
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// The protocol a card runs immediately after reset, or T=0 when the ATR
/// does not decode.
pub fn default_protocol(atr: &[u8]) -> Protocols {
    match Atr::decode(atr) {
        Ok(atr) => atr.current,
        Err(_) => Protocols::T0,
    }
}

/// Every protocol the card offers, or the empty set when the ATR does not
/// decode.
pub fn available_protocols(atr: &[u8]) -> Protocols {
    match Atr::decode(atr) {
        Ok(atr) => atr.available,
        Err(_) => Protocols::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_t0_card() {
        let atr = Atr::decode(&[0x3B, 0x00]).unwrap();
        assert_eq!(atr.convention, Convention::Direct);
        assert_eq!(atr.current, Protocols::T0);
        assert_eq!(atr.available, Protocols::T0);
        assert!(atr.historical.is_empty());
        assert_eq!(atr.tck, None);
        assert_eq!(atr.len(), 2);
    }

    #[test]
    fn t1_card_with_historical_and_tck() {
        let raw = [
            0x3B, 0x95, 0x13, 0x81, 0x01, 0x80, 0x73, 0xFF, 0x01, 0x00, 0x0B,
        ];
        let atr = Atr::decode(&raw).unwrap();
        assert_eq!(atr.current, Protocols::T1);
        assert_eq!(atr.available, Protocols::T1);
        assert_eq!(atr.historical, vec![0x80, 0x73, 0xFF, 0x01, 0x00]);
        assert_eq!(atr.tck, Some(0x0B));
        assert_eq!(atr.len(), raw.len());
    }

    #[test]
    fn inverse_convention() {
        let atr = Atr::decode(&[0x3F, 0x00]).unwrap();
        assert_eq!(atr.convention, Convention::Inverse);
    }

    #[test]
    fn reencode_yields_original_bytes() {
        let samples: &[&[u8]] = &[
            &[0x3B, 0x00],
            &[0x3B, 0x90, 0x11, 0x00],
            &[
                0x3B, 0x95, 0x13, 0x81, 0x01, 0x80, 0x73, 0xFF, 0x01, 0x00, 0x0B,
            ],
            // TA1 + TB1 + TC1 + TD1 all present, two historical bytes.
            &[0x3B, 0xF2, 0x11, 0x22, 0x33, 0x00, 0xAA, 0xBB],
        ];
        for raw in samples {
            let atr = Atr::decode(raw).unwrap();
            assert_eq!(&atr.encode(), raw, "sample {:02X?}", raw);
        }
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let mut raw = vec![0x3B, 0x90, 0x11, 0x00];
        let structural = raw.clone();
        raw.resize(MAX_ATR_SIZE, 0);
        let atr = Atr::decode(&raw).unwrap();
        assert_eq!(atr.len(), 4);
        assert_eq!(atr.encode(), structural);
    }

    #[test]
    fn bad_ts_is_rejected() {
        assert_eq!(
            Atr::decode(&[0x42, 0x00]).unwrap_err(),
            Status::SCARD_E_INVALID_ATR
        );
    }

    #[test]
    fn truncated_interface_bytes_are_rejected() {
        // T0 promises TA1 and TD1 but the string ends early.
        assert!(Atr::decode(&[0x3B, 0x95, 0x13]).is_err());
    }

    #[test]
    fn missing_tck_is_rejected() {
        // TD1 names T=1, so a TCK byte is mandatory.
        assert!(Atr::decode(&[0x3B, 0x80, 0x01]).is_err());
    }

    #[test]
    fn unsupported_first_protocol_is_rejected() {
        assert!(Atr::decode(&[0x3B, 0x80, 0x02, 0x00]).is_err());
    }

    #[test]
    fn default_protocol_falls_back_to_t0() {
        assert_eq!(default_protocol(&[]), Protocols::T0);
        assert_eq!(
            default_protocol(&[0x3B, 0x95, 0x13, 0x81, 0x01, 0x80, 0x73, 0xFF, 0x01, 0x00, 0x0B]),
            Protocols::T1
        );
    }
}
