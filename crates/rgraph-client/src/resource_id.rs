//! Bit-packed 64-bit resource identifiers.
//!
//! Bit 63 marks a root resource, bit 62 marks a transaction-local id. Local ids
//! keep a 24-bit per-transaction counter in the low bits and the issuing local
//! transaction id in the 32 bits above it. Bits 56..=61 of a local id are
//! reserved and must be zero. Global ids are opaque server values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Root-of-graph flag.
pub const ROOT_BIT: u64 = 1 << 63;
/// Transaction-local flag.
pub const LOCAL_BIT: u64 = 1 << 62;
/// Bits available to either encoding.
pub const PAYLOAD_MASK: u64 = LOCAL_BIT - 1;

/// Width of the per-transaction counter inside a local id.
pub const LOCAL_COUNTER_BITS: u32 = 24;
/// Largest counter a local id can carry.
pub const MAX_LOCAL_COUNTER: u32 = (1 << LOCAL_COUNTER_BITS) - 1;
/// Largest local transaction id a local id can carry.
pub const MAX_LOCAL_TX_ID: u32 = u32::MAX;
/// Unused bits between the transaction id and the flags of a local id.
pub const LOCAL_RESERVED_MASK: u64 = PAYLOAD_MASK & !((1 << (LOCAL_COUNTER_BITS + 32)) - 1);

/// Decoded view of a [`ResourceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceIdKind {
    /// No resource.
    Null,
    /// Server-assigned id.
    Global {
        /// Root-of-graph flag.
        root: bool,
        /// Server value without flags.
        raw: u64,
    },
    /// Client-minted id, valid only inside the issuing transaction.
    Local {
        /// Root-of-graph flag.
        root: bool,
        /// Per-transaction counter.
        counter: u32,
        /// Issuing local transaction id.
        tx_id: u32,
    },
}

/// Resource identifier as exchanged with the server.
///
/// Deserialization goes through [`TryFrom<u64>`] and rejects local ids with
/// reserved bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ResourceId(u64);

impl ResourceId {
    /// The null id.
    pub const NULL: ResourceId = ResourceId(0);

    /// Wraps a raw wire value without validation. Prefer `ResourceId::try_from`
    /// for values read from the wire.
    pub const fn from_raw(raw: u64) -> Self {
        ResourceId(raw)
    }

    /// The raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encodes a transaction-local id.
    pub fn local(root: bool, counter: u32, tx_id: u32) -> Result<Self> {
        if counter == 0 || counter > MAX_LOCAL_COUNTER {
            return Err(GraphError::invalid_argument(format!(
                "local id counter {counter} out of range 1..={MAX_LOCAL_COUNTER}"
            )));
        }
        if tx_id == 0 {
            return Err(GraphError::invalid_argument(
                "local transaction id must be non-zero",
            ));
        }
        let payload = ((tx_id as u64) << LOCAL_COUNTER_BITS) | counter as u64;
        Ok(ResourceId(root_flag(root) | LOCAL_BIT | payload))
    }

    /// Encodes a global id from the server-assigned value. A zero value is null.
    pub fn global(root: bool, raw: u64) -> Result<Self> {
        if raw & !PAYLOAD_MASK != 0 {
            return Err(GraphError::invalid_argument(format!(
                "global id value 0x{raw:x} does not fit in 62 bits"
            )));
        }
        if raw == 0 {
            return Ok(ResourceId::NULL);
        }
        Ok(ResourceId(root_flag(root) | raw))
    }

    /// True for the null id, whatever the root bit.
    pub fn is_null(self) -> bool {
        self.0 & !ROOT_BIT == 0
    }

    /// True for non-null ids with the root flag.
    pub fn is_root(self) -> bool {
        !self.is_null() && self.0 & ROOT_BIT != 0
    }

    /// True for transaction-local ids.
    pub fn is_local(self) -> bool {
        self.0 & LOCAL_BIT != 0
    }

    /// True for non-null server-assigned ids.
    pub fn is_global(self) -> bool {
        !self.is_null() && !self.is_local()
    }

    /// Local transaction id embedded in a local id, `None` for global and null ids.
    pub fn tx_id(self) -> Option<u32> {
        match self.decode() {
            ResourceIdKind::Local { tx_id, .. } => Some(tx_id),
            _ => None,
        }
    }

    /// Splits the id into its parts. Reserved bits of a local id are ignored
    /// here; [`ResourceId::check_locality`] and `try_from` reject them.
    pub fn decode(self) -> ResourceIdKind {
        if self.is_null() {
            return ResourceIdKind::Null;
        }
        let root = self.0 & ROOT_BIT != 0;
        let payload = self.0 & PAYLOAD_MASK;
        if self.is_local() {
            ResourceIdKind::Local {
                root,
                counter: (payload & MAX_LOCAL_COUNTER as u64) as u32,
                tx_id: ((payload >> LOCAL_COUNTER_BITS) & MAX_LOCAL_TX_ID as u64) as u32,
            }
        } else {
            ResourceIdKind::Global { root, raw: payload }
        }
    }

    /// Fails if a local id was issued by a different transaction or is malformed.
    pub fn check_locality(self, expected_tx: u32) -> Result<()> {
        self.check_reserved()?;
        match self.decode() {
            ResourceIdKind::Local { tx_id, .. } if tx_id != expected_tx => {
                Err(GraphError::CrossTransactionLeak {
                    id: self,
                    expected_tx,
                })
            }
            _ => Ok(()),
        }
    }

    fn check_reserved(self) -> Result<()> {
        if self.is_local() && self.0 & LOCAL_RESERVED_MASK != 0 {
            return Err(GraphError::invalid_argument(format!(
                "local id 0x{:x} has reserved bits set",
                self.0
            )));
        }
        Ok(())
    }
}

impl TryFrom<u64> for ResourceId {
    type Error = GraphError;

    fn try_from(raw: u64) -> Result<Self> {
        let id = ResourceId(raw);
        id.check_reserved()?;
        Ok(id)
    }
}

impl From<ResourceId> for u64 {
    fn from(id: ResourceId) -> u64 {
        id.0
    }
}

fn root_flag(root: bool) -> u64 {
    if root {
        ROOT_BIT
    } else {
        0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            ResourceIdKind::Null => write!(f, "XX:0x0"),
            ResourceIdKind::Global { root, raw } => {
                write!(f, "{}G:0x{:x}", if root { 'R' } else { 'N' }, raw)
            }
            ResourceIdKind::Local {
                root,
                counter,
                tx_id,
            } => write!(
                f,
                "{}L:0x{:x}[0x{:x}]",
                if root { 'R' } else { 'N' },
                counter,
                tx_id
            ),
        }
    }
}

impl FromStr for ResourceId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || GraphError::invalid_argument(format!("malformed resource id '{s}'"));

        if s == "XX:0x0" {
            return Ok(ResourceId::NULL);
        }
        let (prefix, rest) = s.split_once(":0x").ok_or_else(bad)?;
        let mut chars = prefix.chars();
        let root = match chars.next() {
            Some('R') => true,
            Some('N') => false,
            _ => return Err(bad()),
        };
        let flavor = chars.next().ok_or_else(bad)?;
        if chars.next().is_some() {
            return Err(bad());
        }
        match flavor {
            'G' => {
                let raw = u64::from_str_radix(rest, 16).map_err(|_| bad())?;
                if raw == 0 {
                    return Err(bad());
                }
                ResourceId::global(root, raw)
            }
            'L' => {
                let (counter, tx) = rest
                    .strip_suffix(']')
                    .and_then(|r| r.split_once("[0x"))
                    .ok_or_else(bad)?;
                let counter = u32::from_str_radix(counter, 16).map_err(|_| bad())?;
                let tx_id = u32::from_str_radix(tx, 16).map_err(|_| bad())?;
                ResourceId::local(root, counter, tx_id)
            }
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_null_id() {
        assert!(ResourceId::NULL.is_null());
        assert!(ResourceId::from_raw(ROOT_BIT).is_null());
        assert_eq!(ResourceId::from_raw(ROOT_BIT).decode(), ResourceIdKind::Null);
        assert!(!ResourceId::NULL.is_root());
        assert_eq!(ResourceId::NULL.to_string(), "XX:0x0");
        assert_eq!("XX:0x0".parse::<ResourceId>().unwrap(), ResourceId::NULL);
    }

    #[test]
    fn test_local_layout() {
        let id = ResourceId::local(false, 5, 0x1234).unwrap();
        assert_eq!(id.raw(), LOCAL_BIT | (0x1234 << 24) | 5);
        assert!(id.is_local());
        assert!(!id.is_root());
        assert_eq!(id.tx_id(), Some(0x1234));
        assert_eq!(id.to_string(), "NL:0x5[0x1234]");
    }

    #[test]
    fn test_local_rejects_out_of_range() {
        assert!(ResourceId::local(false, 0, 1).is_err());
        assert!(ResourceId::local(false, MAX_LOCAL_COUNTER + 1, 1).is_err());
        assert!(ResourceId::local(false, 1, 0).is_err());
        assert!(ResourceId::local(true, MAX_LOCAL_COUNTER, MAX_LOCAL_TX_ID).is_ok());
    }

    #[test]
    fn test_global_display() {
        let id = ResourceId::global(true, 0xabc).unwrap();
        assert_eq!(id.to_string(), "RG:0xabc");
        assert!(id.is_root());
        assert!(id.is_global());
        assert_eq!(id.tx_id(), None);
        assert!(ResourceId::global(false, LOCAL_BIT).is_err());
        assert_eq!(ResourceId::global(true, 0).unwrap(), ResourceId::NULL);
    }

    #[test]
    fn test_check_locality() {
        let local = ResourceId::local(false, 1, 7).unwrap();
        assert!(local.check_locality(7).is_ok());
        let err = local.check_locality(8).unwrap_err();
        assert!(matches!(err, GraphError::CrossTransactionLeak { expected_tx: 8, .. }));
        assert!(err.is_programming_error());
        assert!(ResourceId::global(false, 99).unwrap().check_locality(8).is_ok());
        assert!(ResourceId::NULL.check_locality(8).is_ok());
    }

    #[test]
    fn test_reserved_local_bits_rejected() {
        let valid = ResourceId::local(false, 3, 7).unwrap();
        let tainted = valid.raw() | (1 << 56);
        assert!(ResourceId::try_from(tainted).is_err());
        assert!(ResourceId::try_from(valid.raw()).is_ok());
        assert!(serde_json::from_str::<ResourceId>(&tainted.to_string()).is_err());
        assert_eq!(
            serde_json::from_str::<ResourceId>(&valid.raw().to_string()).unwrap(),
            valid
        );

        let unchecked = ResourceId::from_raw(tainted);
        assert_eq!(unchecked.tx_id(), Some(7));
        assert!(matches!(
            unchecked.check_locality(7).unwrap_err(),
            GraphError::InvalidArgument { .. }
        ));
        // Global ids use the full payload.
        assert!(ResourceId::try_from(ResourceId::global(false, 1 << 60).unwrap().raw()).is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for s in ["", "RG", "QG:0x1", "RG:0xzz", "NL:0x1", "NL:0x1[0x2", "RGX:0x1", "NG:0x0"] {
            assert!(s.parse::<ResourceId>().is_err(), "{s} should not parse");
        }
    }

    proptest! {
        #[test]
        fn prop_local_roundtrip(root: bool, counter in 1u32..=MAX_LOCAL_COUNTER, tx_id in 1u32..) {
            let id = ResourceId::local(root, counter, tx_id).unwrap();
            prop_assert_eq!(id.decode(), ResourceIdKind::Local { root, counter, tx_id });
            prop_assert_eq!(id.to_string().parse::<ResourceId>().unwrap(), id);
        }

        #[test]
        fn prop_global_roundtrip(root: bool, raw in 1u64..=PAYLOAD_MASK) {
            let id = ResourceId::global(root, raw).unwrap();
            prop_assert_eq!(id.decode(), ResourceIdKind::Global { root, raw });
            prop_assert_eq!(ResourceId::from_raw(id.raw()), id);
            prop_assert_eq!(id.to_string().parse::<ResourceId>().unwrap(), id);
        }
    }
}
