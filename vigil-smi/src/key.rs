//! Object keys
//!
//! Every API object is identified by a 16-byte key. GPU keys are derived
//! deterministically from the host identifier, the linear GPU index and the
//! hardware unique id, so the same GPU maps to the same key across restarts
//! of the agent on the same host.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Raw key length in bytes
pub const OBJ_KEY_LEN: usize = 16;

/// Length of the canonical 8-4-4-4-12 string form
pub const OBJ_KEY_STR_LEN: usize = 36;

/// 16-byte object key
///
/// Equality and hashing are bytewise. The displayable form is the canonical
/// lowercase 8-4-4-4-12 hex grouping; that form is also how keys travel on
/// the JSON protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjKey([u8; OBJ_KEY_LEN]);

impl ObjKey {
    pub const fn new(bytes: [u8; OBJ_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// All-zero key, used as the invalid sentinel
    pub const fn zero() -> Self {
        Self([0; OBJ_KEY_LEN])
    }

    /// A key is valid iff it is not all zeroes
    pub fn valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    pub fn as_bytes(&self) -> &[u8; OBJ_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjKey({})", self)
    }
}

impl FromStr for ObjKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OBJ_KEY_STR_LEN {
            return Err(format!(
                "key must be {} characters, got {}",
                OBJ_KEY_STR_LEN,
                s.len()
            ));
        }
        let mut bytes = [0u8; OBJ_KEY_LEN];
        let mut idx = 0;
        let mut chars = s.chars();
        for (pos, group_len) in [(0, 8), (9, 4), (14, 4), (19, 4), (24, 12)] {
            // check the separator preceding each group after the first
            if pos != 0 {
                match chars.next() {
                    Some('-') => {}
                    _ => return Err("key groups must be separated by '-'".to_string()),
                }
            }
            let mut consumed = 0;
            while consumed < group_len {
                let hi = chars
                    .next()
                    .and_then(|c| c.to_digit(16))
                    .ok_or_else(|| "key contains a non-hex character".to_string())?;
                let lo = chars
                    .next()
                    .and_then(|c| c.to_digit(16))
                    .ok_or_else(|| "key contains a non-hex character".to_string())?;
                bytes[idx] = ((hi << 4) | lo) as u8;
                idx += 1;
                consumed += 2;
            }
        }
        Ok(ObjKey(bytes))
    }
}

impl Serialize for ObjKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjKey::from_str(&s).map_err(D::Error::custom)
    }
}

/// Host identifier, cached for the process lifetime
fn host_id() -> u32 {
    static HOST_ID: OnceLock<u32> = OnceLock::new();
    // SAFETY: gethostid takes no arguments and only reads system state.
    *HOST_ID.get_or_init(|| unsafe { libc::gethostid() } as u32)
}

/// Derive the uuid of a GPU from its linear index and hardware unique id
///
/// Layout:
///   bytes 0-3   host identifier
///   byte  4     0x42
///   byte  5     linear GPU index
///   bytes 6-7   0x4242
///   bytes 8-15  GPU unique identifier
pub fn gpu_uuid(gpu_idx: u8, gpu_unique_id: u64) -> ObjKey {
    gpu_uuid_with_host(host_id(), gpu_idx, gpu_unique_id)
}

/// Same derivation with an explicit host id, for tests
pub fn gpu_uuid_with_host(host_id: u32, gpu_idx: u8, gpu_unique_id: u64) -> ObjKey {
    let mut bytes = [0u8; OBJ_KEY_LEN];
    bytes[0..4].copy_from_slice(&host_id.to_ne_bytes());
    bytes[4] = 0x42;
    bytes[5] = gpu_idx;
    bytes[6] = 0x42;
    bytes[7] = 0x42;
    bytes[8..16].copy_from_slice(&gpu_unique_id.to_ne_bytes());
    ObjKey(bytes)
}

/// Extract the linear GPU index back out of a GPU uuid
pub fn gpu_idx_from_uuid(key: &ObjKey) -> u8 {
    key.0[5]
}
