use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque session handle.
///
/// Pairs the OS process id with a registry-wide generation so a recycled pid
/// never resolves to an older session. Externally it is a single integer:
/// the generation in the high 32 bits, the OS pid (0 when nothing was spawned)
/// in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    generation: u32,
    os_pid: u32,
}

impl SessionId {
    pub fn new(generation: u32, os_pid: Option<u32>) -> Self {
        Self {
            generation,
            os_pid: os_pid.unwrap_or(0),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn os_pid(&self) -> Option<u32> {
        (self.os_pid != 0).then_some(self.os_pid)
    }

    pub fn as_u64(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.os_pid)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            generation: (raw >> 32) as u32,
            os_pid: (raw & 0xFFFF_FFFF) as u32,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_u64())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(SessionId::from_u64)
    }
}

/// Monotonic generation source. Starts at 1 so a valid handle is never 0.
#[derive(Debug)]
pub struct GenerationCounter(AtomicU32);

impl Default for GenerationCounter {
    fn default() -> Self {
        Self(AtomicU32::new(1))
    }
}

impl GenerationCounter {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
