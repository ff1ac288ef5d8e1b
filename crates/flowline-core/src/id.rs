//! Monotone 64-bit identifiers, Snowflake-style.
//!
//! IDs are plain `i64` internally but MUST cross any text boundary (JSON,
//! query params) as strings, never as numbers, to avoid precision loss in
//! clients that parse JSON integers as f64.

use derive_more::Display;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MILLIS: i64 = 1_700_000_000_000; // arbitrary custom epoch
const WORKER_BITS: i64 = 10;
const SEQ_BITS: i64 = 12;
const WORKER_SHIFT: i64 = SEQ_BITS;
const TIME_SHIFT: i64 = SEQ_BITS + WORKER_BITS;
const SEQ_MASK: i64 = (1 << SEQ_BITS) - 1;
const WORKER_MASK: i64 = (1 << WORKER_BITS) - 1;

/// A unique, time-ordered, monotonically increasing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Default)]
#[display("{_0}")]
pub struct Id(i64);

impl Id {
    pub fn from_raw(v: i64) -> Self {
        Self(v)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::LowerHex for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl serde::de::Visitor<'_> for V {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string-encoded 64-bit id")
            }

            fn visit_str<E>(self, v: &str) -> Result<Id, E>
            where
                E: serde::de::Error,
            {
                v.parse::<i64>().map(Id).map_err(E::custom)
            }

            fn visit_i64<E>(self, v: i64) -> Result<Id, E>
            where
                E: serde::de::Error,
            {
                Ok(Id(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Id, E>
            where
                E: serde::de::Error,
            {
                Ok(Id(v as i64))
            }
        }
        deserializer.deserialize_any(V)
    }
}

/// Process-local monotone generator, worker-partitioned so multiple
/// coordinator processes never collide.
pub struct IdGenerator {
    worker_id: i64,
    state: AtomicI64,
}

impl IdGenerator {
    pub fn new(worker_id: i64) -> Self {
        Self {
            worker_id: worker_id & WORKER_MASK,
            state: AtomicI64::new(0),
        }
    }

    /// Generate the next id. Monotone within this generator even across
    /// clock skew: if the wall clock does not advance past the last-used
    /// millisecond, the sequence counter absorbs the difference.
    pub fn next(&self) -> Id {
        loop {
            let now = now_millis();
            let prev = self.state.load(Ordering::Acquire);
            let prev_millis = prev >> SEQ_BITS;
            let (millis, seq) = if now > prev_millis {
                (now, 0)
            } else {
                (prev_millis, (prev & SEQ_MASK) + 1)
            };
            if seq > SEQ_MASK {
                // sequence exhausted within this millisecond; spin to next tick
                continue;
            }
            let next_state = (millis << SEQ_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let value =
                    ((millis - EPOCH_MILLIS) << TIME_SHIFT) | (self.worker_id << WORKER_SHIFT) | seq;
                return Id(value);
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

static GLOBAL: OnceLock<IdGenerator> = OnceLock::new();

/// Install the process-wide generator's worker id. Call once at startup;
/// subsequent calls are ignored (first writer wins).
pub fn init_worker_id(worker_id: i64) {
    let _ = GLOBAL.set(IdGenerator::new(worker_id));
}

/// Generate the next id from the process-wide generator, defaulting to
/// worker id 0 if `init_worker_id` was never called (single-coordinator
/// or test contexts).
pub fn next_id() -> Id {
    GLOBAL.get_or_init(|| IdGenerator::new(0)).next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase() {
        let generator = IdGenerator::new(1);
        let mut prev = generator.next();
        for _ in 0..1000 {
            let id = generator.next();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn round_trips_through_json_as_string() {
        let id = Id::from_raw(123456789012345);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"123456789012345\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn different_workers_do_not_collide_in_same_millisecond() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        assert_ne!(a.next(), b.next());
    }
}
