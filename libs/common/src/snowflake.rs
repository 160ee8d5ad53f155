use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Platform epoch: 2015-01-01T00:00:00Z in milliseconds since Unix epoch.
pub const PLATFORM_EPOCH_MS: u64 = 1_420_070_400_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1; // 4095

/// A 64-bit platform snowflake identifying a guild, member, role or channel.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits): ms since the platform epoch
/// - Bits 21–12: Worker + process ID (10 bits)
/// - Bits 11–0:  Sequence (12 bits)
///
/// Serialized as a decimal string, which is how the platform API sends IDs.
/// Deserializes from either a string or a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Creation timestamp encoded in the ID.
    pub fn created_at(self) -> DateTime<Utc> {
        let ms = (self.0 >> (WORKER_BITS + SEQUENCE_BITS)) + PLATFORM_EPOCH_MS;
        DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Self(n)),
        }
    }
}

struct State {
    last_ms: u64,
    sequence: u64,
}

/// Snowflake generator using the platform layout.
///
/// Used to mint IDs for the in-memory platform so fixtures carry realistic
/// creation timestamps.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u16) -> Self {
        assert!(
            (worker_id as u64) < (1 << WORKER_BITS),
            "worker_id must fit in {WORKER_BITS} bits"
        );
        Self {
            worker_id: worker_id as u64,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> Snowflake {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // A clock that moved backwards keeps issuing from the last observed ms.
        let mut now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; spin-wait.
                while now_ms <= state.last_ms {
                    now_ms = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms - PLATFORM_EPOCH_MS;
        Snowflake(
            (ts << (WORKER_BITS + SEQUENCE_BITS))
                | (self.worker_id << SEQUENCE_BITS)
                | state.sequence,
        )
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(PLATFORM_EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let gen = SnowflakeGenerator::new(0);
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(ids.insert(id), "duplicate snowflake: {id}");
        }
    }

    #[test]
    fn created_at_matches_generation_time() {
        let gen = SnowflakeGenerator::new(3);
        let before = current_ms();
        let id = gen.generate();
        let after = current_ms();

        let extracted = id.created_at().timestamp_millis() as u64;
        assert!(
            extracted >= before && extracted <= after,
            "extracted={extracted}, before={before}, after={after}"
        );
    }

    #[test]
    fn created_at_of_known_platform_id() {
        // 175928847299117063 was issued on 2016-04-30T11:18:25.796Z.
        let id = Snowflake(175_928_847_299_117_063);
        assert_eq!(id.created_at().timestamp_millis(), 1_462_015_105_796);
    }

    #[test]
    fn serializes_as_string_and_reads_both_forms() {
        let id = Snowflake(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");

        let from_text: Snowflake = serde_json::from_str("\"42\"").unwrap();
        let from_number: Snowflake = serde_json::from_str("42").unwrap();
        assert_eq!(from_text, id);
        assert_eq!(from_number, id);
    }

    #[test]
    fn rejects_non_numeric_text() {
        assert!(serde_json::from_str::<Snowflake>("\"abc\"").is_err());
        assert!("abc".parse::<Snowflake>().is_err());
    }
}
