//! Message id generation.
//!
//! Ids are 64-bit snowflakes: 41 bits of milliseconds since a fixed epoch,
//! 10 bits of worker id and a 12 bit per-millisecond sequence. They are
//! unique across workers with distinct ids and increase over time, so rows
//! inserted later sort after rows inserted earlier.

use std::{
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;

/// Milliseconds since the unix epoch at which snowflake time starts (2010-11-04).
pub const SNOWFLAKE_EPOCH: i64 = 1_288_834_974_657;

const WORKER_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Capability handed to the storage layer for minting new row ids.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> i64;
}

#[derive(Default)]
struct State {
    last_timestamp: i64,
    sequence: i64,
}

pub struct SnowflakeId {
    worker_id: i64,
    state: Mutex<State>,
}

impl SnowflakeId {
    /// Creates a generator for the given worker. Ids above [`MAX_WORKER_ID`] are masked.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: i64::from(worker_id) & MAX_WORKER_ID,
            state: Mutex::new(State::default()),
        }
    }

    /// Creates a generator with a randomly chosen worker id.
    pub fn random() -> Self {
        let worker_id = rand::thread_rng().gen_range(0..=MAX_WORKER_ID as u16);
        Self::new(worker_id)
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    fn current_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(SNOWFLAKE_EPOCH)
    }
}

impl IdGenerator for SnowflakeId {
    fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // A clock that moved backwards keeps issuing ids from the last seen millisecond.
        let mut timestamp = Self::current_millis().max(state.last_timestamp);

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond, borrow the next one.
                timestamp += 1;
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;

        ((timestamp - SNOWFLAKE_EPOCH) << (WORKER_ID_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence
    }
}
