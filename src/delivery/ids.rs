//! Time-ordered 64-bit server message ids.
//!
//! Layout, most significant first: 41 bits of milliseconds since 2024-01-01T00:00:00Z,
//! 5 bits datacenter, 5 bits machine, 12 bits sequence.

use crate::time::Clock;
use parking_lot::Mutex;
use thiserror::Error;

pub const ID_EPOCH_MS: u64 = 1_704_067_200_000;

const SEQUENCE_BITS: u64 = 12;
const MACHINE_BITS: u64 = 5;
const DATACENTER_BITS: u64 = 5;

const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER: u64 = (1 << MACHINE_BITS) - 1;

const MACHINE_SHIFT: u64 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u64 = SEQUENCE_BITS + MACHINE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + MACHINE_BITS + DATACENTER_BITS;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("{field} {value} out of range 0..=31")]
    WorkerOutOfRange { field: &'static str, value: u64 },
}

/// Fields recovered from an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub timestamp_ms: u64,
    pub datacenter_id: u64,
    pub machine_id: u64,
    pub sequence: u64,
}

struct IdState {
    last_ms: u64,
    sequence: u64,
}

pub struct IdGenerator<C: Clock> {
    clock: C,
    datacenter_id: u64,
    machine_id: u64,
    state: Mutex<IdState>,
}

impl<C: Clock> IdGenerator<C> {
    pub fn new(clock: C, datacenter_id: u64, machine_id: u64) -> Result<Self, IdError> {
        if datacenter_id > MAX_WORKER {
            return Err(IdError::WorkerOutOfRange {
                field: "datacenter_id",
                value: datacenter_id,
            });
        }
        if machine_id > MAX_WORKER {
            return Err(IdError::WorkerOutOfRange {
                field: "machine_id",
                value: machine_id,
            });
        }
        Ok(Self {
            clock,
            datacenter_id,
            machine_id,
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn next_id(&self) -> u64 {
        let now = self.clock.now_millis().saturating_sub(ID_EPOCH_MS);
        let mut state = self.state.lock();
        // A wall clock that stepped backwards keeps issuing from the last millisecond.
        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence == MAX_SEQUENCE {
            state.last_ms += 1;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }
        (state.last_ms << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_SHIFT)
            | (self.machine_id << MACHINE_SHIFT)
            | state.sequence
    }

    pub fn next_batch(&self, count: usize) -> Vec<u64> {
        (0..count).map(|_| self.next_id()).collect()
    }
}

pub fn decompose(id: u64) -> IdParts {
    IdParts {
        timestamp_ms: (id >> TIMESTAMP_SHIFT) + ID_EPOCH_MS,
        datacenter_id: (id >> DATACENTER_SHIFT) & MAX_WORKER,
        machine_id: (id >> MACHINE_SHIFT) & MAX_WORKER,
        sequence: id & MAX_SEQUENCE,
    }
}
