//! Change Sequence Numbers
//!
//! A CSN stamps every replicated update. The order is total:
//! timestamp first, then sequence number, then the issuing replica id,
//! which only breaks ties.
//!
//! The textual form is 28 hex digits: 16 for the timestamp, 4 for the
//! replica id and 8 for the sequence number. It is what the historical
//! attribute stores.

use crate::types::ReplicaId;
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Change Sequence Number
///
/// Field order matters: the derived `Ord` compares timestamp, then seq,
/// then replica id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug, Default)]
pub struct Csn {
    /// Milliseconds since UNIX epoch
    #[n(0)]
    pub timestamp: u64,

    /// Rolls forward for updates issued within the same millisecond
    #[n(1)]
    pub seq: u16,

    #[n(2)]
    pub replica_id: ReplicaId,
}

impl Csn {
    pub const fn new(timestamp: u64, seq: u16, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// Age of this CSN relative to `now_ms`, zero if it lies in the future
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp, self.replica_id.0, self.seq
        )
    }
}

impl FromStr for Csn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 28 || !s.is_ascii() {
            return Err(Error::Serialization(format!("invalid CSN '{}'", s)));
        }
        let parse = |range: std::ops::Range<usize>| {
            u64::from_str_radix(&s[range], 16)
                .map_err(|e| Error::Serialization(format!("invalid CSN '{}': {}", s, e)))
        };
        let timestamp = parse(0..16)?;
        let replica = parse(16..20)?;
        let seq = parse(20..28)?;
        let seq = u16::try_from(seq)
            .map_err(|_| Error::Serialization(format!("CSN sequence out of range in '{}'", s)))?;
        Ok(Csn::new(timestamp, seq, ReplicaId(replica as u16)))
    }
}

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock driven by hand, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp: u64,
    last_seq: u16,
}

/// Per-replica CSN generator
///
/// Safe to share between threads. Every CSN it hands out is strictly
/// greater than the previous one, whatever the wall clock does.
pub struct CsnGenerator {
    replica_id: ReplicaId,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_clock(replica_id, Arc::new(SystemClock))
    }

    pub fn with_clock(replica_id: ReplicaId, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Current wall-clock reading of the underlying clock
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Issue the next CSN
    pub fn next(&self) -> Csn {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if now > state.last_timestamp {
            state.last_timestamp = now;
            state.last_seq = 0;
        } else if state.last_seq == u16::MAX {
            state.last_timestamp += 1;
            state.last_seq = 0;
        } else {
            state.last_seq += 1;
        }

        Csn::new(state.last_timestamp, state.last_seq, self.replica_id)
    }

    /// Move past a CSN seen from another replica
    ///
    /// Afterwards `next()` returns something greater than `seen`.
    pub fn adjust(&self, seen: &Csn) {
        let mut state = self.state.lock();
        if seen.timestamp > state.last_timestamp {
            state.last_timestamp = seen.timestamp;
            state.last_seq = seen.seq;
        } else if seen.timestamp == state.last_timestamp && seen.seq > state.last_seq {
            state.last_seq = seen.seq;
        }
    }
}

impl fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CsnGenerator")
            .field("replica_id", &self.replica_id)
            .field("last_timestamp", &state.last_timestamp)
            .field("last_seq", &state.last_seq)
            .finish()
    }
}
