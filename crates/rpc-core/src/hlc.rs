//! Hybrid logical clock: wall-clock reading plus a logical counter plus a node id,
//! ordered lexicographically once encoded.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HlcError {
    #[error("timestamp `{0}` is not a valid HLC encoding")]
    Malformed(String),
    #[error("remote timestamp is {drift:?} ahead of local, exceeding the configured bound of {bound:?}")]
    DriftExceeded { drift: Duration, bound: Duration },
}

/// A single hybrid-logical-clock reading: milliseconds since epoch, a tie-breaking
/// counter, and the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlcTimestamp {
    pub wall_millis: u64,
    pub counter: u32,
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn encode(&self) -> String {
        format!("{:020}.{:010}.{}", self.wall_millis, self.counter, self.node_id)
    }

    pub fn decode(value: &str) -> Result<Self, HlcError> {
        let mut parts = value.splitn(3, '.');
        let wall = parts.next().ok_or_else(|| HlcError::Malformed(value.to_string()))?;
        let counter = parts.next().ok_or_else(|| HlcError::Malformed(value.to_string()))?;
        let node_id = parts.next().ok_or_else(|| HlcError::Malformed(value.to_string()))?;
        let wall_millis: u64 = wall.parse().map_err(|_| HlcError::Malformed(value.to_string()))?;
        let counter: u32 = counter.parse().map_err(|_| HlcError::Malformed(value.to_string()))?;
        Ok(Self {
            wall_millis,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.wall_millis, self.counter, &self.node_id).cmp(&(
            other.wall_millis,
            other.counter,
            &other.node_id,
        ))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// The mutable clock state owned by a single process/node.
#[derive(Debug, Clone)]
pub struct HybridLogicalClock {
    node_id: String,
    last: HlcTimestamp,
    max_drift: Duration,
}

impl HybridLogicalClock {
    pub fn new(node_id: impl Into<String>, max_drift: Duration) -> Self {
        let node_id = node_id.into();
        Self {
            last: HlcTimestamp {
                wall_millis: 0,
                counter: 0,
                node_id: node_id.clone(),
            },
            node_id,
            max_drift,
        }
    }

    fn wall_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    /// Advances the clock to `max(local, wall-clock reading)` and returns the new value.
    pub fn now(&mut self) -> HlcTimestamp {
        let wall = Self::wall_now();
        if wall > self.last.wall_millis {
            self.last = HlcTimestamp {
                wall_millis: wall,
                counter: 0,
                node_id: self.node_id.clone(),
            };
        } else {
            self.last.counter += 1;
        }
        self.last.clone()
    }

    /// Folds an observed remote timestamp into the local clock, enforcing the configured
    /// maximum drift. A remote timestamp further in the future than the bound is rejected
    /// rather than silently adopted.
    pub fn merge(&mut self, remote: &HlcTimestamp) -> Result<HlcTimestamp, HlcError> {
        let wall = Self::wall_now();
        if remote.wall_millis > wall {
            let drift = Duration::from_millis(remote.wall_millis - wall);
            if drift > self.max_drift {
                return Err(HlcError::DriftExceeded {
                    drift,
                    bound: self.max_drift,
                });
            }
        }
        let merged_wall = wall.max(remote.wall_millis).max(self.last.wall_millis);
        let counter = if merged_wall == self.last.wall_millis && merged_wall == remote.wall_millis {
            self.last.counter.max(remote.counter) + 1
        } else if merged_wall == self.last.wall_millis {
            self.last.counter + 1
        } else if merged_wall == remote.wall_millis {
            remote.counter + 1
        } else {
            0
        };
        self.last = HlcTimestamp {
            wall_millis: merged_wall,
            counter,
            node_id: self.node_id.clone(),
        };
        Ok(self.last.clone())
    }
}
