//! Confirmation policy: the highest source position safe to read on a network.
//!
//! A position is eligible when every configured [Strategy] accepts it. The built-in
//! strategies are [ConfirmationDepth] (`tip >= height + K`) and [MinimumAge]
//! (`now >= timestamp + secs`). Reads never go past [ConfirmationPolicy::safe_height].

use crate::config::ConfirmationConfig;
use crate::reader::{ChainSource, ReaderError};

/// A source position being considered for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub height: u64,
    pub timestamp: u64,
}

/// Defines when a position is eligible given the current tip and wall clock (unix seconds).
pub trait Strategy: Send + Sync {
    fn is_eligible(&self, candidate: &Candidate, tip: u64, now: u64) -> bool;
}

/// Confirmation-depth strategy: eligible when `tip >= height + K`.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationDepth(pub u64);

impl Strategy for ConfirmationDepth {
    fn is_eligible(&self, candidate: &Candidate, tip: u64, _now: u64) -> bool {
        tip >= candidate.height.saturating_add(self.0)
    }
}

/// Minimum-age strategy: eligible once `secs` have elapsed since the position's timestamp.
#[derive(Debug, Clone, Copy)]
pub struct MinimumAge(pub u64);

impl Strategy for MinimumAge {
    fn is_eligible(&self, candidate: &Candidate, _tip: u64, now: u64) -> bool {
        now >= candidate.timestamp.saturating_add(self.0)
    }
}

/// Depth plus minimum age for one network.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy {
    depth: ConfirmationDepth,
    min_age: MinimumAge,
}

impl ConfirmationPolicy {
    pub fn new(depth: u64, min_age_secs: u64) -> Self {
        Self {
            depth: ConfirmationDepth(depth),
            min_age: MinimumAge(min_age_secs),
        }
    }

    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self::new(config.depth, config.min_age_secs)
    }

    pub fn is_eligible(&self, candidate: &Candidate, tip: u64, now: u64) -> bool {
        self.depth.is_eligible(candidate, tip, now) && self.min_age.is_eligible(candidate, tip, now)
    }

    /// Highest position `>= floor` that is eligible, or None if even `floor` is not.
    ///
    /// Depth bounds the search at `tip - K`; the age check assumes timestamps do not
    /// decrease with height and binary-searches `[floor, tip - K]`.
    pub async fn safe_height<C: ChainSource + ?Sized>(
        &self,
        chain: &C,
        floor: u64,
        now: u64,
    ) -> Result<Option<u64>, ReaderError> {
        let tip = chain.tip().await?;
        let Some(mut hi) = tip.checked_sub(self.depth.0) else {
            return Ok(None);
        };
        if hi < floor {
            return Ok(None);
        }
        if self.min_age.0 == 0 {
            return Ok(Some(hi));
        }
        let eligible = |height: u64, timestamp: u64| {
            self.is_eligible(&Candidate { height, timestamp }, tip, now)
        };
        if eligible(hi, chain.timestamp(hi).await?) {
            return Ok(Some(hi));
        }
        if !eligible(floor, chain.timestamp(floor).await?) {
            return Ok(None);
        }
        // Invariant: floor is eligible, hi is not.
        let mut lo = floor;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if eligible(mid, chain.timestamp(mid).await?) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(Some(lo))
    }
}
