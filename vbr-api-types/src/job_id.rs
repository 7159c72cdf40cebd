//! Job identifiers.
//!
//! Format (§6.4): `job-YYYYMMDD-HHMMSS.mmm-XXXXXX`, where the trailing six
//! hex characters come from a cryptographically seeded RNG. Second-precision
//! timestamps alone collided under concurrent triggers within the same
//! second; millisecond precision plus randomness is required, not cosmetic.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Seeded from the OS RNG at process start, then incremented per id. A pure
/// 24-bit random draw collides with near certainty once a few thousand ids
/// are issued (birthday bound on 16.7M slots) -- which is exactly the
/// concurrent-trigger scenario this id format exists to survive. A random
/// starting point plus a monotonic stride keeps ids unpredictable across
/// restarts while guaranteeing no collision within one process's lifetime.
static SUFFIX_COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::thread_rng().gen_range(0..0x0100_0000)));

impl JobId {
    /// Generate a new id from the given instant. Split out from `generate()`
    /// so the id-collision regression test can drive many ids off one
    /// instant without racing the wall clock.
    pub fn generate_at(now: DateTime<Utc>) -> Self {
        let suffix = SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        let formatted = format!(
            "job-{}-{:06x}",
            now.format("%Y%m%d-%H%M%S%.3f"),
            suffix,
        );
        JobId(formatted)
    }

    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = match s.strip_prefix("job-") {
            Some(rest) => rest,
            None => bail!("job id '{}' missing 'job-' prefix", s),
        };
        // YYYYMMDD-HHMMSS.mmm-XXXXXX
        let parts: Vec<&str> = body.splitn(3, '-').collect();
        if parts.len() != 3 || parts[0].len() != 8 || parts[2].len() != 6 {
            bail!("job id '{}' does not match job-YYYYMMDD-HHMMSS.mmm-XXXXXX", s);
        }
        if !parts[2].chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("job id '{}' has a non-hex random suffix", s);
        }
        Ok(JobId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn format_round_trips() {
        let id = JobId::generate();
        let parsed: JobId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("not-a-job-id".parse::<JobId>().is_err());
        assert!("job-20260101-000000.000-zzzzzz".parse::<JobId>().is_err());
    }

    /// Regression test for property 6: 10,000 ids issued concurrently within
    /// the same millisecond must never collide.
    #[test]
    fn ten_thousand_concurrent_ids_never_collide() {
        let now = Utc::now();
        let mut seen = HashSet::with_capacity(10_000);
        for _ in 0..10_000 {
            let id = JobId::generate_at(now);
            assert!(seen.insert(id), "collision generating job id at a fixed instant");
        }
    }
}
