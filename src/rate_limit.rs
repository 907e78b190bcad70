// ABOUTME: Token-bucket throttle applied before every publish attempt
// ABOUTME: Wraps governor's direct limiter; a zero rate means unlimited

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{bail, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};

/// Publish-rate limiter shared by the tasks of one source.
///
/// `governor` keeps its bucket in an atomic cell, so `acquire` may be called
/// concurrently through a shared reference.
pub struct RateLimiter {
    inner: Option<DefaultDirectRateLimiter>,
    rate: f64,
    burst: u32,
}

impl RateLimiter {
    pub fn unlimited() -> Self {
        Self {
            inner: None,
            rate: 0.0,
            burst: 0,
        }
    }

    /// `rate` is in publishes per second and may be fractional. `burst`
    /// defaults to the rate rounded up, with a floor of one.
    pub fn new(rate: f64, burst: Option<u32>) -> Result<Self> {
        if !rate.is_finite() || rate < 0.0 {
            bail!("rate limit must be a non-negative number, got {rate}");
        }
        if rate == 0.0 {
            return Ok(Self::unlimited());
        }

        let burst = burst.unwrap_or_else(|| rate.ceil().min(u32::MAX as f64) as u32);
        let burst_nz = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = match Duration::try_from_secs_f64(1.0 / rate) {
            Ok(period) => period,
            Err(_) => bail!("rate limit {rate}/s is too low to schedule"),
        };
        let quota = match Quota::with_period(period) {
            Some(quota) => quota.allow_burst(burst_nz),
            None => bail!("rate limit {rate}/s is too high to schedule"),
        };

        Ok(Self {
            inner: Some(Governor::direct(quota)),
            rate,
            burst: burst_nz.get(),
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.is_none()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Waits until a publish token is available.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("unlimited", &self.is_unlimited())
            .finish()
    }
}
