// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    eth::{Error, TargetList, TargetListStatus},
    session::TargetListSource,
};

/// How long to wait before requesting again after `AlreadyRequested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay for every retry.
    Fixed(Duration),
    /// Delay doubles with every retry of the same cycle, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_millis(10))
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { initial, max } => initial
                .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
                .map_or(max, |delay| delay.min(max)),
        }
    }
}

/// Result of one polling cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Cycle {
    /// A frame ready for processing.  `full` marks frames truncated by the
    /// sensor.
    Frame { targets: TargetList, full: bool },
    /// No sensor is producing data.
    Idle,
    /// A corrupted frame was dropped.
    Discarded,
}

impl Cycle {
    /// Returns the frame of a `Frame` cycle.
    pub fn targets(&self) -> Option<&TargetList> {
        match self {
            Cycle::Frame { targets, .. } => Some(targets),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames: u64,
    pub full: u64,
    pub retries: u64,
    pub idle: u64,
    pub discarded: u64,
    /// Polls that failed with a transport error.
    pub errors: u64,
}

/// Drives a [`TargetListSource`] through request, retry and process cycles.
#[derive(Debug)]
pub struct Acquisition<S> {
    source: S,
    policy: RetryPolicy,
    stats: AcquisitionStats,
}

impl<S: TargetListSource> Acquisition<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Acquisition {
            source,
            policy,
            stats: AcquisitionStats::default(),
        }
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Returns the source, typically to close the session.
    pub fn into_inner(self) -> S {
        self.source
    }

    /// Requests target lists until the cycle settles.  `AlreadyRequested`
    /// never ends a cycle, transport errors are returned to the caller.
    #[instrument(skip_all, level = "debug")]
    pub async fn next_cycle(&mut self) -> Result<Cycle, Error> {
        let mut attempt = 0;

        loop {
            let status = match self.source.poll_target_list().await {
                Ok(status) => status,
                Err(err) => {
                    self.stats.errors += 1;
                    return Err(err);
                }
            };

            match status {
                TargetListStatus::Ok(targets) => {
                    self.stats.frames += 1;
                    return Ok(Cycle::Frame {
                        targets,
                        full: false,
                    });
                }
                TargetListStatus::Full(targets) => {
                    warn!(
                        "frame {} full, targets beyond {} dropped",
                        targets.frame_id(),
                        targets.len()
                    );
                    self.stats.frames += 1;
                    self.stats.full += 1;
                    return Ok(Cycle::Frame {
                        targets,
                        full: true,
                    });
                }
                TargetListStatus::AlreadyRequested => {
                    let delay = self.policy.delay(attempt);
                    debug!("target list already requested, retry in {:?}", delay);
                    attempt = attempt.saturating_add(1);
                    self.stats.retries += 1;
                    tokio::time::sleep(delay).await;
                }
                TargetListStatus::NotActive => {
                    info!("target list not active, no device running or connected");
                    self.stats.idle += 1;
                    return Ok(Cycle::Idle);
                }
                TargetListStatus::DataCorrupted => {
                    warn!("target list data corrupted, frame discarded");
                    self.stats.discarded += 1;
                    return Ok(Cycle::Discarded);
                }
            }
        }
    }
}
