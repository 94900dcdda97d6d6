//! Voltage ramps built from repeated single-shot sequences.
//!
//! A ramp is planned in register units (0.1 V) along a linear or cosine
//! curve, thinned out so that consecutive writes are never closer than a
//! minimum step interval, and then applied on the same open link. The first
//! and the last step run the full [`VoltageControlSequencer`] sequence; the
//! steps in between only write the voltage so that one step fits into the
//! step interval.

use crate::protocol as proto;
use crate::sequencer::VoltageControlSequencer;
use crate::tokio_common::Error;
use crate::transport::Transport;
use log::*;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum time between two ramp steps.
pub const DEFAULT_STEP_FLOOR: Duration = Duration::from_millis(80);

/// Cancellation is polled at least this often while waiting between steps.
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Smoothing {
    #[default]
    Linear,
    Cosine,
}

impl Smoothing {
    /// Maps progress `t` in `0..=1` onto the curve, keeping both ends fixed.
    pub fn ease(self, t: f64) -> f64 {
        match self {
            Smoothing::Linear => t,
            Smoothing::Cosine => (1.0 - (std::f64::consts::PI * t).cos()) / 2.0,
        }
    }
}

impl FromStr for Smoothing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Smoothing::Linear),
            "cosine" => Ok(Smoothing::Cosine),
            other => Err(format!("Unknown smoothing '{other}', expected 'linear' or 'cosine'")),
        }
    }
}

impl fmt::Display for Smoothing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Smoothing::Linear => f.write_str("linear"),
            Smoothing::Cosine => f.write_str("cosine"),
        }
    }
}

/// Voltages to apply, in order, and the pause between starting two of them.
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    pub steps: Vec<f64>,
    pub interval: Duration,
}

impl RampPlan {
    /// Plans a ramp from `start` to `end` taking roughly `duration`.
    ///
    /// The curve is sampled once per register unit, consecutive duplicates
    /// are dropped and the samples are thinned out evenly so that the
    /// interval between steps is at least `step_floor`. Both end points are
    /// always part of the plan.
    pub fn plan(
        start: proto::Voltage,
        end: proto::Voltage,
        duration: Duration,
        smoothing: Smoothing,
        step_floor: Duration,
    ) -> Self {
        let from = start.encode() as i32;
        let to = end.encode() as i32;
        let span = (to - from).abs();
        if span == 0 {
            return Self {
                steps: vec![proto::decode_voltage(to as u16)],
                interval: Duration::ZERO,
            };
        }

        let mut units = Vec::with_capacity(span as usize + 1);
        for i in 0..=span {
            let t = i as f64 / span as f64;
            let unit = (from as f64 + (to - from) as f64 * smoothing.ease(t)).round() as i32;
            push_distinct(&mut units, unit);
        }
        fix_end_points(&mut units, from, to);

        let max_intervals = if step_floor.is_zero() {
            usize::MAX
        } else {
            ((duration.as_secs_f64() / step_floor.as_secs_f64()).floor() as usize).max(1)
        };
        if units.len() - 1 > max_intervals {
            units = downsample(&units, max_intervals + 1);
            fix_end_points(&mut units, from, to);
        }

        let intervals = (units.len() - 1).max(1) as u32;
        let interval = if duration.is_zero() {
            Duration::ZERO
        } else {
            (duration / intervals).max(step_floor)
        };

        Self {
            steps: units
                .into_iter()
                .map(|unit| proto::decode_voltage(unit as u16))
                .collect(),
            interval,
        }
    }

    /// Time from the first to the last step.
    pub fn total_duration(&self) -> Duration {
        self.interval * self.steps.len().saturating_sub(1) as u32
    }
}

fn push_distinct(units: &mut Vec<i32>, unit: i32) {
    if units.last() != Some(&unit) {
        units.push(unit);
    }
}

fn fix_end_points(units: &mut Vec<i32>, from: i32, to: i32) {
    if units.first() != Some(&from) {
        units.insert(0, from);
    }
    if units.last() != Some(&to) {
        units.push(to);
    }
}

/// Picks `count` evenly spaced samples, first and last included.
fn downsample(units: &[i32], count: usize) -> Vec<i32> {
    let last = units.len() - 1;
    let mut picked = Vec::with_capacity(count);
    for j in 0..count {
        let index = (j as f64 * last as f64 / (count - 1) as f64).round() as usize;
        push_distinct(&mut picked, units[index.min(last)]);
    }
    picked
}

/// What a ramp run achieved.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RampSummary {
    pub applied: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub last_applied: Option<f64>,
}

/// Reads the present voltage as the ramp start, `0.0` if the device does not answer.
pub async fn current_voltage<T: Transport>(
    sequencer: &mut VoltageControlSequencer<T>,
) -> proto::Voltage {
    match sequencer.client_mut().read_voltage().await {
        Ok(volts) => proto::Voltage::try_from(volts).unwrap_or_else(|err| {
            warn!("Device reports {volts} V: {err}; starting ramp at 0 V");
            proto::Voltage::ZERO
        }),
        Err(err) => {
            warn!("Cannot read present voltage ({err}); starting ramp at 0 V");
            proto::Voltage::ZERO
        }
    }
}

/// Applies every step of `plan`. A failed step is logged and skipped.
pub async fn run_ramp<T: Transport>(
    sequencer: &mut VoltageControlSequencer<T>,
    plan: &RampPlan,
) -> RampSummary {
    let cancel = sequencer.cancel_flag().clone();
    let delay = sequencer.config().delay();
    let mut summary = RampSummary::default();
    let total = plan.steps.len();
    info!(
        "Ramp of {total} steps, interval {:?}, about {:?}",
        plan.interval,
        plan.total_duration()
    );

    for (index, &volts) in plan.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        let started = Instant::now();
        let result = if index == 0 || index + 1 == total {
            sequencer.run(volts).await.map(|_| ())
        } else {
            sequencer.write_voltage(volts).await
        };
        match result {
            Ok(()) => {
                info!("Ramp step {}/{total}: {volts} V", index + 1);
                summary.applied += 1;
                summary.last_applied = Some(volts);
            }
            Err(Error::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(err) => {
                warn!("Ramp step {}/{total} to {volts} V failed: {err}", index + 1);
                summary.failed += 1;
            }
        }

        if index + 1 < total {
            let deadline = (started + plan.interval).max(Instant::now() + delay);
            while !cancel.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
            }
        }
    }

    if summary.cancelled {
        info!("Ramp cancelled after {} steps", summary.applied + summary.failed);
    }
    summary
}
