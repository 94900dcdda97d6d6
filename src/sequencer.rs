//! Enable output, set voltage, verify.
//!
//! [`VoltageControlSequencer`] runs the three steps strictly one after the
//! other on one link. Only the voltage write decides the outcome: the
//! enable step and the read-back are best effort and their failures end up
//! in the [`SequenceReport`] instead of aborting the run.

use crate::client::DeviceClient;
use crate::config::Config;
use crate::protocol as proto;
use crate::tokio_common::{Error, ErrorKind, Result};
use crate::transport::Transport;
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared flag asking a running sequence to stop at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set, checking every `poll`.
    pub async fn cancelled(&self, poll: Duration) {
        while !self.is_cancelled() {
            tokio::time::sleep(poll).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    EnablingOutput,
    SettingVoltage,
    VerifyingVoltage,
    Complete,
    Failed,
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceState::Idle => "idle",
            SequenceState::EnablingOutput => "enabling output",
            SequenceState::SettingVoltage => "setting voltage",
            SequenceState::VerifyingVoltage => "verifying voltage",
            SequenceState::Complete => "complete",
            SequenceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of the enable-output step.
#[derive(Debug)]
pub enum EnableOutcome {
    Acknowledged,
    /// The device did not confirm; the output may already have been on.
    Unconfirmed(Error),
}

/// Result of the read-back step.
#[derive(Debug)]
pub enum Verification {
    /// Read-back within tolerance.
    Matched { actual: f64 },
    /// Read-back further than the tolerance away from the target.
    Mismatch { actual: f64, delta: f64 },
    /// No usable reading.
    Unverified(Error),
}

/// Outcome of a completed sequence.
#[derive(Debug)]
pub struct SequenceReport {
    pub target: f64,
    pub enable: EnableOutcome,
    pub verification: Verification,
}

impl SequenceReport {
    pub fn has_mismatch(&self) -> bool {
        matches!(self.verification, Verification::Mismatch { .. })
    }

    pub fn is_verified(&self) -> bool {
        !matches!(self.verification, Verification::Unverified(_))
    }

    /// The voltage read back from the device, if any.
    pub fn actual(&self) -> Option<f64> {
        match self.verification {
            Verification::Matched { actual } | Verification::Mismatch { actual, .. } => {
                Some(actual)
            }
            Verification::Unverified(_) => None,
        }
    }
}

/// Failures the best-effort steps absorb: no answer, a garbled answer or a refusal.
fn is_soft(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Timeout | ErrorKind::InvalidResponse | ErrorKind::DeviceError
    )
}

pub struct VoltageControlSequencer<T> {
    client: DeviceClient<T>,
    config: Config,
    state: SequenceState,
    cancel: CancelFlag,
}

impl<T: Transport> VoltageControlSequencer<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Self {
            client: DeviceClient::from_config(transport, &config),
            config,
            state: SequenceState::Idle,
            cancel: CancelFlag::new(),
        }
    }

    /// Uses `cancel` to stop between steps.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the cancellation flag, e.g. with a fresh one for the next command.
    pub fn set_cancel_flag(&mut self, cancel: CancelFlag) {
        self.cancel = cancel;
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn client_mut(&mut self) -> &mut DeviceClient<T> {
        &mut self.client
    }

    pub fn into_transport(self) -> T {
        self.client.into_transport()
    }

    /// Applies `target` volts.
    ///
    /// # Errors
    ///
    /// * [`Error::OutOfRange`] before any I/O if `target` is outside `0..=max_voltage`.
    /// * [`Error::Cancelled`] if cancelled before the voltage was written.
    /// * Any failure of the voltage write.
    pub async fn run(&mut self, target: f64) -> Result<SequenceReport> {
        self.check_target(target)?;
        match self.run_steps(target).await {
            Ok(report) => {
                self.transition(SequenceState::Complete);
                Ok(report)
            }
            Err(err) => {
                warn!("Setting {target} V failed while {}: {err}", self.state);
                self.transition(SequenceState::Failed);
                Err(err)
            }
        }
    }

    /// Writes `target` volts without enabling the output or reading back.
    ///
    /// Meant for the inner steps of a ramp whose first step already ran
    /// [`run`](Self::run) on the same link.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run), minus the tolerated failures.
    pub async fn write_voltage(&mut self, target: f64) -> Result<()> {
        self.check_target(target)?;
        let result = match self.checkpoint() {
            Ok(()) => {
                self.transition(SequenceState::SettingVoltage);
                self.client.set_voltage(target).await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.transition(SequenceState::Complete);
                Ok(())
            }
            Err(err) => {
                self.transition(SequenceState::Failed);
                Err(err)
            }
        }
    }

    fn check_target(&mut self, target: f64) -> Result<()> {
        self.state = SequenceState::Idle;
        if (proto::VOLTAGE_MIN..=self.config.max_voltage()).contains(&target) {
            Ok(())
        } else {
            self.state = SequenceState::Failed;
            Err(proto::Error::VoltageOutOfRange(target).into())
        }
    }

    async fn run_steps(&mut self, target: f64) -> Result<SequenceReport> {
        self.checkpoint()?;
        self.transition(SequenceState::EnablingOutput);
        let enable = match self.client.enable_output(true).await {
            Ok(()) => EnableOutcome::Acknowledged,
            Err(err) if is_soft(&err) => {
                warn!("Output enable not confirmed, continuing: {err}");
                EnableOutcome::Unconfirmed(err)
            }
            Err(err) => return Err(err),
        };

        tokio::time::sleep(self.config.delay()).await;
        self.checkpoint()?;
        self.transition(SequenceState::SettingVoltage);
        self.client.set_voltage(target).await?;
        info!("Voltage {target} V written to {}", self.config.address());

        tokio::time::sleep(self.config.settle_delay()).await;
        let verification = if self.cancel.is_cancelled() {
            Verification::Unverified(Error::Cancelled)
        } else {
            self.transition(SequenceState::VerifyingVoltage);
            self.verify(target).await
        };

        Ok(SequenceReport {
            target,
            enable,
            verification,
        })
    }

    async fn verify(&mut self, target: f64) -> Verification {
        match self.client.read_voltage().await {
            Ok(actual) => {
                let delta = (actual - target).abs();
                if delta > proto::VOLTAGE_TOLERANCE {
                    warn!("Voltage mismatch: requested {target} V, device reports {actual} V");
                    Verification::Mismatch { actual, delta }
                } else {
                    debug!("Voltage verified: {actual} V");
                    Verification::Matched { actual }
                }
            }
            Err(err) => {
                warn!("Could not verify voltage: {err}");
                Verification::Unverified(err)
            }
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: SequenceState) {
        trace!("Sequence: {} -> {}", self.state, next);
        self.state = next;
    }
}
