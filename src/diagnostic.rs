//! Fixed diagnostic script: read the voltage, write a voltage, read it again.
//!
//! Every step keeps the request and the raw response so a user can compare
//! them with what a bus sniffer shows. A failing step does not stop the
//! script.

use crate::client::DeviceClient;
use crate::frame::{Frame, HexBytes};
use crate::protocol as proto;
use crate::tokio_common::{Error, Result};
use crate::transport::Transport;
use log::*;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum StepOutcome {
    Voltage(f64),
    Acknowledged,
    Failed(Error),
    Skipped(&'static str),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Voltage(volts) => write!(f, "OK, {volts:.1} V"),
            StepOutcome::Acknowledged => write!(f, "OK"),
            StepOutcome::Failed(err) => write!(f, "FAILED: {err}"),
            StepOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Debug)]
pub struct DiagnosticStep {
    pub name: &'static str,
    pub request: Option<Frame>,
    pub response: Option<Vec<u8>>,
    pub outcome: StepOutcome,
}

impl DiagnosticStep {
    pub fn is_ok(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Voltage(_) | StepOutcome::Acknowledged
        )
    }
}

impl fmt::Display for DiagnosticStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        if let Some(request) = &self.request {
            writeln!(f, "  sent:     {request}")?;
        }
        match &self.response {
            Some(response) => writeln!(f, "  received: {}", HexBytes(response))?,
            None if self.request.is_some() => writeln!(f, "  received: <nothing>")?,
            None => {}
        }
        write!(f, "  result:   {}", self.outcome)
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticReport {
    pub steps: Vec<DiagnosticStep>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(DiagnosticStep::is_ok)
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(f, "{step}")?;
        }
        Ok(())
    }
}

/// Runs the script. Without `write` the voltage read in the first step is written back.
pub async fn run_diagnostic<T: Transport>(
    client: &mut DeviceClient<T>,
    write: Option<proto::Voltage>,
    delay: Duration,
) -> DiagnosticReport {
    let mut report = DiagnosticReport::default();

    let first = read_step(client, "Read voltage").await;
    let first_reading = match first.outcome {
        StepOutcome::Voltage(volts) => Some(volts),
        _ => None,
    };
    report.steps.push(first);
    tokio::time::sleep(delay).await;

    let target = write.map(|voltage| *voltage).or(first_reading);
    let write_step = match target {
        Some(volts) => {
            let request = client.device().build_set_voltage_command(volts);
            let (response, result) =
                exchange(client, request, proto::SET_VOLTAGE_RESPONSE_LEN).await;
            DiagnosticStep {
                name: "Write voltage",
                request: Some(request),
                response,
                outcome: match result {
                    Ok(()) => StepOutcome::Acknowledged,
                    Err(err) => StepOutcome::Failed(err),
                },
            }
        }
        None => DiagnosticStep {
            name: "Write voltage",
            request: None,
            response: None,
            outcome: StepOutcome::Skipped("no voltage given and initial read failed"),
        },
    };
    report.steps.push(write_step);
    tokio::time::sleep(delay).await;

    report.steps.push(read_step(client, "Read voltage again").await);
    report
}

async fn read_step<T: Transport>(
    client: &mut DeviceClient<T>,
    name: &'static str,
) -> DiagnosticStep {
    let request = client.device().build_read_voltage_command();
    let (response, result) = exchange(client, request, proto::READ_VOLTAGE_RESPONSE_LEN).await;
    let outcome = match result {
        Ok(()) => match response
            .as_deref()
            .and_then(crate::device::DeviceProtocol::parse_voltage_response)
        {
            Some(volts) => StepOutcome::Voltage(volts),
            None => StepOutcome::Skipped("response carries no voltage"),
        },
        Err(err) => StepOutcome::Failed(err),
    };
    DiagnosticStep {
        name,
        request: Some(request),
        response,
        outcome,
    }
}

/// One exchange; keeps the raw response even when it fails the checks.
async fn exchange<T: Transport>(
    client: &mut DeviceClient<T>,
    request: Frame,
    expected_len: usize,
) -> (Option<Vec<u8>>, Result<()>) {
    match client.exchange(&request, expected_len).await {
        Ok(response) => {
            let checked = client.check(&response);
            if let Err(err) = &checked {
                info!("Diagnostic response rejected: {err}");
            }
            (Some(response), checked)
        }
        Err(err) => (None, Err(err)),
    }
}
