//! Line based TCP command server.
//!
//! Clients send one command per line (`\n` or `\r` terminated):
//!
//! * `<port> <address> <volts>` sets the voltage right away.
//! * `<port> <address> <end volts> <duration ms>` ramps from the last known
//!   voltage to `end volts`.
//!
//! Port and address must name the link the server was started on. Every line
//! is answered with `OK:0` or `ERR:<code>:<message>`. A new command stops a
//! running ramp at its next step boundary before it is executed.
//!
//! All commands are executed one after the other by a single [`Controller`],
//! which owns the serial link.

use crate::protocol as proto;
use crate::ramp::{self, RampPlan, Smoothing};
use crate::sequencer::{CancelFlag, VoltageControlSequencer};
use crate::tokio_common::Error;
use crate::transport::Transport;
use log::*;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Default address to listen on.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:4998";

/// Longest message text sent back in an `ERR` reply.
const MAX_REPLY_MESSAGE: usize = 300;

const REQUEST_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Set(proto::Voltage),
    Ramp {
        end: proto::Voltage,
        duration: Duration,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(
        "Invalid command format: expected 3 tokens (instant) or 4 tokens (ramp); got {0}"
    )]
    TokenCount(usize),
    #[error("Invalid command prefix: expected '{port} {address}'")]
    Target { port: String, address: u8 },
    #[error("Invalid voltage value: {0}")]
    Voltage(String),
    #[error("Invalid ramp duration: {0}")]
    Duration(String),
    #[error(transparent)]
    Failed(#[from] Error),
    #[error("Controller stopped")]
    Stopped,
}

impl CommandError {
    /// Numeric code of the `ERR` reply.
    pub fn code(&self) -> u8 {
        match self {
            CommandError::TokenCount(_) => 252,
            CommandError::Target { .. } => 253,
            CommandError::Voltage(_) | CommandError::Duration(_) => 254,
            CommandError::Failed(_) => 1,
            CommandError::Stopped => 255,
        }
    }
}

/// The link a server accepts commands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub port: String,
    pub address: proto::Address,
}

impl Target {
    /// Parses one command line. The port name is compared case-insensitively.
    pub fn parse_command(&self, line: &str) -> Result<Command, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !(3..=4).contains(&tokens.len()) {
            return Err(CommandError::TokenCount(tokens.len()));
        }
        if !tokens[0].eq_ignore_ascii_case(&self.port)
            || tokens[1].parse::<u8>().ok() != Some(*self.address)
        {
            return Err(CommandError::Target {
                port: self.port.clone(),
                address: *self.address,
            });
        }
        let voltage = tokens[2]
            .parse::<f64>()
            .ok()
            .and_then(|volts| proto::Voltage::try_from(volts).ok())
            .ok_or_else(|| CommandError::Voltage(tokens[2].to_owned()))?;
        match tokens.get(3) {
            None => Ok(Command::Set(voltage)),
            Some(millis) => {
                let millis = millis
                    .parse::<u64>()
                    .map_err(|_| CommandError::Duration((*millis).to_owned()))?;
                Ok(Command::Ramp {
                    end: voltage,
                    duration: Duration::from_millis(millis),
                })
            }
        }
    }
}

/// Formats the reply line for a command result, newline included.
pub fn format_reply(result: &Result<(), CommandError>) -> String {
    match result {
        Ok(()) => "OK:0\n".to_owned(),
        Err(err) => {
            let message: String = err
                .to_string()
                .replace(['\r', '\n'], " ")
                .chars()
                .take(MAX_REPLY_MESSAGE)
                .collect();
            format!("ERR:{}:{message}\n", err.code())
        }
    }
}

/// A parsed command waiting for the controller, with the way back to its client.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Executes commands on the serial link, one at a time.
pub struct Controller<T> {
    sequencer: VoltageControlSequencer<T>,
    smoothing: Smoothing,
    step_floor: Duration,
    last_known: Option<f64>,
}

impl<T: Transport> Controller<T> {
    pub fn new(sequencer: VoltageControlSequencer<T>) -> Self {
        Self {
            sequencer,
            smoothing: Smoothing::default(),
            step_floor: ramp::DEFAULT_STEP_FLOOR,
            last_known: None,
        }
    }

    pub fn with_smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_step_floor(mut self, step_floor: Duration) -> Self {
        self.step_floor = step_floor;
        self
    }

    pub fn target(&self) -> Target {
        Target {
            port: self.sequencer.config().port().to_owned(),
            address: self.sequencer.config().address(),
        }
    }

    /// The last voltage written successfully, the start of the next ramp.
    pub fn last_known(&self) -> Option<f64> {
        self.last_known
    }

    pub fn into_sequencer(self) -> VoltageControlSequencer<T> {
        self.sequencer
    }

    /// Serves `requests` until every sender is gone.
    ///
    /// A ramp is acknowledged as soon as it starts. A request arriving while
    /// a ramp runs cancels the ramp and is executed once the ramp stopped.
    pub async fn run(&mut self, mut requests: mpsc::Receiver<Request>) {
        let mut pending = None;
        loop {
            let request = match pending.take() {
                Some(request) => request,
                None => match requests.recv().await {
                    Some(request) => request,
                    None => break,
                },
            };
            self.sequencer.set_cancel_flag(CancelFlag::new());
            match request.command {
                Command::Set(voltage) => {
                    let result = self.set(voltage).await;
                    if request.reply.send(result).is_err() {
                        debug!("Client left before the reply");
                    }
                }
                Command::Ramp { end, duration } => {
                    if request.reply.send(Ok(())).is_err() {
                        debug!("Client left before the reply");
                    }
                    pending = self.ramp(end, duration, &mut requests).await;
                }
            }
        }
        debug!("Command channel closed");
    }

    async fn set(&mut self, voltage: proto::Voltage) -> Result<(), CommandError> {
        info!("Executing instant command: {voltage}");
        let report = self.sequencer.run(*voltage).await?;
        self.last_known = Some(report.target);
        Ok(())
    }

    /// Runs a ramp; returns the request that pre-empted it, if any.
    async fn ramp(
        &mut self,
        end: proto::Voltage,
        duration: Duration,
        requests: &mut mpsc::Receiver<Request>,
    ) -> Option<Request> {
        let start = self
            .last_known
            .and_then(|volts| proto::Voltage::try_from(volts).ok())
            .unwrap_or_else(|| {
                info!("Last known voltage unknown, ramp starts at 0 V");
                proto::Voltage::ZERO
            });
        let plan = RampPlan::plan(start, end, duration, self.smoothing, self.step_floor);
        info!("Starting ramp {start} -> {end} over {duration:?}");

        let cancel = self.sequencer.cancel_flag().clone();
        let mut next = None;
        let summary = {
            let run = ramp::run_ramp(&mut self.sequencer, &plan);
            tokio::pin!(run);
            tokio::select! {
                biased;
                Some(request) = requests.recv() => {
                    info!("Pre-empting running ramp");
                    cancel.cancel();
                    next = Some(request);
                    run.await
                }
                summary = &mut run => summary,
            }
        };
        if let Some(volts) = summary.last_applied {
            self.last_known = Some(volts);
        }
        info!(
            "Ramp ended: {} applied, {} failed, cancelled: {}",
            summary.applied, summary.failed, summary.cancelled
        );
        next
    }
}

/// Accepts clients on `listener` and executes their commands with `controller`.
///
/// Runs until accepting fails for good or the future is dropped.
pub async fn serve<T: Transport>(
    listener: TcpListener,
    mut controller: Controller<T>,
) -> io::Result<()> {
    let (sender, receiver) = mpsc::channel(REQUEST_QUEUE);
    let target = controller.target();
    info!(
        "Listening on {} for {} device {}",
        listener.local_addr()?,
        target.port,
        target.address
    );
    tokio::select! {
        result = accept_loop(listener, sender, target) => result,
        () = controller.run(receiver) => Ok(()),
    }
}

async fn accept_loop(
    listener: TcpListener,
    requests: mpsc::Sender<Request>,
    target: Target,
) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!("Accept failed: {err}");
                continue;
            }
        };
        info!("Client connected: {peer}");
        let requests = requests.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, peer, requests, target).await {
                warn!("Connection to {peer} failed: {err}");
            }
            info!("Client {peer} disconnected");
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    requests: mpsc::Sender<Request>,
    target: Target,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buffer);
        for line in text.split(['\r', '\n']).map(str::trim) {
            if line.is_empty() {
                continue;
            }
            info!("Received from {peer}: {line}");
            let result = match target.parse_command(line) {
                Ok(command) => submit(&requests, command).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                warn!("Command '{line}' from {peer} failed: {err}");
            }
            writer.write_all(format_reply(&result).as_bytes()).await?;
        }
    }
}

async fn submit(requests: &mpsc::Sender<Request>, command: Command) -> Result<(), CommandError> {
    let (reply, response) = oneshot::channel();
    requests
        .send(Request { command, reply })
        .await
        .map_err(|_| CommandError::Stopped)?;
    response.await.map_err(|_| CommandError::Stopped)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mock_transport::*;
    use assert_matches::assert_matches;

    fn target() -> Target {
        Target {
            port: "COM3".to_owned(),
            address: proto::Address::try_from(1).unwrap(),
        }
    }

    fn controller(replies: impl IntoIterator<Item = Reply>) -> Controller<MockTransport> {
        let config = Config::new("mock", 1)
            .unwrap()
            .with_timeout(Duration::from_millis(10))
            .with_settle_delay(Duration::ZERO);
        Controller::new(VoltageControlSequencer::new(
            MockTransport::with_replies(replies),
            config,
        ))
    }

    fn request(command: Command) -> (Request, oneshot::Receiver<Result<(), CommandError>>) {
        let (reply, response) = oneshot::channel();
        (Request { command, reply }, response)
    }

    fn volts(value: f64) -> proto::Voltage {
        proto::Voltage::try_from(value).unwrap()
    }

    #[test]
    fn parse_instant_and_ramp() {
        let target = target();
        assert_eq!(
            target.parse_command("com3 1 45").unwrap(),
            Command::Set(volts(45.0))
        );
        assert_eq!(
            target.parse_command("  COM3   1 12.5 ").unwrap(),
            Command::Set(volts(12.5))
        );
        assert_eq!(
            target.parse_command("COM3 1 30 2500").unwrap(),
            Command::Ramp {
                end: volts(30.0),
                duration: Duration::from_millis(2500),
            }
        );
    }

    #[test]
    fn parse_rejects_bad_lines() {
        let target = target();
        assert_matches!(target.parse_command("COM3 1"), Err(CommandError::TokenCount(2)));
        assert_matches!(
            target.parse_command("COM3 1 2 3 4"),
            Err(CommandError::TokenCount(5))
        );
        assert_matches!(
            target.parse_command("COM4 1 10"),
            Err(CommandError::Target { .. })
        );
        assert_matches!(
            target.parse_command("COM3 2 10"),
            Err(CommandError::Target { .. })
        );
        assert_matches!(target.parse_command("COM3 1 abc"), Err(CommandError::Voltage(_)));
        assert_matches!(target.parse_command("COM3 1 60.5"), Err(CommandError::Voltage(_)));
        assert_matches!(
            target.parse_command("COM3 1 10 -5"),
            Err(CommandError::Duration(_))
        );
    }

    #[test]
    fn reply_format() {
        assert_eq!(format_reply(&Ok(())), "OK:0\n");
        assert_eq!(
            format_reply(&Err(CommandError::TokenCount(2))),
            "ERR:252:Invalid command format: expected 3 tokens (instant) or 4 tokens (ramp); \
             got 2\n"
        );
        let reply = format_reply(&Err(CommandError::Voltage("x".repeat(400))));
        assert!(reply.starts_with("ERR:254:Invalid voltage value: xxx"));
        assert_eq!(reply.len(), "ERR:254:".len() + MAX_REPLY_MESSAGE + 1);
        let timeout = Error::Timeout(Duration::from_secs(1));
        let expected = format!("ERR:1:{timeout}\n");
        assert_eq!(format_reply(&Err(CommandError::Failed(timeout))), expected);
    }

    #[tokio::test]
    async fn instant_set_updates_last_known() {
        let mut controller = controller([
            enable_ack(1),
            set_voltage_ack(1, 12.0),
            voltage_reading(1, 12.0),
        ]);
        let (sender, receiver) = mpsc::channel(4);
        let (set, response) = request(Command::Set(volts(12.0)));
        sender.send(set).await.unwrap();
        drop(sender);

        controller.run(receiver).await;
        assert_matches!(response.await, Ok(Ok(())));
        assert_eq!(controller.last_known(), Some(12.0));
    }

    #[tokio::test]
    async fn failed_set_is_reported() {
        let mut controller = controller([enable_ack(1), Reply::Silence]);
        let (sender, receiver) = mpsc::channel(4);
        let (set, response) = request(Command::Set(volts(12.0)));
        sender.send(set).await.unwrap();
        drop(sender);

        controller.run(receiver).await;
        let result = response.await.unwrap();
        assert_matches!(result, Err(CommandError::Failed(Error::Timeout(_))));
        assert_eq!(controller.last_known(), None);
    }

    #[tokio::test]
    async fn ramp_starts_from_last_known() {
        let mut controller = controller([
            enable_ack(1),
            set_voltage_ack(1, 1.0),
            voltage_reading(1, 1.0),
            enable_ack(1),
            set_voltage_ack(1, 1.0),
            voltage_reading(1, 1.0),
            set_voltage_ack(1, 1.1),
            enable_ack(1),
            set_voltage_ack(1, 1.2),
            voltage_reading(1, 1.2),
        ])
        .with_step_floor(Duration::from_millis(1));
        let (sender, receiver) = mpsc::channel(4);
        let (set, _) = request(Command::Set(volts(1.0)));
        let (ramp, response) = request(Command::Ramp {
            end: volts(1.2),
            duration: Duration::from_millis(10),
        });
        sender.send(set).await.unwrap();
        drop(sender);
        controller.run(receiver).await;
        assert_eq!(controller.last_known(), Some(1.0));

        let (sender, receiver) = mpsc::channel(4);
        sender.send(ramp).await.unwrap();
        drop(sender);
        controller.run(receiver).await;
        assert_matches!(response.await, Ok(Ok(())));
        assert_eq!(controller.last_known(), Some(1.2));

        let sent = controller.into_sequencer().into_transport().sent().to_vec();
        // 1.0 V set, then the ramp 1.0 -> 1.1 -> 1.2
        assert_eq!(sent.len(), 10);
        assert_eq!(&sent[6][..6], &[0x01, 0x10, 0x15, 0x02, 0x0B, 0x00]);
    }

    #[tokio::test]
    async fn new_command_preempts_ramp() {
        let mut controller = controller([
            enable_ack(1),
            set_voltage_ack(1, 5.0),
            voltage_reading(1, 5.0),
        ]);
        let (sender, receiver) = mpsc::channel(4);
        let (ramp, ramp_response) = request(Command::Ramp {
            end: volts(40.0),
            duration: Duration::from_secs(60),
        });
        let (set, set_response) = request(Command::Set(volts(5.0)));
        sender.send(ramp).await.unwrap();
        sender.send(set).await.unwrap();
        drop(sender);

        controller.run(receiver).await;
        assert_matches!(ramp_response.await, Ok(Ok(())));
        assert_matches!(set_response.await, Ok(Ok(())));
        assert_eq!(controller.last_known(), Some(5.0));

        // the ramp never wrote a step
        let sent = controller.into_sequencer().into_transport().sent().to_vec();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[1][..6], &[0x01, 0x10, 0x15, 0x02, 0x32, 0x00]);
    }

    #[tokio::test]
    async fn serves_tcp_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let controller = controller([
            enable_ack(1),
            set_voltage_ack(1, 12.0),
            voltage_reading(1, 12.0),
        ]);

        let client = async move {
            let stream = TcpStream::connect(address).await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer.write_all(b"mock 1 12\r\nmock 1\n").await.unwrap();
            writer.write_all(b"other 1 5\rmock 1 99\n").await.unwrap();
            let mut replies = Vec::new();
            for _ in 0..4 {
                replies.push(lines.next_line().await.unwrap().unwrap());
            }
            replies
        };

        let replies = tokio::select! {
            result = serve(listener, controller) => panic!("server stopped: {result:?}"),
            replies = client => replies,
        };
        assert_eq!(replies[0], "OK:0");
        assert!(replies[1].starts_with("ERR:252:"));
        assert!(replies[2].starts_with("ERR:253:"));
        assert!(replies[3].starts_with("ERR:254:"));
    }
}
