//! Radio sink over a LoRa-E5 modem's serial AT command channel.
//!
//! The modem accepts uplinks as `AT+CMSG="<payload>"`. Its command buffer bounds
//! the payload, so the sink formats with an explicit limit and refuses anything
//! longer instead of cutting it short.
//!
//! Some commands answer with several lines. `AT+DR=dr<n>` echoes the rate and
//! then reports the full plan; `AT+CMSG` reports progress (`Start`, `Wait ACK`,
//! ...) before `Done` or an error. Each exchange discards stale input, writes
//! the command and reads lines until the one that ends that command's reply.

use super::PayloadSink;
use crate::config::RadioConfig;
use crate::error::{RelayError, RelayResult};
use crate::record::CombinedRecord;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Reply the modem gives to a bare `AT`.
pub const HANDSHAKE_REPLY: &str = "+AT: OK";

/// Serial control channel able to transmit one payload.
#[async_trait]
pub trait ControlChannel: Send {
    /// Hand `payload` to the radio; fails if the modem reports an error.
    async fn transmit(&mut self, payload: &str) -> RelayResult<()>;
}

/// Sends records over a [`ControlChannel`].
#[derive(Debug)]
pub struct RadioSink<C> {
    channel: C,
    max_payload_len: usize,
}

impl<C: ControlChannel> RadioSink<C> {
    /// Sink refusing payloads longer than `max_payload_len` bytes.
    pub fn new(channel: C, max_payload_len: usize) -> Self {
        Self {
            channel,
            max_payload_len,
        }
    }

    /// Longest payload the channel accepts.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    /// The underlying control channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait]
impl<C: ControlChannel> PayloadSink for RadioSink<C> {
    fn name(&self) -> &str {
        "radio"
    }

    async fn send(&mut self, record: &CombinedRecord) -> RelayResult<String> {
        let payload = record.to_payload(self.max_payload_len)?;
        self.channel.transmit(&payload).await?;
        Ok(payload)
    }
}

/// Uplink command for `payload`.
pub fn uplink_command(payload: &str) -> String {
    format!("AT+CMSG=\"{payload}\"")
}

/// Data rate command; rates above 15 are rejected.
pub fn data_rate_command(data_rate: u8) -> RelayResult<String> {
    if data_rate > 15 {
        return Err(RelayError::Radio(format!(
            "data rate {data_rate} out of range 0-15"
        )));
    }
    Ok(format!("AT+DR=dr{data_rate}"))
}

/// Commands sent after the handshake, in order.
pub fn init_commands(config: &RadioConfig) -> RelayResult<Vec<String>> {
    let mut commands = vec!["AT+ADR=OFF".to_string()];
    if let Some(plan) = &config.channel_plan {
        commands.push(format!("AT+CH=NUM,{plan}"));
    }
    commands.push(data_rate_command(config.data_rate)?);
    Ok(commands)
}

/// Classify the final response line of a command.
pub fn check_response(command: &str, response: &str) -> RelayResult<()> {
    if response.contains("ERROR") {
        return Err(RelayError::Radio(format!(
            "modem rejected '{command}': {response}"
        )));
    }
    Ok(())
}

/// Which reply line ends a command's exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEnd {
    /// The first non-empty line.
    FirstLine,
    /// `+DR: <plan> DR<n> ...`, after the short `+DR: DR<n>` echo.
    DataRate,
    /// `+CMSG: Done`, after the progress lines.
    Uplink,
}

impl ReplyEnd {
    /// Reply shape of `command`.
    pub fn for_command(command: &str) -> Self {
        if command.starts_with("AT+DR=") {
            ReplyEnd::DataRate
        } else if command.starts_with("AT+CMSG") {
            ReplyEnd::Uplink
        } else {
            ReplyEnd::FirstLine
        }
    }

    /// Whether `line` is the last line of the reply. Error lines always are.
    pub fn is_terminal(self, line: &str) -> bool {
        if line.contains("ERROR") {
            return true;
        }
        match self {
            ReplyEnd::FirstLine => !line.is_empty(),
            ReplyEnd::DataRate => line
                .strip_prefix("+DR:")
                .is_some_and(|rest| rest.split_whitespace().count() >= 2),
            ReplyEnd::Uplink => line.starts_with("+CMSG:") && line.ends_with("Done"),
        }
    }
}

/// Byte link to the modem.
///
/// Reads time out with `TimedOut` (or `WouldBlock`) when nothing arrives.
pub trait ModemPort: Read + Write + Send {
    /// Drop any input received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

#[cfg(feature = "radio_serial")]
impl ModemPort for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}

/// Line-oriented AT exchanges over a [`ModemPort`].
struct AtLink {
    port: Box<dyn ModemPort>,
}

impl AtLink {
    /// Send `command` and return the line that ends its reply.
    ///
    /// `timeout` bounds the whole exchange, not each line.
    fn exchange(&mut self, command: &str, timeout: Duration) -> RelayResult<String> {
        self.port.discard_input().map_err(|e| {
            RelayError::Radio(format!("failed to clear input before '{command}': {e}"))
        })?;
        self.port
            .write_all(format!("{command}\n").as_bytes())
            .and_then(|()| self.port.flush())
            .map_err(|e| RelayError::Radio(format!("failed to write '{command}': {e}")))?;
        debug!(command, "sent AT command");

        let end = ReplyEnd::for_command(command);
        let deadline = Instant::now() + timeout;
        loop {
            let line = self.read_line(command, deadline, timeout)?;
            if end.is_terminal(&line) {
                debug!(command, response = %line, "modem response");
                return Ok(line);
            }
            if !line.is_empty() {
                debug!(command, line = %line, "modem progress");
            }
        }
    }

    fn read_line(&mut self, command: &str, deadline: Instant, timeout: Duration) -> RelayResult<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return Err(RelayError::Radio(format!(
                    "no final reply to '{command}' within {timeout:?}"
                )));
            }
            match self.port.read(&mut byte) {
                Ok(0) => return Err(RelayError::Radio("serial port closed".to_string())),
                Ok(_) if byte[0] == b'\n' => {
                    return Ok(String::from_utf8_lossy(&line).trim().to_string());
                }
                Ok(_) => line.push(byte[0]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(RelayError::Radio(format!("serial read error: {e}"))),
            }
        }
    }
}

/// LoRa-E5 modem on a serial port.
///
/// Serial I/O is blocking and runs on Tokio's blocking pool.
pub struct LoraModem {
    port_name: String,
    response_timeout: Duration,
    uplink_timeout: Duration,
    link: Arc<Mutex<AtLink>>,
}

impl std::fmt::Debug for LoraModem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraModem")
            .field("port_name", &self.port_name)
            .field("response_timeout", &self.response_timeout)
            .field("uplink_timeout", &self.uplink_timeout)
            .finish()
    }
}

impl LoraModem {
    /// Open the configured serial port and initialise the modem on it.
    #[cfg(feature = "radio_serial")]
    pub async fn open(config: &RadioConfig) -> RelayResult<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                RelayError::Radio(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    config.port, config.baud_rate, e
                ))
            })?;
        debug!(port = %config.port, baud = config.baud_rate, "serial port opened");
        Self::with_port(config.port.clone(), Box::new(port), config).await
    }

    /// Always fails: serial support is compiled out.
    #[cfg(not(feature = "radio_serial"))]
    pub async fn open(_config: &RadioConfig) -> RelayResult<Self> {
        Err(RelayError::SerialFeatureDisabled)
    }

    /// Check the modem answers on `port` and apply the uplink settings.
    pub async fn with_port(
        port_name: String,
        port: Box<dyn ModemPort>,
        config: &RadioConfig,
    ) -> RelayResult<Self> {
        let modem = Self {
            port_name,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            uplink_timeout: Duration::from_millis(config.uplink_timeout_ms),
            link: Arc::new(Mutex::new(AtLink { port })),
        };

        let reply = modem.command("AT").await?;
        if !reply.contains(HANDSHAKE_REPLY) {
            return Err(RelayError::Radio(format!(
                "unexpected handshake reply from {}: '{}'",
                modem.port_name, reply
            )));
        }

        let settle = Duration::from_millis(config.command_settle_ms);
        for command in init_commands(config)? {
            tokio::time::sleep(settle).await;
            let reply = modem.command(&command).await?;
            check_response(&command, &reply)?;
        }

        info!(port = %modem.port_name, data_rate = config.data_rate, "LoRa modem ready");
        Ok(modem)
    }

    /// Port the modem was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn command(&self, command: &str) -> RelayResult<String> {
        let timeout = match ReplyEnd::for_command(command) {
            ReplyEnd::Uplink => self.uplink_timeout,
            ReplyEnd::FirstLine | ReplyEnd::DataRate => self.response_timeout,
        };
        let link = Arc::clone(&self.link);
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = link.blocking_lock();
            guard.exchange(&command, timeout)
        })
        .await
            .map_err(|e| RelayError::Radio(format!("serial I/O task failed: {e}")))?
    }
}

#[async_trait]
impl ControlChannel for LoraModem {
    async fn transmit(&mut self, payload: &str) -> RelayResult<()> {
        let command = uplink_command(payload);
        let reply = self.command(&command).await?;
        check_response(&command, &reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct ScriptedChannel {
        sent: Vec<String>,
        reject: bool,
    }

    #[async_trait]
    impl ControlChannel for ScriptedChannel {
        async fn transmit(&mut self, payload: &str) -> RelayResult<()> {
            self.sent.push(payload.to_string());
            if self.reject {
                check_response(&uplink_command(payload), "+CMSG: ERROR(-1)")
            } else {
                Ok(())
            }
        }
    }

    /// In-memory LoRa-E5: answers each written line from a reply table.
    struct FakeModem {
        replies: fn(&str) -> Vec<&'static str>,
        input: VecDeque<u8>,
        pending: Vec<u8>,
        commands: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl FakeModem {
        fn new(replies: fn(&str) -> Vec<&'static str>) -> Self {
            Self {
                replies,
                input: VecDeque::new(),
                pending: Vec::new(),
                commands: Arc::default(),
            }
        }
    }

    impl Read for FakeModem {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for FakeModem {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &byte in buf {
                if byte != b'\n' {
                    self.pending.push(byte);
                    continue;
                }
                let command = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                for line in (self.replies)(&command) {
                    self.input.extend(line.bytes());
                    self.input.extend(b"\r\n");
                }
                self.commands.lock().unwrap().push(command);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ModemPort for FakeModem {
        fn discard_input(&mut self) -> io::Result<()> {
            self.input.clear();
            Ok(())
        }
    }

    fn healthy(command: &str) -> Vec<&'static str> {
        match command {
            "AT" => vec!["+AT: OK"],
            "AT+ADR=OFF" => vec!["+ADR: OFF"],
            c if c.starts_with("AT+CH=NUM") => vec!["+CH: NUM, 8-15,64"],
            c if c.starts_with("AT+DR=") => vec!["+DR: DR2", "+DR: US915 DR2 SF10 BW125K"],
            c if c.starts_with("AT+CMSG=") => vec![
                "+CMSG: Start",
                "+CMSG: Wait ACK",
                "+CMSG: ACK Received",
                "+CMSG: Done",
            ],
            _ => vec!["+AT: ERROR(-1)"],
        }
    }

    fn rejects_uplinks(command: &str) -> Vec<&'static str> {
        if command.starts_with("AT+CMSG=") {
            vec!["+CMSG: Start", "+CMSG: ERROR(-1)"]
        } else {
            healthy(command)
        }
    }

    fn never_finishes_uplinks(command: &str) -> Vec<&'static str> {
        if command.starts_with("AT+CMSG=") {
            vec!["+CMSG: Start"]
        } else {
            healthy(command)
        }
    }

    fn radio_config() -> RadioConfig {
        RadioConfig {
            port: "fake".to_string(),
            command_settle_ms: 0,
            response_timeout_ms: 200,
            uplink_timeout_ms: 200,
            ..RadioConfig::default()
        }
    }

    async fn modem_on(fake: FakeModem) -> RelayResult<LoraModem> {
        LoraModem::with_port("fake".to_string(), Box::new(fake), &radio_config()).await
    }

    fn record() -> CombinedRecord {
        CombinedRecord {
            timestamp: 1_700_000_000.0,
            voltage1: 120.0,
            current1: 2.5,
            voltage2: 119.8,
            current2: 2.4,
            moisture: 0.35,
            temperature: 21.6,
            conductivity: 300.0,
        }
    }

    #[tokio::test]
    async fn sends_formatted_payload() {
        let mut sink = RadioSink::new(ScriptedChannel::default(), 53);
        let payload = sink.send(&record()).await.unwrap();
        assert_eq!(payload, "1700000000,120,2,119,2,0.350000,21.600000,300");
        assert_eq!(sink.channel().sent, vec![payload]);
    }

    #[tokio::test]
    async fn oversize_payload_never_reaches_the_channel() {
        let mut sink = RadioSink::new(ScriptedChannel::default(), 40);
        let err = sink.send(&record()).await.unwrap_err();
        assert!(matches!(err, RelayError::PayloadTooLong { len: 45, max: 40 }));
        assert!(sink.channel().sent.is_empty());
    }

    #[tokio::test]
    async fn modem_error_reply_fails_the_send() {
        let channel = ScriptedChannel {
            reject: true,
            ..ScriptedChannel::default()
        };
        let mut sink = RadioSink::new(channel, 53);
        let err = sink.send(&record()).await.unwrap_err();
        assert!(matches!(err, RelayError::Radio(_)));
        assert!(err.is_send_error());
    }

    #[test]
    fn command_strings() {
        assert_eq!(uplink_command("1,2,3"), "AT+CMSG=\"1,2,3\"");
        assert_eq!(data_rate_command(2).unwrap(), "AT+DR=dr2");
        assert!(data_rate_command(16).is_err());
    }

    #[test]
    fn init_sequence_follows_config() {
        let config = RadioConfig::default();
        assert_eq!(
            init_commands(&config).unwrap(),
            vec!["AT+ADR=OFF", "AT+CH=NUM,8-15,64", "AT+DR=dr2"]
        );

        let config = RadioConfig {
            channel_plan: None,
            data_rate: 5,
            ..RadioConfig::default()
        };
        assert_eq!(init_commands(&config).unwrap(), vec!["AT+ADR=OFF", "AT+DR=dr5"]);
    }

    #[test]
    fn error_replies_are_detected() {
        assert!(check_response("AT+DR=dr2", "+DR: US915 DR2").is_ok());
        assert!(check_response("AT+DR=dr2", "+DR: ERROR(-2)").is_err());
    }

    #[test]
    fn reply_ends_per_command() {
        assert_eq!(ReplyEnd::for_command("AT"), ReplyEnd::FirstLine);
        assert_eq!(ReplyEnd::for_command("AT+DR=dr2"), ReplyEnd::DataRate);
        assert_eq!(ReplyEnd::for_command("AT+CMSG=\"1\""), ReplyEnd::Uplink);

        assert!(!ReplyEnd::DataRate.is_terminal("+DR: DR2"));
        assert!(ReplyEnd::DataRate.is_terminal("+DR: US915 DR2 SF10 BW125K"));
        assert!(ReplyEnd::DataRate.is_terminal("+DR: ERROR(-1)"));
        assert!(!ReplyEnd::Uplink.is_terminal("+CMSG: Start"));
        assert!(!ReplyEnd::Uplink.is_terminal("+CMSG: Wait ACK"));
        assert!(ReplyEnd::Uplink.is_terminal("+CMSG: Done"));
        assert!(ReplyEnd::Uplink.is_terminal("+CMSG: ERROR(-1)"));
        assert!(!ReplyEnd::FirstLine.is_terminal(""));
    }

    #[tokio::test]
    async fn modem_replies_are_read_to_their_end() {
        let fake = FakeModem::new(healthy);
        let commands = Arc::clone(&fake.commands);
        let mut modem = modem_on(fake).await.unwrap();

        modem.transmit("1,2,3").await.unwrap();
        modem.transmit("4,5,6").await.unwrap();
        assert_eq!(
            commands.lock().unwrap().as_slice(),
            [
                "AT",
                "AT+ADR=OFF",
                "AT+CH=NUM,8-15,64",
                "AT+DR=dr2",
                "AT+CMSG=\"1,2,3\"",
                "AT+CMSG=\"4,5,6\"",
            ]
        );
    }

    #[tokio::test]
    async fn rejected_uplinks_fail_every_send() {
        let modem = modem_on(FakeModem::new(rejects_uplinks)).await.unwrap();
        let mut sink = RadioSink::new(modem, 53);

        for _ in 0..2 {
            let err = sink.send(&record()).await.unwrap_err();
            assert!(matches!(err, RelayError::Radio(ref m) if m.contains("ERROR(-1)")));
            assert!(err.is_send_error());
        }
    }

    #[tokio::test]
    async fn uplink_without_final_reply_times_out() {
        let mut modem = modem_on(FakeModem::new(never_finishes_uplinks)).await.unwrap();
        let err = modem.transmit("1,2,3").await.unwrap_err();
        assert!(matches!(err, RelayError::Radio(ref m) if m.contains("no final reply")));
    }

    #[tokio::test]
    async fn unexpected_handshake_fails_open() {
        let err = modem_on(FakeModem::new(|_| vec!["garbage"])).await.unwrap_err();
        assert!(matches!(err, RelayError::Radio(ref m) if m.contains("handshake")));
    }

    #[test]
    fn stale_input_is_discarded_before_a_command() {
        let mut fake = FakeModem::new(rejects_uplinks);
        fake.input.extend(b"+DR: US915 DR2 SF10 BW125K\r\n+CMSG: Done\r\n");
        let mut link = AtLink {
            port: Box::new(fake),
        };

        let reply = link
            .exchange(&uplink_command("1,2,3"), Duration::from_millis(200))
            .unwrap();
        assert_eq!(reply, "+CMSG: ERROR(-1)");
    }

    #[tokio::test]
    async fn missing_port_fails_to_open() {
        let config = RadioConfig {
            port: "/dev/does-not-exist-relay".to_string(),
            ..RadioConfig::default()
        };
        let err = LoraModem::open(&config).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Radio(_) | RelayError::SerialFeatureDisabled
        ));
    }
}
