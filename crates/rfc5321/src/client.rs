use crate::client_types::{ResponseBuilder, ResponseLine};
use crate::tls::TlsOptions;
use crate::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, Response, SmtpClientTimeouts};
use memchr::memmem::Finder;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {}", .0.to_single_line())]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("TLS configuration: {0}")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
    #[error("TLS handshake with {hostname} failed: {error}")]
    TlsHandshake { hostname: String, error: String },
    #[error("Timed Out connecting to {hostname} after {duration:?}")]
    TimeOutConnect { hostname: String, duration: Duration },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
}

impl ClientError {
    /// Returns the reply that the peer used to reject a command,
    /// if that is what went wrong.
    pub fn rejection(&self) -> Option<&Response> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TlsInformation {
    pub cipher: String,
    pub protocol_version: String,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

impl SmtpClient {
    /// Opens a plain TCP connection. The greeting has not been
    /// read yet; call `read_response(None, ..)` before anything else.
    pub async fn new<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = match timeout(timeouts.connect_timeout, TcpStream::connect(addr.clone())).await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    hostname: addr.to_string(),
                    duration: timeouts.connect_timeout,
                })
            }
        };
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    /// Connects to a unix domain socket, as used by local LMTP servers
    #[cfg(unix)]
    pub async fn new_unix<P: AsRef<std::path::Path>>(
        path: P,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = match timeout(
            timeouts.connect_timeout,
            tokio::net::UnixStream::connect(path),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    hostname: path.display().to_string(),
                    duration: timeouts.connect_timeout,
                })
            }
        };
        Ok(Self::with_stream(stream, "localhost", timeouts))
    }

    /// Connects and negotiates TLS before any SMTP traffic takes place
    pub async fn new_tls<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        options: TlsOptions,
        timeouts: SmtpClientTimeouts,
    ) -> Result<(Self, TlsInformation), ClientError> {
        let mut client = Self::new(addr, timeouts).await?;
        let info = client.negotiate_tls(&options).await?;
        Ok((client, info))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            if let Some(i) = memchr::memmem::find(&self.read_buffer, b"\r\n") {
                if too_long {
                    self.read_buffer.drain(0..i + 2);
                    return Err(ClientError::ResponseTooLong);
                }

                let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                self.read_buffer.drain(0..i + 2);
                return Ok(line?);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let parsed = ResponseLine::parse(&line)
            .ok_or_else(|| ClientError::MalformedResponseLine(line.clone()))?;
        let mut is_final = parsed.is_final;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !is_final {
            let line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            let parsed = ResponseLine::parse(&line)
                .ok_or_else(|| ClientError::MalformedResponseLine(line.clone()))?;
            if !builder.add_line(&parsed) {
                return Err(ClientError::MalformedResponseLine(line.clone()));
            }
            is_final = parsed.is_final;
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));
        tracing::trace!(
            "{}: {command:?} response: {}",
            self.hostname,
            response.to_single_line()
        );

        Ok(response)
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, line.trim_end());
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        let duration = command.client_timeout_request(&self.timeouts);
        match timeout(duration, socket.write_all(line.as_bytes())).await {
            Ok(result) => result.map_err(|_| ClientError::NotConnected),
            Err(_) => Err(ClientError::TimeOutRequest {
                command: command.clone(),
                duration,
            }),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Issue a series of commands, and return the responses to
    /// those commands.
    ///
    /// When the peer advertised PIPELINING the commands are all
    /// written before any response is read; otherwise each response
    /// is read before writing the next command.
    ///
    /// The number of returned responses may be smaller than the
    /// number of requested commands if there is an issue with
    /// the network connection.
    pub async fn pipeline_commands(
        &mut self,
        commands: Vec<Command>,
    ) -> Vec<Result<Response, ClientError>> {
        let pipeline = self.capabilities.contains_key("PIPELINING");
        let mut results: Vec<Result<Response, ClientError>> = vec![];

        for cmd in &commands {
            if let Err(err) = self.write_command(cmd).await {
                results.push(Err(err));
                return results;
            }
            if !pipeline {
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
        }

        if pipeline {
            for cmd in &commands {
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
        }

        results
    }

    async fn hello(
        &mut self,
        command: Command,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self.send_command(&command).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        self.hello(Command::Ehlo(ehlo_name.to_string())).await
    }

    /// The LMTP (RFC 2033) equivalent of EHLO
    pub async fn lhlo(
        &mut self,
        lhlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        self.hello(Command::Lhlo(lhlo_name.to_string())).await
    }

    async fn negotiate_tls(&mut self, options: &TlsOptions) -> Result<TlsInformation, ClientError> {
        let connector = options.build_tls_connector()?;
        let name = options
            .alt_name
            .clone()
            .unwrap_or_else(|| self.hostname.clone());
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| ClientError::InvalidDnsName(name))?;

        let socket = self.socket.take().ok_or(ClientError::NotConnected)?;
        let stream = match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, socket),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ClientError::TlsHandshake {
                    hostname: self.hostname.clone(),
                    error: format!("{err:#}"),
                })
            }
            Err(_) => {
                return Err(ClientError::TlsHandshake {
                    hostname: self.hostname.clone(),
                    error: format!("timed out after {:?}", self.timeouts.starttls_timeout),
                })
            }
        };

        let (_, conn) = stream.get_ref();
        let info = TlsInformation {
            cipher: match conn.negotiated_cipher_suite() {
                Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
            protocol_version: match conn.protocol_version() {
                Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
        };

        self.socket.replace(Box::new(stream));
        // Anything buffered before the handshake must not be
        // interpreted as protected data
        self.read_buffer.clear();
        Ok(info)
    }

    /// Issue STARTTLS and upgrade the connection.
    /// The caller must repeat EHLO/LHLO afterwards.
    pub async fn starttls(&mut self, options: TlsOptions) -> Result<TlsInformation, ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }
        let info = self.negotiate_tls(&options).await?;
        self.capabilities.clear();
        Ok(info)
    }

    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: &str,
        recipient: &str,
        data: B,
    ) -> Result<Response, ClientError> {
        let mut responses = self
            .pipeline_commands(vec![
                Command::Rset,
                Command::MailFrom {
                    address: sender.to_string(),
                    parameters: vec![],
                },
                Command::RcptTo {
                    address: recipient.to_string(),
                    parameters: vec![],
                },
                Command::Data,
            ])
            .await;

        let expected = [250, 250, 250, 354];
        if responses.len() != expected.len() {
            // A short result set always ends with the failure that cut it short
            return match responses.pop() {
                Some(Err(err)) => Err(err),
                _ => Err(ClientError::NotConnected),
            };
        }

        for (resp, code) in responses.into_iter().zip(expected) {
            let resp = resp?;
            if resp.code != code {
                return Err(ClientError::Rejected(resp));
            }
        }

        let data: &[u8] = data.as_ref();
        let stuffed;

        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        let duration = Command::Data.client_timeout_request(&self.timeouts);
        let sock = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        match timeout(duration, sock.write_all(data)).await {
            Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
            Err(_) => return Err(ClientError::TimeOutData),
        }

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };
        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        match timeout(duration, sock.write_all(marker.as_bytes())).await {
            Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
            Err(_) => {
                return Err(ClientError::TimeOutRequest {
                    command: Command::DataDot,
                    duration,
                })
            }
        }

        // For LMTP this is the status of the one and only recipient
        let data_dot = Command::DataDot;
        let resp = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp));
        }

        Ok(resp)
    }

    /// Politely end the session. Errors are ignored since the
    /// transaction outcome has already been decided.
    pub async fn quit(mut self) {
        if let Err(err) = self.send_command(&Command::Quit).await {
            tracing::trace!("{}: error during QUIT: {err:#}", self.hostname);
        }
        if let Some(mut sock) = self.socket.take() {
            sock.shutdown().await.ok();
        }
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder> = LazyLock::new(|| Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
