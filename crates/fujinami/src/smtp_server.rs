use crate::connection::{ConnectionState, TlsDescriptor};
use crate::error::{RelayError, SmtpReply};
use crate::session::{Direction, RelayContext, Session};
use anyhow::Context;
use data_encoding::BASE64;
use rfc5321::{BoxedAsyncReadAndWrite, Command};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

const MAX_LINE_LEN: usize = 4096;
const MAX_DATA_LINE_LEN: usize = 1024 * 1024;

/// Accepts client connections and runs an [SmtpServer] for each
pub struct SmtpListener {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    tls: Arc<ServerConfig>,
}

impl SmtpListener {
    pub async fn bind(ctx: Arc<RelayContext>, tls: Arc<ServerConfig>) -> anyhow::Result<Self> {
        let listen = ctx.config.listener.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind to {listen}"))?;
        tracing::info!("listening on {}", listener.local_addr()?);
        Ok(Self { listener, ctx, tls })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer_address) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually descriptor exhaustion; give sessions a
                    // chance to finish before trying again
                    tracing::error!("accept: {err:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let ctx = self.ctx.clone();
            let tls = self.tls.clone();
            let span = tracing::info_span!("smtp", peer = %peer_address);
            tokio::spawn(
                async move {
                    if let Err(err) = SmtpServer::run(socket, peer_address, ctx, tls).await {
                        tracing::error!("SmtpServer::run: {err:#}");
                    }
                }
                .instrument(span),
            );
        }
    }
}

pub struct SmtpServer {
    stream: Option<BufReader<BoxedAsyncReadAndWrite>>,
    ctx: Arc<RelayContext>,
    tls: Arc<ServerConfig>,
    conn: ConnectionState,
    session: Session,
    authenticated: Option<String>,
}

impl SmtpServer {
    pub async fn run(
        socket: TcpStream,
        peer_address: SocketAddr,
        ctx: Arc<RelayContext>,
        tls: Arc<ServerConfig>,
    ) -> anyhow::Result<()> {
        let local = socket.local_addr()?;
        socket.set_nodelay(true)?;
        let stream: BoxedAsyncReadAndWrite = Box::new(socket);
        let mut server = SmtpServer {
            stream: Some(BufReader::new(stream)),
            session: Session::new(ctx.clone(), Direction::Inbound),
            conn: ConnectionState::new(peer_address, local),
            authenticated: None,
            ctx,
            tls,
        };

        if server.ctx.config.listener.implicit_tls {
            server.start_tls().await?;
        }

        if let Err(err) = server.process().await {
            tracing::debug!("ending session: {err:#}");
            let message = format!(
                "4.4.2 {} Error: closing connection",
                server.ctx.config.server_name
            );
            server.write_response(421, message).await.ok();
        }
        Ok(())
    }

    fn stream(&mut self) -> anyhow::Result<&mut BufReader<BoxedAsyncReadAndWrite>> {
        self.stream.as_mut().context("connection is closed")
    }

    async fn write_response<S: AsRef<str>>(&mut self, status: u16, message: S) -> anyhow::Result<()> {
        let mut text = String::new();
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            text.push_str(&format!("{status}{sep}{line}\r\n"));
        }
        if text.is_empty() {
            // An empty AUTH challenge
            text = format!("{status} \r\n");
        }
        tracing::trace!("send: {}", text.trim_end());

        let duration = self.ctx.config.listener.write_timeout;
        let stream = self.stream()?;
        let write = async {
            stream.write_all(text.as_bytes()).await?;
            stream.flush().await
        };
        match timeout(duration, write).await {
            Ok(result) => Ok(result?),
            Err(_) => anyhow::bail!("timed out writing response after {duration:?}"),
        }
    }

    async fn write_reply(&mut self, reply: &SmtpReply) -> anyhow::Result<()> {
        match &reply.enhanced {
            Some(enhanced) => {
                self.write_response(reply.code, format!("{enhanced} {}", reply.message))
                    .await
            }
            None => self.write_response(reply.code, &reply.message).await,
        }
    }

    /// Returns None when the client has closed the connection
    async fn read_line(&mut self, limit: usize) -> anyhow::Result<Option<Vec<u8>>> {
        let duration = self.ctx.config.listener.read_timeout;
        let stream = self.stream()?;
        let mut line = vec![];
        let mut limited = (&mut *stream).take(limit as u64);
        let size = match timeout(duration, limited.read_until(b'\n', &mut line)).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("timed out waiting {duration:?} for the client"),
        };
        if size == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") {
            if size >= limit {
                anyhow::bail!("line too long");
            }
            anyhow::bail!("connection closed mid-line");
        }
        Ok(Some(line))
    }

    async fn start_tls(&mut self) -> anyhow::Result<()> {
        let duration = self.ctx.config.listener.read_timeout;
        // Anything the client pipelined behind STARTTLS is discarded
        let stream = self.stream.take().context("connection is closed")?.into_inner();
        let acceptor = TlsAcceptor::from(self.tls.clone());
        let stream = match timeout(duration, acceptor.accept(stream)).await {
            Ok(result) => result.context("TLS handshake")?,
            Err(_) => anyhow::bail!("timed out during TLS handshake"),
        };
        self.conn.tls = TlsDescriptor::from_connection(stream.get_ref().1);
        if let Some(tls) = &self.conn.tls {
            tracing::debug!(
                version = tls.version_name(),
                cipher = tls.cipher_name(),
                "TLS established"
            );
        }
        let stream: BoxedAsyncReadAndWrite = Box::new(stream);
        self.stream.replace(BufReader::new(stream));
        Ok(())
    }

    fn auth_permitted(&self) -> bool {
        self.conn.tls.is_some() || self.ctx.config.listener.allow_insecure_auth
    }

    fn ehlo_response(&self, domain: &str) -> String {
        let config = &self.ctx.config;
        let mut lines = vec![
            format!("{} Hello {domain}", config.server_name),
            "PIPELINING".to_string(),
            format!("SIZE {}", config.listener.max_message_size),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.conn.tls.is_none() {
            lines.push("STARTTLS".to_string());
        }
        if self.authenticated.is_none() && self.auth_permitted() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.join("\n")
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        let greeting = format!(
            "{} ESMTP {}",
            self.ctx.config.server_name, self.ctx.config.name
        );
        self.write_response(220, greeting).await?;

        loop {
            let line = match self.read_line(MAX_LINE_LEN).await? {
                Some(line) => String::from_utf8_lossy(&line).into_owned(),
                None => return Ok(()),
            };
            tracing::trace!("recv: {}", line.trim_end());

            let reply = match Command::parse(&line) {
                Err(err) => SmtpReply::new(
                    501,
                    format!("Syntax error in command or arguments: {err}"),
                )
                .enhanced(5, 5, 2),
                Ok(Command::Quit) => {
                    self.write_response(221, "2.0.0 Bye").await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.session.reset();
                    let response = self.ehlo_response(&domain);
                    self.conn.helo.replace(domain);
                    SmtpReply::new(250, response)
                }
                Ok(Command::Helo(domain)) => {
                    self.session.reset();
                    let response = format!("{} Hello {domain}", self.ctx.config.server_name);
                    self.conn.helo.replace(domain);
                    SmtpReply::new(250, response)
                }
                Ok(Command::StartTls) => {
                    if self.conn.tls.is_some() {
                        SmtpReply::new(503, "TLS already active").enhanced(5, 5, 1)
                    } else {
                        self.write_response(220, "2.0.0 Ready to start TLS").await?;
                        self.start_tls().await?;
                        // Nothing learned over plaintext survives the upgrade
                        self.conn.helo.take();
                        self.authenticated.take();
                        self.session = Session::new(self.ctx.clone(), Direction::Inbound);
                        continue;
                    }
                }
                Ok(Command::Auth {
                    sasl_mech,
                    initial_response,
                }) => self.authenticate(&sasl_mech, initial_response).await?,
                Ok(Command::MailFrom { address, .. }) => {
                    match self.session.mail(&self.conn, &address).await {
                        Ok(()) => SmtpReply::new(250, "Ok").enhanced(2, 1, 0),
                        Err(err) => err.reply(),
                    }
                }
                Ok(Command::RcptTo { address, .. }) => match self.session.rcpt(&address) {
                    Ok(()) => SmtpReply::new(250, "Ok").enhanced(2, 1, 5),
                    Err(err) => err.reply(),
                },
                Ok(Command::Data) => self.data().await?,
                Ok(Command::Rset) => {
                    self.session.reset();
                    SmtpReply::new(250, "Ok").enhanced(2, 0, 0)
                }
                Ok(Command::Noop(_)) => SmtpReply::new(250, "Ok").enhanced(2, 0, 0),
                Ok(cmd @ (Command::Lhlo(_) | Command::DataDot)) => {
                    SmtpReply::new(502, format!("Command unrecognized: {}", cmd.encode().trim_end()))
                        .enhanced(5, 5, 2)
                }
                Ok(Command::Unknown(cmd)) => {
                    SmtpReply::new(502, format!("Command unrecognized: {cmd}")).enhanced(5, 5, 2)
                }
            };

            self.write_reply(&reply).await?;
            if reply.close {
                return Ok(());
            }
        }
    }

    async fn data(&mut self) -> anyhow::Result<SmtpReply> {
        if let Err(err) = self.session.expect_data() {
            return Ok(err.reply());
        }
        self.write_response(354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let max_size = self.ctx.config.listener.max_message_size;
        let mut data = vec![];
        let mut too_big = false;
        loop {
            let line = self
                .read_line(MAX_DATA_LINE_LEN)
                .await?
                .context("connection closed during DATA")?;
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(&line);
            if too_big || data.len() + line.len() > max_size {
                too_big = true;
                continue;
            }
            data.extend_from_slice(line);
        }

        if too_big {
            self.session.reset();
            return Ok(RelayError::MessageTooBig.reply());
        }

        tracing::trace!("message data is {} bytes", data.len());
        Ok(match self.session.data(&self.conn, &data).await {
            Ok(()) => SmtpReply::new(250, "Ok: queued").enhanced(2, 0, 0),
            Err(err) => err.reply(),
        })
    }

    /// Writes a `334` challenge and returns the client's answer,
    /// or None when the client cancels the exchange with `*`
    async fn challenge(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        self.write_response(334, prompt).await?;
        let line = self
            .read_line(MAX_LINE_LEN)
            .await?
            .context("connection closed during AUTH")?;
        let line = String::from_utf8_lossy(&line).trim().to_string();
        Ok(if line == "*" { None } else { Some(line) })
    }

    async fn authenticate(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> anyhow::Result<SmtpReply> {
        if self.session.in_transaction() {
            return Ok(RelayError::BadSequence.reply());
        }
        if self.authenticated.is_some() {
            return Ok(SmtpReply::new(503, "Already authenticated").enhanced(5, 5, 1));
        }
        if !self.auth_permitted() {
            return Ok(SmtpReply::new(
                538,
                "Encryption required for requested authentication mechanism",
            )
            .enhanced(5, 7, 11));
        }

        let cancelled = || SmtpReply::new(501, "Authentication cancelled").enhanced(5, 0, 0);
        let malformed = || SmtpReply::new(501, "Malformed authentication response").enhanced(5, 5, 2);

        let (username, password) = match mechanism {
            "PLAIN" => {
                let response = match initial_response {
                    Some(response) => response,
                    None => match self.challenge("").await? {
                        Some(response) => response,
                        None => return Ok(cancelled()),
                    },
                };
                match decode_plain(&response) {
                    Some(credentials) => credentials,
                    None => return Ok(malformed()),
                }
            }
            "LOGIN" => {
                let username = match initial_response {
                    Some(response) => response,
                    // "Username:"
                    None => match self.challenge("VXNlcm5hbWU6").await? {
                        Some(response) => response,
                        None => return Ok(cancelled()),
                    },
                };
                // "Password:"
                let password = match self.challenge("UGFzc3dvcmQ6").await? {
                    Some(response) => response,
                    None => return Ok(cancelled()),
                };
                match (decode_base64(&username), decode_base64(&password)) {
                    (Some(username), Some(password)) => (username, password),
                    _ => return Ok(malformed()),
                }
            }
            _ => {
                return Ok(SmtpReply::new(504, "Unrecognized authentication type").enhanced(5, 5, 4))
            }
        };

        let valid = self
            .ctx
            .config
            .users
            .iter()
            .any(|user| user.name == username && user.password == password);
        if !valid {
            tracing::info!(user = username, mechanism, "authentication failed");
            return Ok(SmtpReply::new(535, "Authentication credentials invalid").enhanced(5, 7, 8));
        }

        tracing::info!(user = username, mechanism, "authenticated");
        self.authenticated.replace(username);
        self.session = Session::new(self.ctx.clone(), Direction::Outbound);
        Ok(SmtpReply::new(235, "Authentication successful").enhanced(2, 7, 0))
    }
}

fn decode_base64(text: &str) -> Option<String> {
    let bytes = BASE64.decode(text.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// `authzid NUL authcid NUL passwd` (RFC 4616)
fn decode_plain(text: &str) -> Option<(String, String)> {
    let decoded = decode_base64(text)?;
    let mut fields = decoded.split('\0');
    let _authzid = fields.next()?;
    let username = fields.next()?;
    let password = fields.next()?;
    if fields.next().is_some() || username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}
