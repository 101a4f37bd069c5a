//! A scriptable SMTP/LMTP sink used by the session and delivery tests
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub mail_from: String,
    pub rcpt_to: String,
    pub data: String,
}

#[derive(Default)]
struct SinkState {
    transactions: Mutex<Vec<Transaction>>,
    connections: AtomicUsize,
    quits: AtomicUsize,
}

#[derive(Clone)]
pub struct MockSink {
    state: Arc<SinkState>,
    /// Reply sent to every RCPT TO
    rcpt_reply: Arc<String>,
    pub addr: SocketAddr,
}

fn extract_path(line: &str) -> String {
    line.split_once(':')
        .map(|(_, rest)| rest.trim().trim_start_matches('<'))
        .and_then(|rest| rest.split('>').next())
        .unwrap_or("")
        .to_string()
}

impl MockSink {
    pub async fn start() -> Self {
        Self::start_with_rcpt_reply("250 2.1.5 ok").await
    }

    /// A sink that answers RCPT TO with `reply`, eg: to simulate
    /// an exchanger that refuses the recipient.
    pub async fn start_with_rcpt_reply(reply: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = Self {
            state: Arc::new(SinkState::default()),
            rcpt_reply: Arc::new(reply.to_string()),
            addr,
        };
        let accepting = sink.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = accepting.clone();
                tokio::spawn(async move { sink.serve(stream).await });
            }
        });
        sink
    }

    #[cfg(unix)]
    pub async fn start_unix(path: &std::path::Path) -> Self {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let sink = Self {
            state: Arc::new(SinkState::default()),
            rcpt_reply: Arc::new("250 2.1.5 ok".to_string()),
            addr: "127.0.0.1:0".parse().unwrap(),
        };
        let accepting = sink.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = accepting.clone();
                tokio::spawn(async move { sink.serve(stream).await });
            }
        });
        sink
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.transactions.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// How many clients ended their session with QUIT
    pub fn quits(&self) -> usize {
        self.state.quits.load(Ordering::SeqCst)
    }

    async fn serve<S: AsyncRead + AsyncWrite + Unpin>(self, stream: S) {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        let mut stream = BufReader::new(stream);
        let mut mail_from = String::new();
        let mut rcpt_to = String::new();

        macro_rules! reply {
            ($text:expr) => {
                if stream.get_mut().write_all(format!("{}\r\n", $text).as_bytes()).await.is_err() {
                    return;
                }
            };
        }

        reply!("220 sink.example ESMTP");
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let verb = line.get(..4).unwrap_or("").to_ascii_uppercase();
            match verb.as_str() {
                "EHLO" | "LHLO" => reply!("250-sink.example\r\n250-PIPELINING\r\n250 8BITMIME"),
                "HELO" => reply!("250 sink.example"),
                "RSET" | "NOOP" => reply!("250 2.0.0 ok"),
                "MAIL" => {
                    mail_from = extract_path(&line);
                    reply!("250 2.1.0 ok");
                }
                "RCPT" => {
                    rcpt_to = extract_path(&line);
                    reply!(self.rcpt_reply.as_str());
                }
                "DATA" if !self.rcpt_reply.starts_with('2') => {
                    reply!("554 5.5.1 no valid recipients");
                }
                "DATA" => {
                    reply!("354 go ahead");
                    let mut data = String::new();
                    loop {
                        let mut data_line = String::new();
                        match stream.read_line(&mut data_line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        if data_line == ".\r\n" {
                            break;
                        }
                        let data_line = data_line.strip_prefix('.').unwrap_or(&data_line);
                        data.push_str(data_line);
                    }
                    self.state.transactions.lock().push(Transaction {
                        mail_from: mail_from.clone(),
                        rcpt_to: rcpt_to.clone(),
                        data,
                    });
                    reply!("250 2.0.0 queued");
                }
                "QUIT" => {
                    self.state.quits.fetch_add(1, Ordering::SeqCst);
                    reply!("221 bye");
                    return;
                }
                _ => reply!("502 5.5.2 unrecognized"),
            }
        }
    }
}
