//! Mock upstream SMTP server.
//!
//! Listens on a random local port, answers every command with a configurable
//! reply and records both the raw command stream and each completed
//! transaction, so tests can assert on exactly what the relay sent upstream.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Notify, RwLock},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Other(String),
}

/// A message the server accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct MockConfig {
    capabilities: Vec<String>,
    mail_from: Reply,
    rcpt_to: Reply,
    data_end: Reply,
    response_delay: Option<Duration>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            capabilities: vec!["mock.upstream.test".into(), "SIZE 10485760".into()],
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data_end: Reply::new(250, "OK: Message accepted"),
            response_delay: None,
        }
    }
}

#[derive(Default)]
struct Recorded {
    commands: RwLock<Vec<SmtpCommand>>,
    messages: RwLock<Vec<ReceivedMessage>>,
    received: Notify,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    stop: Arc<Notify>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.recorded.commands.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<ReceivedMessage> {
        self.recorded.messages.read().await.clone()
    }

    /// Wait until `count` messages were accepted, or the timeout elapses.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<ReceivedMessage> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.recorded.received.notified();
                if self.recorded.messages.read().await.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        self.messages().await
    }

    pub fn shutdown(&self) {
        self.stop.notify_waiters();
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockConfig>,
        recorded: Arc<Recorded>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        let mut sender = String::new();
        let mut recipients = Vec::new();

        writer.write_all(b"220 mock.upstream.test ESMTP\r\n").await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end().to_owned();
            let (verb, argument) = command_line
                .split_once(' ')
                .map_or((command_line.as_str(), ""), |(verb, rest)| (verb, rest));

            let (command, reply) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => {
                    let count = config.capabilities.len();
                    let mut reply = String::new();
                    for (index, capability) in config.capabilities.iter().enumerate() {
                        let separator = if index + 1 == count { ' ' } else { '-' };
                        reply.push_str(&format!("250{separator}{capability}\r\n"));
                    }
                    (SmtpCommand::Ehlo(argument.to_owned()), reply.into_bytes())
                }
                "HELO" => (
                    SmtpCommand::Helo(argument.to_owned()),
                    Reply::new(250, "Hello").to_bytes(),
                ),
                "MAIL" => {
                    sender = extract_path(argument);
                    recipients.clear();
                    (
                        SmtpCommand::MailFrom(argument.to_owned()),
                        config.mail_from.to_bytes(),
                    )
                }
                "RCPT" => {
                    if config.rcpt_to.code < 400 {
                        recipients.push(extract_path(argument));
                    }
                    (
                        SmtpCommand::RcptTo(argument.to_owned()),
                        config.rcpt_to.to_bytes(),
                    )
                }
                "DATA" => (SmtpCommand::Data, Reply::new(354, "Go ahead").to_bytes()),
                "RSET" => {
                    sender.clear();
                    recipients.clear();
                    (SmtpCommand::Rset, Reply::new(250, "OK").to_bytes())
                }
                "NOOP" => (SmtpCommand::Noop, Reply::new(250, "OK").to_bytes()),
                "QUIT" => (SmtpCommand::Quit, Reply::new(221, "Bye").to_bytes()),
                _ => (
                    SmtpCommand::Other(command_line.clone()),
                    Reply::new(500, "Unknown command").to_bytes(),
                ),
            };

            recorded.commands.write().await.push(command.clone());

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            writer.write_all(&reply).await?;
            writer.flush().await?;

            match command {
                SmtpCommand::Quit => return Ok(()),
                SmtpCommand::Data => {
                    let content = Self::read_content(&mut reader).await?;

                    if config.data_end.code < 400 {
                        recorded.messages.write().await.push(ReceivedMessage {
                            sender: std::mem::take(&mut sender),
                            recipients: std::mem::take(&mut recipients),
                            content,
                        });
                        recorded.received.notify_waiters();
                    }

                    writer.write_all(&config.data_end.to_bytes()).await?;
                    writer.flush().await?;
                }
                _ => {}
            }
        }
    }

    async fn read_content<R>(reader: &mut R) -> std::io::Result<String>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut content = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(content);
            }

            if line == ".\r\n" || line == ".\n" {
                return Ok(content);
            }

            content.push_str(line.strip_prefix('.').unwrap_or(&line));
        }
    }
}

fn extract_path(argument: &str) -> String {
    argument
        .split_once(':')
        .map_or(argument, |(_, path)| path)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_owned()
}

pub struct MockSmtpServerBuilder {
    config: MockConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = Reply::new(code, message);
        self
    }

    /// The reply after `<CRLF>.<CRLF>`.
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let recorded = Arc::new(Recorded::default());
        let stop = Arc::new(Notify::new());

        let task_recorded = Arc::clone(&recorded);
        let task_stop = Arc::clone(&stop);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_stop.notified() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { continue };
                        let config = Arc::clone(&config);
                        let recorded = Arc::clone(&task_recorded);
                        tokio::spawn(async move {
                            if let Err(err) = MockSmtpServer::handle_client(stream, config, recorded).await {
                                eprintln!("mock upstream client error: {err}");
                            }
                        });
                    }
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            recorded,
            stop,
        })
    }
}
