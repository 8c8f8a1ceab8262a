use crate::codec::{BoxedAsyncReadAndWrite, LineCodec};
use crate::error::SessionError;
use crate::sasl::{decode_login, decode_plain, LOGIN_PASSWORD_PROMPT, LOGIN_USER_PROMPT};
use crate::server::ServerContext;
use mailnest_store::{ReceivedMessage, StoreError};
use std::sync::Arc;
use std::time::Duration;

pub struct SmtpSession {
    codec: Option<LineCodec>,
    ctx: Arc<ServerContext>,
    state: Option<TransactionState>,
    said_hello: Option<String>,
    authenticated: bool,
    tls_active: bool,
}

#[derive(Debug)]
struct TransactionState {
    sender: String,
    recipients: Vec<String>,
}

impl SmtpSession {
    pub async fn run(
        stream: BoxedAsyncReadAndWrite,
        ctx: Arc<ServerContext>,
        tls_active: bool,
    ) -> Result<(), SessionError> {
        let codec = LineCodec::new(
            stream,
            ctx.config.max_line_length,
            Some(Duration::from_millis(ctx.config.read_timeout_ms)),
        );
        let mut session = SmtpSession {
            codec: Some(codec),
            ctx,
            state: None,
            said_hello: None,
            authenticated: false,
            tls_active,
        };
        session.process().await
    }

    fn codec(&mut self) -> &mut LineCodec {
        self.codec.as_mut().expect("codec present outside starttls")
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> Result<(), SessionError> {
        let codec = self.codec();
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            codec.write_line(&format!("{status}{sep}{line}")).await?;
        }
        codec.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        self.codec()
            .read_line()
            .await?
            .ok_or(SessionError::ConnectionClosed)
    }

    async fn process(&mut self) -> Result<(), SessionError> {
        let hostname = self.ctx.config.mail_hostname.clone();
        self.write_response(220, format!("{hostname} mailnest ESMTP service ready"))
            .await?;
        loop {
            let line = self.read_line().await?;

            match Command::parse(&line) {
                Err(err) => {
                    self.write_response(500, format!("Syntax error in command or arguments: {err}"))
                        .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, format!("{hostname} Service closing transmission channel"))
                        .await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    let mut reply = format!("{hostname} Hello {domain}\nPIPELINING\n8BITMIME");
                    match self.ctx.config.max_message_size {
                        Some(limit) => reply.push_str(&format!("\nSIZE {limit}")),
                        None => reply.push_str("\nSIZE"),
                    }
                    reply.push_str("\nAUTH PLAIN LOGIN");
                    if self.ctx.tls.is_some() && !self.tls_active {
                        reply.push_str("\nSTARTTLS");
                    }
                    self.write_response(250, reply).await?;
                    self.said_hello.replace(domain);
                }
                Ok(Command::Helo(domain)) => {
                    self.write_response(250, format!("{hostname} Hello {domain}"))
                        .await?;
                    self.said_hello.replace(domain);
                }
                Ok(Command::Mail {
                    address,
                    parameters,
                }) => {
                    if self.said_hello.is_none() {
                        self.write_response(503, "Send hello first").await?;
                        continue;
                    }
                    if self.state.is_some() {
                        self.write_response(503, "MAIL FROM already issued; you must RSET first")
                            .await?;
                        continue;
                    }
                    if let Some(limit) = self.ctx.config.max_message_size {
                        let declared = parameters
                            .iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case("SIZE"))
                            .and_then(|(_, value)| value.as_deref())
                            .and_then(|value| value.parse::<usize>().ok());
                        if declared.map_or(false, |size| size > limit) {
                            self.write_response(552, "Message size exceeds fixed maximum")
                                .await?;
                            continue;
                        }
                    }
                    self.write_response(250, "OK").await?;
                    self.state.replace(TransactionState {
                        sender: address,
                        recipients: vec![],
                    });
                }
                Ok(Command::Rcpt { address }) => {
                    if self.state.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    // Directory pre-check: unknown recipients are
                    // rejected here, not after the DATA dot.
                    match self.ctx.users.resolve_recipient(&address) {
                        Ok(_) => {
                            self.write_response(250, "OK").await?;
                            self.state
                                .as_mut()
                                .expect("checked state above")
                                .recipients
                                .push(address);
                        }
                        Err(StoreError::NoSuchUser(_)) => {
                            self.write_response(550, format!("{address}: no such mailbox here"))
                                .await?;
                        }
                        Err(err) => {
                            self.write_response(451, format!("Requested action aborted: {err}"))
                                .await?;
                        }
                    }
                }
                Ok(Command::Data) => {
                    if self.state.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    if self
                        .state
                        .as_ref()
                        .map(|s| s.recipients.is_empty())
                        .unwrap_or(true)
                    {
                        self.write_response(503, "RCPT TO must be issued first")
                            .await?;
                        continue;
                    }
                    self.write_response(354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let mut data: Vec<u8> = vec![];
                    loop {
                        let line = self
                            .codec()
                            .read_line_bytes()
                            .await?
                            .ok_or(SessionError::ConnectionClosed)?;
                        if line == b"." {
                            break;
                        }
                        data.extend_from_slice(unstuff(&line));
                        data.extend_from_slice(b"\r\n");
                    }

                    if let Some(limit) = self.ctx.config.max_message_size {
                        if data.len() > limit {
                            self.state.take();
                            self.write_response(552, "Message size exceeds fixed maximum")
                                .await?;
                            continue;
                        }
                    }

                    let state = self.state.take().expect("checked state above");
                    let message = ReceivedMessage {
                        from: state.sender,
                        rcpts: state.recipients,
                        raw: data,
                    };
                    match self.ctx.delivery.deliver(&message) {
                        Ok(()) => {
                            self.write_response(250, "OK message accepted for delivery")
                                .await?;
                        }
                        Err(err) => {
                            tracing::warn!("delivery failed: {err}");
                            self.write_response(451, "Requested action aborted: local error")
                                .await?;
                        }
                    }
                }
                Ok(Command::Rset) => {
                    self.state.take();
                    self.write_response(250, "OK").await?;
                }
                Ok(Command::Noop) => {
                    self.write_response(250, "OK").await?;
                }
                Ok(Command::Vrfy(_)) => {
                    self.write_response(
                        252,
                        "Cannot VRFY user, but will accept message and attempt delivery",
                    )
                    .await?;
                }
                Ok(Command::StartTls) => {
                    if self.tls_active {
                        self.write_response(503, "TLS already active").await?;
                        continue;
                    }
                    if self.ctx.tls.is_none() {
                        self.write_response(454, "TLS not available").await?;
                        continue;
                    }
                    self.write_response(220, "Ready to start TLS").await?;
                    self.start_tls().await?;
                }
                Ok(Command::Auth { mechanism, initial }) => {
                    self.handle_auth(&mechanism, initial).await?;
                }
                Ok(Command::Unknown(cmd)) => {
                    self.write_response(502, format!("Command unrecognized/unimplemented: {cmd}"))
                        .await?;
                }
            }
        }
    }

    async fn start_tls(&mut self) -> Result<(), SessionError> {
        let acceptor = self
            .ctx
            .tls
            .clone()
            .expect("checked by the STARTTLS handler");
        let codec = self.codec.take().expect("codec present outside starttls");
        let stream = codec.into_stream();
        let tls = acceptor.accept(stream).await?;
        self.codec = Some(LineCodec::new(
            Box::new(tls),
            self.ctx.config.max_line_length,
            Some(Duration::from_millis(self.ctx.config.read_timeout_ms)),
        ));
        // Fresh wire, fresh protocol state: the client must re-EHLO.
        self.tls_active = true;
        self.said_hello = None;
        self.state = None;
        self.authenticated = false;
        Ok(())
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), SessionError> {
        let credentials = match mechanism {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => {
                        self.write_response(334, "").await?;
                        self.read_line().await?
                    }
                };
                if payload == "*" {
                    self.write_response(501, "Authentication cancelled").await?;
                    return Ok(());
                }
                decode_plain(&payload)
            }
            "LOGIN" => {
                self.write_response(334, LOGIN_USER_PROMPT).await?;
                let login = self.read_line().await?;
                self.write_response(334, LOGIN_PASSWORD_PROMPT).await?;
                let password = self.read_line().await?;
                decode_login(&login, &password)
            }
            _ => {
                self.write_response(504, "Unrecognized authentication type")
                    .await?;
                return Ok(());
            }
        };

        let Some((login, password)) = credentials else {
            self.write_response(501, "Cannot decode response").await?;
            return Ok(());
        };
        match self.ctx.users.authenticate(&login, &password) {
            Ok(_) => {
                self.authenticated = true;
                self.write_response(235, "Authentication successful").await?;
            }
            Err(_) => {
                self.write_response(535, "Authentication credentials invalid")
                    .await?;
            }
        }
        Ok(())
    }
}

/// Reverse SMTP dot-stuffing on one received line.
fn unstuff(line: &[u8]) -> &[u8] {
    line.strip_prefix(b".").unwrap_or(line)
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ehlo(String),
    Helo(String),
    Mail {
        address: String,
        parameters: Vec<(String, Option<String>)>,
    },
    Rcpt {
        address: String,
    },
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Vrfy(String),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> Result<(&str, &str), String> {
            let line = line.trim_start();
            if !line.starts_with('<') {
                return Err(format!("expected <: {line:?}"));
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| format!("expected >: {line:?}"))?;
            Ok((&line[1..rangle], &line[rangle + 1..]))
        }

        fn extract_parameters(rest: &str) -> Vec<(String, Option<String>)> {
            rest.split_whitespace()
                .map(|param| match param.split_once('=') {
                    Some((name, value)) => (name.to_string(), Some(value.to_string())),
                    None => (param.to_string(), None),
                })
                .collect()
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].trim().to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].trim().to_string())
        } else if prefix_match(line, "VRFY ") {
            Self::Vrfy(line[5..].trim().to_string())
        } else if prefix_match(line, "AUTH ") {
            let mut fields = line[5..].split_whitespace();
            let mechanism = fields
                .next()
                .ok_or_else(|| "AUTH requires a mechanism".to_string())?
                .to_ascii_uppercase();
            let initial = fields.next().map(|s| s.to_string());
            Self::Auth { mechanism, initial }
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, params) = extract_envelope(&line[10..])?;
            Self::Mail {
                address: address.to_string(),
                parameters: extract_parameters(params),
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (address, _params) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                return Err("Null sender not permitted as a recipient".to_string());
            }
            Self::Rcpt {
                address: address.to_string(),
            }
        } else {
            Self::Unknown(line.to_string())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn command_parser() {
        assert_equal!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_equal!(Command::parse("quit").unwrap(), Command::Quit);
        assert_equal!(
            Command::parse("quite").unwrap(),
            Command::Unknown("quite".to_string())
        );
        assert_equal!(
            Command::parse("MAIL From:<>").unwrap(),
            Command::Mail {
                address: String::new(),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("MAIL From:<user@example.com> SIZE=1024 BODY=8BITMIME").unwrap(),
            Command::Mail {
                address: "user@example.com".to_string(),
                parameters: vec![
                    ("SIZE".to_string(), Some("1024".to_string())),
                    ("BODY".to_string(), Some("8BITMIME".to_string())),
                ],
            }
        );
        assert_equal!(
            Command::parse("rcpt to:<>").unwrap_err(),
            "Null sender not permitted as a recipient".to_string()
        );
        assert_equal!(
            Command::parse("rcpt TO:<user@example.com>").unwrap(),
            Command::Rcpt {
                address: "user@example.com".to_string()
            }
        );
        assert_equal!(
            Command::parse("AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q=").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("dGVzdAB0ZXN0AHRlc3Q=".to_string()),
            }
        );
        assert_equal!(Command::parse("starttls").unwrap(), Command::StartTls);
    }

    #[test]
    fn dot_unstuffing() {
        assert_equal!(unstuff(b".."), b"." as &[u8]);
        assert_equal!(unstuff(b".body"), b"body" as &[u8]);
        assert_equal!(unstuff(b"body."), b"body." as &[u8]);
    }
}
