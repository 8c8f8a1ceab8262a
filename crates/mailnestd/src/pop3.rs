use crate::codec::{BoxedAsyncReadAndWrite, LineCodec};
use crate::error::SessionError;
use crate::server::ServerContext;
use data_encoding::HEXLOWER;
use mailnest_store::User;
use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;

struct PopEntry {
    uid: u32,
    size: usize,
    deleted: bool,
}

/// POP3 per RFC 1939: AUTHORIZATION until USER/PASS or APOP succeed,
/// then TRANSACTION against a snapshot of the INBOX, then UPDATE at
/// QUIT. Deletions are session-local until UPDATE; a dropped
/// connection changes nothing.
pub struct Pop3Session {
    codec: LineCodec,
    ctx: Arc<ServerContext>,
    user: Option<Arc<User>>,
    pending_login: Option<String>,
    snapshot: Vec<PopEntry>,
    banner: String,
}

impl Pop3Session {
    pub async fn run(
        stream: BoxedAsyncReadAndWrite,
        ctx: Arc<ServerContext>,
    ) -> Result<(), SessionError> {
        let codec = LineCodec::new(
            stream,
            ctx.config.max_line_length,
            Some(Duration::from_millis(ctx.config.read_timeout_ms)),
        );
        let banner = format!(
            "<{}.{}@{}>",
            std::process::id(),
            chrono::Utc::now().timestamp_micros(),
            ctx.config.mail_hostname
        );
        let mut session = Pop3Session {
            codec,
            ctx,
            user: None,
            pending_login: None,
            snapshot: vec![],
            banner,
        };
        session.process().await
    }

    async fn ok<S: AsRef<str>>(&mut self, message: S) -> Result<(), SessionError> {
        self.codec
            .write_line(&format!("+OK {}", message.as_ref()))
            .await?;
        self.codec.flush().await
    }

    async fn err<S: AsRef<str>>(&mut self, message: S) -> Result<(), SessionError> {
        self.codec
            .write_line(&format!("-ERR {}", message.as_ref()))
            .await?;
        self.codec.flush().await
    }

    /// Resolve a message-number argument against the snapshot.
    /// Returns `(number, uid, size, deleted)` as plain values.
    fn entry(&self, arg: Option<&str>) -> Option<(usize, u32, usize, bool)> {
        let number: usize = arg?.parse().ok()?;
        let entry = self.snapshot.get(number.checked_sub(1)?)?;
        Some((number, entry.uid, entry.size, entry.deleted))
    }

    async fn process(&mut self) -> Result<(), SessionError> {
        let greeting = format!(
            "{} mailnest POP3 service ready {}",
            self.ctx.config.mail_hostname, self.banner
        );
        self.ok(greeting).await?;

        loop {
            let Some(line) = self.codec.read_line().await? else {
                // Dropped without QUIT: no UPDATE phase.
                return Ok(());
            };
            let mut fields = line.split_whitespace();
            let verb = fields
                .next()
                .map(|v| v.to_ascii_uppercase())
                .unwrap_or_default();
            let arg1 = fields.next();
            let arg2 = fields.next();

            let in_transaction = self.user.is_some();
            match verb.as_str() {
                "CAPA" => {
                    self.ok("capability list follows").await?;
                    for cap in ["USER", "UIDL", "TOP"] {
                        self.codec.write_line(cap).await?;
                    }
                    self.codec.write_line(".").await?;
                    self.codec.flush().await?;
                }
                "QUIT" => {
                    if in_transaction {
                        self.apply_deletions();
                    }
                    self.ok("mailnest POP3 service signing off").await?;
                    return Ok(());
                }
                "USER" if !in_transaction => match arg1 {
                    Some(login) => {
                        self.pending_login = Some(login.to_string());
                        self.ok("send PASS").await?;
                    }
                    None => self.err("USER requires a name").await?,
                },
                "PASS" if !in_transaction => {
                    let Some(login) = self.pending_login.take() else {
                        self.err("send USER first").await?;
                        continue;
                    };
                    // The password may contain spaces.
                    let password = line.splitn(2, ' ').nth(1).unwrap_or("");
                    match self.ctx.users.authenticate(&login, password) {
                        Ok(user) => self.enter_transaction(user).await?,
                        Err(_) => self.err("invalid credentials").await?,
                    }
                }
                "APOP" if !in_transaction => {
                    let (Some(login), Some(digest)) = (arg1, arg2) else {
                        self.err("APOP requires name and digest").await?;
                        continue;
                    };
                    match self.check_apop(login, digest) {
                        Some(user) => self.enter_transaction(user).await?,
                        None => self.err("invalid credentials").await?,
                    }
                }
                "STAT" if in_transaction => {
                    let (count, octets) = self
                        .snapshot
                        .iter()
                        .filter(|e| !e.deleted)
                        .fold((0usize, 0usize), |(n, total), e| (n + 1, total + e.size));
                    self.ok(format!("{count} {octets}")).await?;
                }
                "LIST" if in_transaction => match arg1 {
                    Some(_) => match self.entry(arg1) {
                        Some((number, _, size, false)) => {
                            self.ok(format!("{number} {size}")).await?;
                        }
                        _ => self.err("no such message").await?,
                    },
                    None => {
                        let lines: Vec<String> = self
                            .snapshot
                            .iter()
                            .enumerate()
                            .filter(|(_, e)| !e.deleted)
                            .map(|(idx, e)| format!("{} {}", idx + 1, e.size))
                            .collect();
                        self.ok(format!("{} messages", lines.len())).await?;
                        for line in lines {
                            self.codec.write_line(&line).await?;
                        }
                        self.codec.write_line(".").await?;
                        self.codec.flush().await?;
                    }
                },
                "UIDL" if in_transaction => match arg1 {
                    Some(_) => match self.entry(arg1) {
                        Some((number, uid, _, false)) => {
                            self.ok(format!("{number} {uid}")).await?;
                        }
                        _ => self.err("no such message").await?,
                    },
                    None => {
                        let lines: Vec<String> = self
                            .snapshot
                            .iter()
                            .enumerate()
                            .filter(|(_, e)| !e.deleted)
                            .map(|(idx, e)| format!("{} {}", idx + 1, e.uid))
                            .collect();
                        self.ok("unique-id listing follows").await?;
                        for line in lines {
                            self.codec.write_line(&line).await?;
                        }
                        self.codec.write_line(".").await?;
                        self.codec.flush().await?;
                    }
                },
                "RETR" if in_transaction => {
                    // Session-deleted messages stay visible to RETR
                    // until UPDATE actually removes them.
                    let Some((_, uid, _, _)) = self.entry(arg1) else {
                        self.err("no such message").await?;
                        continue;
                    };
                    match self.lookup_message(uid) {
                        Some(raw) => {
                            self.ok(format!("{} octets", raw.len())).await?;
                            let stuffed = stuff_dots(&raw);
                            self.codec.write_raw(&stuffed).await?;
                            self.codec.write_line(".").await?;
                            self.codec.flush().await?;
                        }
                        None => self.err("no such message").await?,
                    }
                }
                "TOP" if in_transaction => {
                    let Some(count) = arg2.and_then(|a| a.parse::<usize>().ok()) else {
                        self.err("TOP requires message number and line count").await?;
                        continue;
                    };
                    let Some((_, uid, _, _)) = self.entry(arg1) else {
                        self.err("no such message").await?;
                        continue;
                    };
                    match self.lookup_message(uid) {
                        Some(raw) => {
                            self.ok("top of message follows").await?;
                            let stuffed = stuff_dots(&top_of_message(&raw, count));
                            self.codec.write_raw(&stuffed).await?;
                            self.codec.write_line(".").await?;
                            self.codec.flush().await?;
                        }
                        None => self.err("no such message").await?,
                    }
                }
                "DELE" if in_transaction => {
                    let Some(number) = arg1.and_then(|a| a.parse::<usize>().ok()) else {
                        self.err("DELE requires a message number").await?;
                        continue;
                    };
                    let marked = match self
                        .snapshot
                        .get_mut(number.wrapping_sub(1))
                        .filter(|e| !e.deleted)
                    {
                        Some(entry) => {
                            entry.deleted = true;
                            true
                        }
                        None => false,
                    };
                    if marked {
                        self.ok(format!("message {number} deleted")).await?;
                    } else {
                        self.err("no such message").await?;
                    }
                }
                "RSET" if in_transaction => {
                    for entry in &mut self.snapshot {
                        entry.deleted = false;
                    }
                    self.ok("OK").await?;
                }
                "NOOP" if in_transaction => self.ok("OK").await?,
                "USER" | "PASS" | "APOP" => {
                    self.err("command not allowed in this state").await?;
                }
                "STAT" | "LIST" | "UIDL" | "RETR" | "TOP" | "DELE" | "RSET" | "NOOP" => {
                    self.err("command not allowed in this state").await?;
                }
                _ => self.err("unknown command").await?,
            }
        }
    }

    async fn enter_transaction(&mut self, user: Arc<User>) -> Result<(), SessionError> {
        // Number 1..N in insertion order, fixed for the session.
        let inbox = self.ctx.store.inbox(&user.login)?;
        self.snapshot = inbox.with_messages(|messages| {
            messages
                .iter()
                .map(|m| PopEntry {
                    uid: m.uid,
                    size: m.size(),
                    deleted: false,
                })
                .collect()
        });
        self.user = Some(user);
        let count = self.snapshot.len();
        self.ok(format!("mailbox locked and ready, {count} messages"))
            .await
    }

    fn check_apop(&self, login: &str, digest: &str) -> Option<Arc<User>> {
        if self.ctx.users.auth_disabled() {
            return self.ctx.users.authenticate(login, "").ok();
        }
        let user = self.ctx.users.get_user(login)?;
        let expected = apop_digest(&self.banner, user.password());
        if expected.eq_ignore_ascii_case(digest) {
            Some(user)
        } else {
            None
        }
    }

    fn lookup_message(&self, uid: u32) -> Option<Arc<[u8]>> {
        let user = self.user.as_ref()?;
        let inbox = self.ctx.store.inbox(&user.login).ok()?;
        inbox.message_by_uid(uid).map(|m| m.raw_shared())
    }

    /// UPDATE phase: apply session deletions against current store
    /// state. Messages whose UID is gone are skipped silently.
    fn apply_deletions(&mut self) {
        let Some(user) = self.user.as_ref() else {
            return;
        };
        let Ok(inbox) = self.ctx.store.inbox(&user.login) else {
            return;
        };
        for entry in self.snapshot.iter().filter(|e| e.deleted) {
            inbox.remove_by_uid(entry.uid);
        }
    }
}

fn apop_digest(banner: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(banner.as_bytes());
    hasher.update(password.as_bytes());
    HEXLOWER.encode(&hasher.finalize())
}

/// Apply POP3 byte-stuffing: any line starting with `.` gets one
/// more, and the payload always ends with a line terminator.
fn stuff_dots(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 16);
    let mut at_line_start = true;
    for &byte in raw {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// The headers plus the first `count` lines of the body, for TOP.
fn top_of_message(raw: &[u8], count: usize) -> Vec<u8> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
        .unwrap_or(raw.len());
    let mut out = raw[..split].to_vec();
    let mut taken = 0;
    let mut line_start = split;
    for idx in split..raw.len() {
        if raw[idx] == b'\n' {
            out.extend_from_slice(&raw[line_start..=idx]);
            line_start = idx + 1;
            taken += 1;
            if taken == count {
                break;
            }
        }
    }
    if taken < count && line_start < raw.len() {
        out.extend_from_slice(&raw[line_start..]);
    }
    out
}
