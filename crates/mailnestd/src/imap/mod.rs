//! IMAP4rev1 session: NOT AUTHENTICATED -> AUTHENTICATED -> SELECTED
//! -> LOGOUT, with the selected-mailbox state, untagged update
//! delivery and IDLE streaming.
mod fetch;

use crate::codec::{BoxedAsyncReadAndWrite, LineCodec};
use crate::error::SessionError;
use crate::sasl::{decode_login, decode_plain, LOGIN_PASSWORD_PROMPT, LOGIN_USER_PROMPT};
use crate::server::ServerContext;
use chrono::Utc;
use mailnest_store::{
    copy_messages, evaluate, FolderEvent, MailFolder, SearchContext, StoreError, User,
};
use rfc3501::{
    format_flags, parse_request, Command, Flag, Request, SearchKey, Segment, SequenceSet,
    StatusItem, StoreAction,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Upper bound on a single literal, mostly relevant for APPEND.
const MAX_LITERAL: usize = 64 * 1024 * 1024;

struct Selected {
    folder: Arc<MailFolder>,
    read_only: bool,
    events: broadcast::Receiver<FolderEvent>,
    /// Events caused by this session's own commands, whose responses
    /// were already written inline; skipped while draining.
    suppressed: VecDeque<FolderEvent>,
}

pub struct ImapSession {
    codec: Option<LineCodec>,
    ctx: Arc<ServerContext>,
    user: Option<Arc<User>>,
    selected: Option<Selected>,
    tls_active: bool,
}

impl ImapSession {
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
        let mut session = ImapSession {
            codec: Some(codec),
            ctx,
            user: None,
            selected: None,
            tls_active,
        };
        session.process().await
    }

    fn codec(&mut self) -> &mut LineCodec {
        self.codec.as_mut().expect("codec present outside starttls")
    }

    async fn untagged(&mut self, line: &str) -> Result<(), SessionError> {
        self.codec().write_line(&format!("* {line}")).await
    }

    async fn tagged(&mut self, tag: &str, status: &str, text: &str) -> Result<(), SessionError> {
        self.codec()
            .write_line(&format!("{tag} {status} {text}"))
            .await?;
        self.codec().flush().await
    }

    /// Report a store failure as NO. An invariant violation is not a
    /// client problem: log it and drop the connection instead.
    async fn store_no(&mut self, tag: &str, err: StoreError) -> Result<(), SessionError> {
        if matches!(err, StoreError::Internal(_)) {
            tracing::error!("store invariant violation: {err}");
            return Err(SessionError::Store(err));
        }
        self.tagged(tag, "NO", &err.to_string()).await
    }

    fn capabilities(&self) -> String {
        let mut caps =
            "IMAP4rev1 LITERAL+ IDLE UIDPLUS NAMESPACE QUOTA AUTH=PLAIN AUTH=LOGIN".to_string();
        if self.ctx.tls.is_some() && !self.tls_active {
            caps.push_str(" STARTTLS");
        }
        caps
    }

    async fn process(&mut self) -> Result<(), SessionError> {
        let hostname = self.ctx.config.mail_hostname.clone();
        self.untagged(&format!(
            "OK [CAPABILITY {}] {hostname} mailnest IMAP4rev1 service ready",
            self.capabilities()
        ))
        .await?;
        self.codec().flush().await?;

        loop {
            let Some(segments) = self.read_request().await? else {
                return Ok(());
            };
            let request = match parse_request(&segments) {
                Ok(request) => request,
                Err(err) => {
                    let tag = fallback_tag(&segments);
                    self.tagged(&tag, "BAD", &err.to_string()).await?;
                    continue;
                }
            };
            if self.dispatch(request).await? {
                return Ok(());
            }
        }
    }

    /// Read one logical command line, serving literal continuations.
    async fn read_request(&mut self) -> Result<Option<Vec<Segment>>, SessionError> {
        let mut segments = vec![];
        loop {
            let Some(line) = self.codec().read_line().await? else {
                if segments.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::Protocol(
                    "connection closed inside a command".to_string(),
                ));
            };
            match rfc3501::literal_suffix(&line) {
                Some((count, non_synchronizing)) => {
                    if count as usize > MAX_LITERAL {
                        return Err(SessionError::Protocol(format!(
                            "literal of {count} octets is too large"
                        )));
                    }
                    segments.push(Segment::Text(
                        rfc3501::strip_literal_suffix(&line).to_string(),
                    ));
                    if !non_synchronizing {
                        self.codec().write_line("+ Ready for literal data").await?;
                        self.codec().flush().await?;
                    }
                    let bytes = self.codec().read_exact(count as usize).await?;
                    segments.push(Segment::Literal(bytes));
                }
                None => {
                    segments.push(Segment::Text(line));
                    return Ok(Some(segments));
                }
            }
        }
    }

    /// Returns true when the session should end (LOGOUT).
    async fn dispatch(&mut self, request: Request) -> Result<bool, SessionError> {
        let Request { tag, command } = request;
        match command {
            Command::Capability => {
                let caps = self.capabilities();
                self.untagged(&format!("CAPABILITY {caps}")).await?;
                self.tagged(&tag, "OK", "CAPABILITY completed").await?;
            }
            Command::Noop => {
                self.poll_updates().await?;
                self.tagged(&tag, "OK", "NOOP completed").await?;
            }
            Command::Logout => {
                self.untagged("BYE mailnest IMAP4rev1 server terminating connection")
                    .await?;
                self.tagged(&tag, "OK", "LOGOUT completed").await?;
                return Ok(true);
            }
            Command::StartTls => {
                if self.tls_active {
                    self.tagged(&tag, "NO", "TLS already active").await?;
                } else if self.ctx.tls.is_none() {
                    self.tagged(&tag, "NO", "TLS not available").await?;
                } else {
                    self.tagged(&tag, "OK", "Begin TLS negotiation now").await?;
                    self.start_tls().await?;
                }
            }
            Command::Login { username, password } => {
                if self.user.is_some() {
                    self.tagged(&tag, "NO", "already authenticated").await?;
                } else {
                    match self.ctx.users.authenticate(&username, &password) {
                        Ok(user) => {
                            self.user = Some(user);
                            self.tagged(&tag, "OK", "LOGIN completed").await?;
                        }
                        Err(_) => {
                            self.tagged(&tag, "NO", "LOGIN failed: invalid credentials")
                                .await?;
                        }
                    }
                }
            }
            Command::Authenticate {
                mechanism,
                initial_response,
            } => {
                if self.user.is_some() {
                    self.tagged(&tag, "NO", "already authenticated").await?;
                } else {
                    self.handle_authenticate(&tag, &mechanism, initial_response)
                        .await?;
                }
            }
            _ if self.user.is_none() => {
                self.tagged(&tag, "NO", "please authenticate first").await?;
            }
            Command::Select { mailbox } => self.handle_select(&tag, &mailbox, false).await?,
            Command::Examine { mailbox } => self.handle_select(&tag, &mailbox, true).await?,
            Command::Create { mailbox } => {
                let login = self.login();
                match self.ctx.store.create_mailbox(&login, &mailbox) {
                    Ok(_) => self.tagged(&tag, "OK", "CREATE completed").await?,
                    Err(err) => self.store_no(&tag, err).await?,
                }
            }
            Command::Delete { mailbox } => {
                let login = self.login();
                match self.ctx.store.delete_mailbox(&login, &mailbox) {
                    Ok(()) => self.tagged(&tag, "OK", "DELETE completed").await?,
                    Err(err) => self.store_no(&tag, err).await?,
                }
            }
            Command::Rename { from, to } => {
                let login = self.login();
                match self.ctx.store.rename_mailbox(&login, &from, &to) {
                    Ok(()) => self.tagged(&tag, "OK", "RENAME completed").await?,
                    Err(err) => self.store_no(&tag, err).await?,
                }
            }
            Command::Subscribe { mailbox } => {
                let login = self.login();
                match self.ctx.store.set_subscribed(&login, &mailbox, true) {
                    Ok(()) => self.tagged(&tag, "OK", "SUBSCRIBE completed").await?,
                    Err(err) => self.store_no(&tag, err).await?,
                }
            }
            Command::Unsubscribe { mailbox } => {
                let login = self.login();
                match self.ctx.store.set_subscribed(&login, &mailbox, false) {
                    Ok(()) => self.tagged(&tag, "OK", "UNSUBSCRIBE completed").await?,
                    Err(err) => self.store_no(&tag, err).await?,
                }
            }
            Command::List { reference, pattern } => {
                self.handle_list(&tag, &reference, &pattern, false).await?;
            }
            Command::Lsub { reference, pattern } => {
                self.handle_list(&tag, &reference, &pattern, true).await?;
            }
            Command::Status { mailbox, items } => {
                self.handle_status(&tag, &mailbox, &items).await?;
            }
            Command::Append {
                mailbox,
                flags,
                date,
                message,
            } => {
                self.handle_append(&tag, &mailbox, &flags, date, &message)
                    .await?;
            }
            Command::Namespace => {
                self.untagged("NAMESPACE ((\"\" \"/\")) NIL NIL").await?;
                self.tagged(&tag, "OK", "NAMESPACE completed").await?;
            }
            Command::GetQuotaRoot { mailbox } => {
                self.untagged(&format!("QUOTAROOT \"{mailbox}\" \"\"")).await?;
                self.untagged("QUOTA \"\" (STORAGE 0 1048576)").await?;
                self.tagged(&tag, "OK", "GETQUOTAROOT completed").await?;
            }
            Command::GetQuota { root } => {
                self.untagged(&format!("QUOTA \"{root}\" (STORAGE 0 1048576)"))
                    .await?;
                self.tagged(&tag, "OK", "GETQUOTA completed").await?;
            }
            Command::Idle => self.handle_idle(&tag).await?,
            Command::Check => {
                if self.selected.is_none() {
                    self.tagged(&tag, "NO", "select a mailbox first").await?;
                } else {
                    self.poll_updates().await?;
                    self.tagged(&tag, "OK", "CHECK completed").await?;
                }
            }
            Command::Close => {
                match self.selected.take() {
                    Some(selected) => {
                        if !selected.read_only {
                            selected.folder.expunge(None);
                        }
                        self.tagged(&tag, "OK", "CLOSE completed").await?;
                    }
                    None => self.tagged(&tag, "NO", "select a mailbox first").await?,
                }
            }
            Command::Expunge => self.handle_expunge(&tag, None).await?,
            Command::UidExpunge { set } => self.handle_expunge(&tag, Some(set)).await?,
            Command::Search {
                charset,
                criteria,
                uid,
            } => self.handle_search(&tag, charset, &criteria, uid).await?,
            Command::Fetch { set, items, uid } => {
                self.handle_fetch(&tag, &set, &items, uid).await?;
            }
            Command::Store {
                set,
                action,
                silent,
                flags,
                uid,
            } => {
                self.handle_store(&tag, &set, action, silent, &flags, uid)
                    .await?;
            }
            Command::Copy { set, mailbox, uid } => {
                self.handle_copy(&tag, &set, &mailbox, uid).await?;
            }
        }
        Ok(false)
    }

    /// The authenticated login name. Only called from arms the
    /// dispatcher has already gated behind authentication.
    fn login(&self) -> String {
        self.user
            .as_ref()
            .expect("dispatch checked authentication")
            .login
            .clone()
    }

    fn suppress(&mut self, event: FolderEvent) {
        if let Some(selected) = self.selected.as_mut() {
            selected.suppressed.push_back(event);
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
        self.tls_active = true;
        Ok(())
    }

    async fn handle_authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> Result<(), SessionError> {
        let credentials = match mechanism {
            "PLAIN" => {
                let payload = match initial_response {
                    Some(payload) => payload,
                    None => {
                        self.codec().write_line("+ ").await?;
                        self.codec().flush().await?;
                        match self.codec().read_line().await? {
                            Some(line) => line,
                            None => return Err(SessionError::ConnectionClosed),
                        }
                    }
                };
                if payload == "*" {
                    return self.tagged(tag, "BAD", "authentication cancelled").await;
                }
                decode_plain(&payload)
            }
            "LOGIN" => {
                self.codec()
                    .write_line(&format!("+ {LOGIN_USER_PROMPT}"))
                    .await?;
                self.codec().flush().await?;
                let Some(login) = self.codec().read_line().await? else {
                    return Err(SessionError::ConnectionClosed);
                };
                self.codec()
                    .write_line(&format!("+ {LOGIN_PASSWORD_PROMPT}"))
                    .await?;
                self.codec().flush().await?;
                let Some(password) = self.codec().read_line().await? else {
                    return Err(SessionError::ConnectionClosed);
                };
                if login == "*" || password == "*" {
                    return self.tagged(tag, "BAD", "authentication cancelled").await;
                }
                decode_login(&login, &password)
            }
            _ => {
                return self
                    .tagged(tag, "NO", "unsupported authentication mechanism")
                    .await;
            }
        };

        let Some((login, password)) = credentials else {
            return self.tagged(tag, "BAD", "cannot decode response").await;
        };
        match self.ctx.users.authenticate(&login, &password) {
            Ok(user) => {
                self.user = Some(user);
                self.tagged(tag, "OK", "AUTHENTICATE completed").await
            }
            Err(_) => self.tagged(tag, "NO", "AUTHENTICATE failed").await,
        }
    }

    async fn handle_select(
        &mut self,
        tag: &str,
        mailbox: &str,
        read_only: bool,
    ) -> Result<(), SessionError> {
        let login = self.login();
        let folder = match self.ctx.store.get_folder(&login, mailbox) {
            Ok(folder) if !folder.is_noselect() => folder,
            _ => {
                // A failed SELECT leaves no mailbox selected.
                self.selected = None;
                return self
                    .tagged(tag, "NO", &format!("cannot select mailbox {mailbox}"))
                    .await;
            }
        };

        // Subscribe before reading counts so nothing can slip between
        // the snapshot and the event stream.
        let events = folder.subscribe_events();
        let exists = folder.message_count();
        let recent = folder.recent_count();
        let uid_validity = folder.uid_validity();
        let uid_next = folder.uid_next();
        let first_unseen = folder.first_unseen_seq();

        self.untagged(&format!("{exists} EXISTS")).await?;
        self.untagged(&format!("{recent} RECENT")).await?;
        self.untagged(&format!("OK [UIDVALIDITY {uid_validity}] UIDs valid"))
            .await?;
        self.untagged(&format!("OK [UIDNEXT {uid_next}] Predicted next UID"))
            .await?;
        self.untagged("FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)")
            .await?;
        self.untagged("OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)] Flags permitted")
            .await?;
        if let Some(seq) = first_unseen {
            self.untagged(&format!("OK [UNSEEN {seq}] Message {seq} is first unseen"))
                .await?;
        }

        // \Recent is reported once, then consumed by a read-write
        // select.
        if !read_only {
            folder.clear_recent();
        }

        self.selected = Some(Selected {
            folder,
            read_only,
            events,
            suppressed: VecDeque::new(),
        });
        let (code, verb) = if read_only {
            ("[READ-ONLY]", "EXAMINE")
        } else {
            ("[READ-WRITE]", "SELECT")
        };
        self.tagged(tag, "OK", &format!("{code} {verb} completed")).await
    }

    async fn handle_list(
        &mut self,
        tag: &str,
        reference: &str,
        pattern: &str,
        lsub: bool,
    ) -> Result<(), SessionError> {
        let verb = if lsub { "LSUB" } else { "LIST" };
        if pattern.is_empty() {
            // An empty pattern queries the hierarchy delimiter.
            self.untagged(&format!("{verb} (\\Noselect) \"/\" \"\""))
                .await?;
            return self.tagged(tag, "OK", &format!("{verb} completed")).await;
        }
        let login = self.login();
        let entries = if lsub {
            self.ctx.store.list_subscribed(&login, reference, pattern)
        } else {
            self.ctx.store.list(&login, reference, pattern)
        };
        for entry in entries {
            let mut attrs = vec![];
            if entry.noselect {
                attrs.push("\\Noselect");
            }
            if entry.has_children {
                attrs.push("\\HasChildren");
            } else {
                attrs.push("\\HasNoChildren");
            }
            self.untagged(&format!(
                "{verb} ({}) \"/\" \"{}\"",
                attrs.join(" "),
                entry.path
            ))
            .await?;
        }
        self.tagged(tag, "OK", &format!("{verb} completed")).await
    }

    async fn handle_status(
        &mut self,
        tag: &str,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<(), SessionError> {
        let login = self.login();
        let status = match self.ctx.store.status(&login, mailbox) {
            Ok(status) => status,
            Err(err) => return self.store_no(tag, err).await,
        };
        let rendered: Vec<String> = items
            .iter()
            .map(|item| match item {
                StatusItem::Messages => format!("MESSAGES {}", status.messages),
                StatusItem::Recent => format!("RECENT {}", status.recent),
                StatusItem::UidNext => format!("UIDNEXT {}", status.uid_next),
                StatusItem::UidValidity => format!("UIDVALIDITY {}", status.uid_validity),
                StatusItem::Unseen => format!("UNSEEN {}", status.unseen),
            })
            .collect();
        self.untagged(&format!("STATUS \"{mailbox}\" ({})", rendered.join(" ")))
            .await?;
        self.tagged(tag, "OK", "STATUS completed").await
    }

    async fn handle_append(
        &mut self,
        tag: &str,
        mailbox: &str,
        flags: &[Flag],
        date: Option<chrono::DateTime<chrono::FixedOffset>>,
        message: &[u8],
    ) -> Result<(), SessionError> {
        let login = self.login();
        let folder = match self.ctx.store.get_folder(&login, mailbox) {
            Ok(folder) if !folder.is_noselect() => folder,
            _ => {
                return self
                    .tagged(tag, "NO", "[TRYCREATE] no such mailbox")
                    .await;
            }
        };
        let uid = folder.append(message, flags, date.map(|d| d.with_timezone(&Utc)));
        let uid_validity = folder.uid_validity();
        self.poll_updates().await?;
        self.tagged(
            tag,
            "OK",
            &format!("[APPENDUID {uid_validity} {uid}] APPEND completed"),
        )
        .await
    }

    async fn handle_search(
        &mut self,
        tag: &str,
        charset: Option<String>,
        criteria: &SearchKey,
        uid_mode: bool,
    ) -> Result<(), SessionError> {
        let Some(folder) = self.selected.as_ref().map(|s| s.folder.clone()) else {
            return self.tagged(tag, "NO", "select a mailbox first").await;
        };
        if let Some(charset) = charset {
            let upper = charset.to_ascii_uppercase();
            if upper != "US-ASCII" && upper != "UTF-8" {
                return self
                    .tagged(tag, "NO", "[BADCHARSET (US-ASCII UTF-8)] charset not supported")
                    .await;
            }
        }
        let hits: Vec<u32> = folder.with_messages(|messages| {
            let total = messages.len() as u32;
            let max_uid = messages.last().map(|m| m.uid).unwrap_or(0);
            messages
                .iter()
                .enumerate()
                .filter_map(|(idx, message)| {
                    let parsed = message.parsed().ok()?;
                    let ctx = SearchContext {
                        message,
                        parsed: &parsed,
                        seq: idx as u32 + 1,
                        total,
                        max_uid,
                    };
                    if evaluate(criteria, &ctx) {
                        Some(if uid_mode { message.uid } else { idx as u32 + 1 })
                    } else {
                        None
                    }
                })
                .collect()
        });
        let mut line = "SEARCH".to_string();
        for hit in hits {
            line.push_str(&format!(" {hit}"));
        }
        self.untagged(&line).await?;
        self.poll_updates().await?;
        self.tagged(tag, "OK", "SEARCH completed").await
    }

    async fn handle_fetch(
        &mut self,
        tag: &str,
        set: &SequenceSet,
        items: &[rfc3501::FetchItem],
        uid_mode: bool,
    ) -> Result<(), SessionError> {
        let Some((folder, read_only)) = self
            .selected
            .as_ref()
            .map(|s| (s.folder.clone(), s.read_only))
        else {
            return self.tagged(tag, "NO", "select a mailbox first").await;
        };
        let matched = folder.select_matching(set, uid_mode);
        for (seq, message) in matched {
            let mut extra_flags = None;
            if fetch::needs_seen(items) && !read_only {
                if let Some((flag_seq, flags)) = folder.mark_seen(message.uid) {
                    self.suppress(FolderEvent::FlagsUpdated {
                        uid: message.uid,
                        seq: flag_seq,
                        flags: flags.clone(),
                    });
                    extra_flags = Some(flags);
                }
            }
            let response =
                fetch::render_fetch(seq, &message, items, uid_mode, extra_flags.as_deref());
            self.codec().write_raw(&response).await?;
        }
        self.poll_updates().await?;
        self.tagged(tag, "OK", "FETCH completed").await
    }

    async fn handle_store(
        &mut self,
        tag: &str,
        set: &SequenceSet,
        action: StoreAction,
        silent: bool,
        flags: &[Flag],
        uid_mode: bool,
    ) -> Result<(), SessionError> {
        let Some((folder, read_only)) = self
            .selected
            .as_ref()
            .map(|s| (s.folder.clone(), s.read_only))
        else {
            return self.tagged(tag, "NO", "select a mailbox first").await;
        };
        if read_only {
            return self.tagged(tag, "NO", "mailbox is read-only").await;
        }
        let matched = folder.select_matching(set, uid_mode);
        for (_, message) in matched {
            let Some((seq, new_flags)) = folder.update_flags(message.uid, action, flags) else {
                continue;
            };
            self.suppress(FolderEvent::FlagsUpdated {
                uid: message.uid,
                seq,
                flags: new_flags.clone(),
            });
            if !silent {
                let uid_item = if uid_mode {
                    format!(" UID {}", message.uid)
                } else {
                    String::new()
                };
                self.untagged(&format!(
                    "{seq} FETCH (FLAGS {}{uid_item})",
                    format_flags(new_flags.iter())
                ))
                .await?;
            }
        }
        self.poll_updates().await?;
        self.tagged(tag, "OK", "STORE completed").await
    }

    async fn handle_copy(
        &mut self,
        tag: &str,
        set: &SequenceSet,
        mailbox: &str,
        uid_mode: bool,
    ) -> Result<(), SessionError> {
        let Some(source) = self.selected.as_ref().map(|s| s.folder.clone()) else {
            return self.tagged(tag, "NO", "select a mailbox first").await;
        };
        let login = self.login();
        let dest = match self.ctx.store.get_folder(&login, mailbox) {
            Ok(folder) if !folder.is_noselect() => folder,
            _ => {
                return self
                    .tagged(tag, "NO", "[TRYCREATE] no such mailbox")
                    .await;
            }
        };
        let mapping = copy_messages(&source, set, uid_mode, &dest);
        self.poll_updates().await?;
        if mapping.is_empty() {
            self.tagged(tag, "OK", "COPY completed").await
        } else {
            let src: Vec<String> = mapping.iter().map(|(s, _)| s.to_string()).collect();
            let dst: Vec<String> = mapping.iter().map(|(_, d)| d.to_string()).collect();
            self.tagged(
                tag,
                "OK",
                &format!(
                    "[COPYUID {} {} {}] COPY completed",
                    dest.uid_validity(),
                    src.join(","),
                    dst.join(",")
                ),
            )
            .await
        }
    }

    async fn handle_expunge(
        &mut self,
        tag: &str,
        uid_filter: Option<SequenceSet>,
    ) -> Result<(), SessionError> {
        let Some((folder, read_only)) = self
            .selected
            .as_ref()
            .map(|s| (s.folder.clone(), s.read_only))
        else {
            return self.tagged(tag, "NO", "select a mailbox first").await;
        };
        if read_only {
            return self.tagged(tag, "NO", "mailbox is read-only").await;
        }
        let removed = folder.expunge(uid_filter.as_ref());
        for seq in removed {
            self.suppress(FolderEvent::Expunged(seq));
            self.untagged(&format!("{seq} EXPUNGE")).await?;
        }
        self.poll_updates().await?;
        self.tagged(tag, "OK", "EXPUNGE completed").await
    }

    async fn handle_idle(&mut self, tag: &str) -> Result<(), SessionError> {
        self.codec().write_line("+ idling").await?;
        self.codec().flush().await?;

        // The read idle timeout does not apply while idling.
        let mut codec = self.codec.take().expect("codec present outside starttls");
        codec.set_read_timeout(None);

        let done = loop {
            match self.selected.as_mut() {
                Some(selected) => {
                    tokio::select! {
                        line = codec.read_line() => {
                            match line? {
                                None => break false,
                                Some(line) if line.trim().eq_ignore_ascii_case("DONE") => {
                                    break true;
                                }
                                Some(_) => {}
                            }
                        }
                        event = selected.events.recv() => {
                            for line in idle_event_lines(selected, event) {
                                codec.write_line(&format!("* {line}")).await?;
                            }
                            codec.flush().await?;
                        }
                    }
                }
                None => match codec.read_line().await? {
                    None => break false,
                    Some(line) if line.trim().eq_ignore_ascii_case("DONE") => break true,
                    Some(_) => {}
                },
            }
        };

        codec.set_read_timeout(Some(Duration::from_millis(self.ctx.config.read_timeout_ms)));
        self.codec = Some(codec);
        if done {
            self.tagged(tag, "OK", "IDLE terminated").await
        } else {
            // Dropped mid-IDLE: no tagged response is owed.
            Err(SessionError::ConnectionClosed)
        }
    }

    /// Drain pending folder events and emit the corresponding
    /// untagged responses. Called at command boundaries.
    async fn poll_updates(&mut self) -> Result<(), SessionError> {
        let mut lines = vec![];
        let mut exists_dirty = false;
        {
            let Some(selected) = self.selected.as_mut() else {
                return Ok(());
            };
            loop {
                match selected.events.try_recv() {
                    Ok(event) => {
                        if selected.suppressed.front() == Some(&event) {
                            selected.suppressed.pop_front();
                            continue;
                        }
                        match event {
                            FolderEvent::Added(_) => exists_dirty = true,
                            FolderEvent::FlagsUpdated { seq, flags, .. } => lines.push(format!(
                                "{seq} FETCH (FLAGS {})",
                                format_flags(flags.iter())
                            )),
                            FolderEvent::Expunged(seq) => lines.push(format!("{seq} EXPUNGE")),
                        }
                    }
                    Err(TryRecvError::Lagged(_)) => {
                        // Too far behind: resynchronize from state.
                        selected.suppressed.clear();
                        exists_dirty = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            if exists_dirty {
                lines.push(format!("{} EXISTS", selected.folder.message_count()));
                lines.push(format!("{} RECENT", selected.folder.recent_count()));
            }
        }
        for line in lines {
            self.untagged(&line).await?;
        }
        Ok(())
    }
}

fn idle_event_lines(
    selected: &mut Selected,
    event: Result<FolderEvent, broadcast::error::RecvError>,
) -> Vec<String> {
    match event {
        Ok(event) => {
            if selected.suppressed.front() == Some(&event) {
                selected.suppressed.pop_front();
                return vec![];
            }
            match event {
                FolderEvent::Added(_) => vec![
                    format!("{} EXISTS", selected.folder.message_count()),
                    format!("{} RECENT", selected.folder.recent_count()),
                ],
                FolderEvent::FlagsUpdated { seq, flags, .. } => {
                    vec![format!("{seq} FETCH (FLAGS {})", format_flags(flags.iter()))]
                }
                FolderEvent::Expunged(seq) => vec![format!("{seq} EXPUNGE")],
            }
        }
        Err(broadcast::error::RecvError::Lagged(_)) => {
            selected.suppressed.clear();
            vec![
                format!("{} EXISTS", selected.folder.message_count()),
                format!("{} RECENT", selected.folder.recent_count()),
            ]
        }
        // The folder owns the sender, and the Selected holds the
        // folder, so the channel cannot close while selected.
        Err(broadcast::error::RecvError::Closed) => vec![],
    }
}

fn fallback_tag(segments: &[Segment]) -> String {
    for segment in segments {
        if let Segment::Text(text) = segment {
            if let Some(tag) = text.split_whitespace().next() {
                return tag.to_string();
            }
        }
    }
    "*".to_string()
}
