use crate::error::StoreError;
use crate::store::MailStore;
use crate::users::UserManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A message as accepted by the SMTP front end: envelope plus raw
/// RFC 822 bytes.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub from: String,
    pub rcpts: Vec<String>,
    pub raw: Vec<u8>,
}

/// A delivered message as seen by the inspection API: the owning
/// user's address plus the stored bytes.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub owner_email: String,
    pub raw: Arc<[u8]>,
}

/// Resolves recipients and appends accepted mail to the matching
/// INBOXes. Also the anchor for `wait_for_incoming`: every append
/// bumps a watch counter that waiters observe.
pub struct DeliveryPipeline {
    store: Arc<MailStore>,
    users: Arc<UserManager>,
    delivered: watch::Sender<u64>,
}

impl DeliveryPipeline {
    pub fn new(store: Arc<MailStore>, users: Arc<UserManager>) -> Self {
        let (delivered, _) = watch::channel(0);
        Self {
            store,
            users,
            delivered,
        }
    }

    /// Deliver to every recipient that resolves. Recipients that no
    /// longer resolve are dropped with a warning: the SMTP session
    /// already vetted them at RCPT time, so this only happens when a
    /// user disappears in between.
    pub fn deliver(&self, message: &ReceivedMessage) -> Result<(), StoreError> {
        for rcpt in &message.rcpts {
            let user = match self.users.resolve_recipient(rcpt) {
                Ok(user) => user,
                Err(err) => {
                    tracing::warn!("dropping recipient {rcpt}: {err}");
                    continue;
                }
            };
            let inbox = self.store.inbox(&user.login)?;
            inbox.append(&message.raw, &[], None);
            self.delivered.send_modify(|count| *count += 1);
        }
        Ok(())
    }

    /// Wait until `count` more messages have been delivered, counting
    /// from the moment this waiter is installed. Returns false on
    /// timeout.
    pub async fn wait_for_incoming(&self, timeout: Duration, count: usize) -> bool {
        let mut rx = self.delivered.subscribe();
        let target = *rx.borrow() + count as u64;
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() >= target {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone; nothing further will arrive.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok()
    }

    pub fn delivered_count(&self) -> u64 {
        *self.delivered.subscribe().borrow()
    }

    /// Every message in every INBOX, in (login, uid) order.
    pub fn received_messages(&self) -> Vec<DeliveredMessage> {
        let mut out = vec![];
        for (login, inbox) in self.store.all_inboxes() {
            let owner_email = self
                .users
                .get_user(&login)
                .map(|user| user.email.clone())
                .unwrap_or(login);
            inbox.with_messages(|messages| {
                for message in messages {
                    out.push(DeliveredMessage {
                        owner_email: owner_email.clone(),
                        raw: message.raw_shared(),
                    });
                }
            });
        }
        out
    }

    /// As `received_messages`, filtered to owners in `domain`.
    pub fn received_messages_for_domain(&self, domain: &str) -> Vec<DeliveredMessage> {
        self.received_messages()
            .into_iter()
            .filter(|message| {
                message
                    .owner_email
                    .rsplit_once('@')
                    .map_or(false, |(_, d)| d.eq_ignore_ascii_case(domain))
            })
            .collect()
    }
}
