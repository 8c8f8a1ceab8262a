use crate::sequence::SequenceSet;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::fmt;

/// A message flag. The system flags are represented directly;
/// anything else is a user-defined keyword.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Keyword(String),
}

impl Flag {
    pub fn parse(text: &str) -> Self {
        if text.eq_ignore_ascii_case("\\Seen") {
            Self::Seen
        } else if text.eq_ignore_ascii_case("\\Answered") {
            Self::Answered
        } else if text.eq_ignore_ascii_case("\\Flagged") {
            Self::Flagged
        } else if text.eq_ignore_ascii_case("\\Deleted") {
            Self::Deleted
        } else if text.eq_ignore_ascii_case("\\Draft") {
            Self::Draft
        } else if text.eq_ignore_ascii_case("\\Recent") {
            Self::Recent
        } else {
            Self::Keyword(text.to_string())
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, Self::Keyword(_))
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Seen => write!(fmt, "\\Seen"),
            Self::Answered => write!(fmt, "\\Answered"),
            Self::Flagged => write!(fmt, "\\Flagged"),
            Self::Deleted => write!(fmt, "\\Deleted"),
            Self::Draft => write!(fmt, "\\Draft"),
            Self::Recent => write!(fmt, "\\Recent"),
            Self::Keyword(word) => write!(fmt, "{word}"),
        }
    }
}

/// Render a flag list the way it appears on the wire: `(\Seen \Deleted)`.
pub fn format_flags<'a>(flags: impl IntoIterator<Item = &'a Flag>) -> String {
    let inner: Vec<String> = flags.into_iter().map(|f| f.to_string()).collect();
    format!("({})", inner.join(" "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl fmt::Display for StatusItem {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Messages => write!(fmt, "MESSAGES"),
            Self::Recent => write!(fmt, "RECENT"),
            Self::UidNext => write!(fmt, "UIDNEXT"),
            Self::UidValidity => write!(fmt, "UIDVALIDITY"),
            Self::Unseen => write!(fmt, "UNSEEN"),
        }
    }
}

/// How a STORE command combines its flag argument with the current set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Replace,
    Add,
    Remove,
}

/// The text portion of a BODY[] section specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionText {
    Header,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Text,
    Mime,
}

/// A BODY[] section: zero or more part numbers, optionally followed
/// by a text specifier. `BODY[]` is both lists empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    pub parts: Vec<u32>,
    pub text: Option<SectionText>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Envelope,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Rfc822Size,
    Body,
    BodyStructure,
    BodySection {
        peek: bool,
        section: Section,
        partial: Option<(u32, u32)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    Keyword(String),
    Unkeyword(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Body(String),
    Text(String),
    Header(String, String),
    Larger(u64),
    Smaller(u64),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Uid(SequenceSet),
    Seq(SequenceSet),
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // Any state
    Capability,
    Noop,
    Logout,
    // Not authenticated
    StartTls,
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },
    Login {
        username: String,
        password: String,
    },
    // Authenticated
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        date: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    },
    Namespace,
    GetQuota {
        root: String,
    },
    GetQuotaRoot {
        mailbox: String,
    },
    Idle,
    // Selected
    Check,
    Close,
    Expunge,
    UidExpunge {
        set: SequenceSet,
    },
    Search {
        charset: Option<String>,
        criteria: SearchKey,
        uid: bool,
    },
    Fetch {
        set: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    Store {
        set: SequenceSet,
        action: StoreAction,
        silent: bool,
        flags: Vec<Flag>,
        uid: bool,
    },
    Copy {
        set: SequenceSet,
        mailbox: String,
        uid: bool,
    },
}

/// A complete client request: the tag plus the parsed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub tag: String,
    pub command: Command,
}
