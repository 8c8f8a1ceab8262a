use crate::sequence::SequenceSet;
use crate::types::*;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("empty command line")]
    Empty,
    #[error("unexpected end of command")]
    UnexpectedEnd,
    #[error("expected {0}")]
    Expected(&'static str),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("invalid number {0}")]
    InvalidNumber(String),
    #[error("invalid date {0}")]
    InvalidDate(String),
    #[error("invalid sequence set {0}")]
    InvalidSequenceSet(String),
    #[error("literal is not valid UTF-8 where a string was expected")]
    LiteralUtf8,
    #[error("{0}")]
    Invalid(String),
}

/// One piece of a logical command line. The codec splits each command
/// into the text portions and the raw literal octets announced by
/// `{N}` / `{N+}` specifiers; literals may contain any bytes at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Literal(Vec<u8>),
}

/// If `line` ends with a literal specifier, returns
/// `(octet_count, non_synchronizing)`. The trailing CRLF may be
/// present or already stripped.
pub fn literal_suffix(line: &str) -> Option<(u32, bool)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let line = line.strip_suffix('}')?;
    let open = line.rfind('{')?;
    let inner = &line[open + 1..];
    let (digits, plus) = match inner.strip_suffix('+') {
        Some(digits) => (digits, true),
        None => (inner, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|n| (n, plus))
}

/// Strip the literal specifier (and line ending) from a line that
/// `literal_suffix` matched, leaving the text that precedes it.
pub fn strip_literal_suffix(line: &str) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.rfind('{') {
        Some(open) => &line[..open],
        None => line,
    }
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == lower).map(|i| i as u32 + 1)
}

/// Parse an RFC 3501 `date` such as `17-Jul-1996`.
pub fn parse_date(text: &str) -> Result<NaiveDate, ParseError> {
    let invalid = || ParseError::InvalidDate(text.to_string());
    let mut parts = text.trim().splitn(3, '-');
    let day: u32 = parts.next().ok_or_else(invalid)?.trim().parse().map_err(|_| invalid())?;
    let month = month_from_name(parts.next().ok_or_else(invalid)?).ok_or_else(invalid)?;
    let year: i32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}

/// Parse an RFC 3501 `date-time` such as `17-Jul-1996 02:44:25 -0700`.
/// The day may be space padded.
pub fn parse_date_time(text: &str) -> Result<DateTime<FixedOffset>, ParseError> {
    let invalid = || ParseError::InvalidDate(text.to_string());
    let trimmed = text.trim();
    let (date_part, rest) = trimmed.split_once(' ').ok_or_else(invalid)?;
    let (time_part, zone_part) = rest.trim().split_once(' ').ok_or_else(invalid)?;

    let date = parse_date(date_part)?;

    let mut hms = time_part.split(':');
    let hour: u32 = hms.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let minute: u32 = hms.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let second: u32 = hms.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)?;

    let zone = zone_part.trim();
    if zone.len() != 5 {
        return Err(invalid());
    }
    let sign = match &zone[..1] {
        "+" => 1,
        "-" => -1,
        _ => return Err(invalid()),
    };
    let zh: i32 = zone[1..3].parse().map_err(|_| invalid())?;
    let zm: i32 = zone[3..5].parse().map_err(|_| invalid())?;
    let offset = FixedOffset::east_opt(sign * (zh * 3600 + zm * 60)).ok_or_else(invalid)?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .ok_or_else(invalid)
}

/// Render a `date-time` for INTERNALDATE responses.
pub fn format_date_time<Tz: TimeZone>(when: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    when.format("%d-%b-%Y %H:%M:%S %z").to_string()
}

struct Cursor<'a> {
    segments: &'a [Segment],
    seg: usize,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(segments: &'a [Segment]) -> Self {
        let mut cur = Self {
            segments,
            seg: 0,
            pos: 0,
        };
        cur.normalize();
        cur
    }

    /// Skip over fully consumed text segments so that `peek` and
    /// `take_literal` always look at live input.
    fn normalize(&mut self) {
        while let Some(Segment::Text(text)) = self.segments.get(self.seg) {
            if self.pos < text.len() {
                break;
            }
            self.seg += 1;
            self.pos = 0;
        }
    }

    fn at_end(&self) -> bool {
        self.seg >= self.segments.len()
    }

    fn peek(&self) -> Option<char> {
        match self.segments.get(self.seg)? {
            Segment::Text(text) => text[self.pos..].chars().next(),
            Segment::Literal(_) => None,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        self.normalize();
        Some(c)
    }

    fn save(&self) -> (usize, usize) {
        (self.seg, self.pos)
    }

    fn restore(&mut self, mark: (usize, usize)) {
        self.seg = mark.0;
        self.pos = mark.1;
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.bump();
        }
    }

    fn expect_char(&mut self, want: char) -> Result<(), ParseError> {
        if self.peek() == Some(want) {
            self.bump();
            Ok(())
        } else {
            Err(ParseError::Invalid(format!("expected {want:?}")))
        }
    }

    fn take_literal(&mut self) -> Option<&'a [u8]> {
        match self.segments.get(self.seg)? {
            Segment::Literal(bytes) => {
                let bytes = bytes.as_slice();
                self.seg += 1;
                self.pos = 0;
                self.normalize();
                Some(bytes)
            }
            Segment::Text(_) => None,
        }
    }

    fn atom(&mut self) -> Result<String, ParseError> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, ' ' | '(' | ')' | '[' | ']' | '"') {
                break;
            }
            out.push(c);
            self.bump();
        }
        if out.is_empty() {
            return Err(ParseError::Expected("atom"));
        }
        Ok(out)
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(ParseError::UnexpectedEnd),
                },
                Some(c) => out.push(c),
                None => return Err(ParseError::UnexpectedEnd),
            }
        }
    }

    /// An `astring`: atom, quoted string or literal, as raw bytes.
    fn astring_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        self.skip_spaces();
        match self.peek() {
            Some('"') => Ok(self.quoted()?.into_bytes()),
            Some(_) => Ok(self.atom()?.into_bytes()),
            None => match self.take_literal() {
                Some(bytes) => Ok(bytes.to_vec()),
                None => Err(ParseError::UnexpectedEnd),
            },
        }
    }

    fn astring(&mut self) -> Result<String, ParseError> {
        String::from_utf8(self.astring_bytes()?).map_err(|_| ParseError::LiteralUtf8)
    }

    fn number(&mut self) -> Result<u32, ParseError> {
        let digits = self.digits()?;
        digits.parse().map_err(|_| ParseError::InvalidNumber(digits))
    }

    fn number64(&mut self) -> Result<u64, ParseError> {
        let digits = self.digits()?;
        digits.parse().map_err(|_| ParseError::InvalidNumber(digits))
    }

    fn digits(&mut self) -> Result<String, ParseError> {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            self.bump();
        }
        if digits.is_empty() {
            return Err(ParseError::Expected("number"));
        }
        Ok(digits)
    }

    fn sequence_set(&mut self) -> Result<SequenceSet, ParseError> {
        self.skip_spaces();
        SequenceSet::parse(&self.atom()?)
    }
}

/// Parse a single-line command with no literals. Convenience for
/// callers and tests; the general entry point is `parse_request`.
pub fn parse_request_line(line: &str) -> Result<Request, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    parse_request(&[Segment::Text(line.to_string())])
}

/// Parse a complete logical command line into a tagged request.
pub fn parse_request(segments: &[Segment]) -> Result<Request, ParseError> {
    let mut cur = Cursor::new(segments);
    cur.skip_spaces();
    let tag = cur.atom().map_err(|_| ParseError::Empty)?;
    cur.skip_spaces();
    let mut name = cur
        .atom()
        .map_err(|_| ParseError::Expected("command name"))?
        .to_ascii_uppercase();
    let mut uid = false;
    if name == "UID" {
        cur.skip_spaces();
        name = cur.atom()?.to_ascii_uppercase();
        uid = true;
    }

    let command = match (name.as_str(), uid) {
        ("CAPABILITY", false) => Command::Capability,
        ("NOOP", false) => Command::Noop,
        ("LOGOUT", false) => Command::Logout,
        ("STARTTLS", false) => Command::StartTls,
        ("CHECK", false) => Command::Check,
        ("CLOSE", false) => Command::Close,
        ("IDLE", false) => Command::Idle,
        ("NAMESPACE", false) => Command::Namespace,
        ("EXPUNGE", false) => Command::Expunge,
        ("EXPUNGE", true) => Command::UidExpunge {
            set: cur.sequence_set()?,
        },
        ("AUTHENTICATE", false) => {
            cur.skip_spaces();
            let mechanism = cur.atom()?.to_ascii_uppercase();
            cur.skip_spaces();
            let initial_response = if cur.at_end() { None } else { Some(cur.atom()?) };
            Command::Authenticate {
                mechanism,
                initial_response,
            }
        }
        ("LOGIN", false) => {
            let username = cur.astring()?;
            let password = cur.astring()?;
            Command::Login { username, password }
        }
        ("SELECT", false) => Command::Select {
            mailbox: cur.astring()?,
        },
        ("EXAMINE", false) => Command::Examine {
            mailbox: cur.astring()?,
        },
        ("CREATE", false) => Command::Create {
            mailbox: cur.astring()?,
        },
        ("DELETE", false) => Command::Delete {
            mailbox: cur.astring()?,
        },
        ("RENAME", false) => {
            let from = cur.astring()?;
            let to = cur.astring()?;
            Command::Rename { from, to }
        }
        ("SUBSCRIBE", false) => Command::Subscribe {
            mailbox: cur.astring()?,
        },
        ("UNSUBSCRIBE", false) => Command::Unsubscribe {
            mailbox: cur.astring()?,
        },
        ("LIST", false) => {
            let reference = cur.astring()?;
            let pattern = cur.astring()?;
            Command::List { reference, pattern }
        }
        ("LSUB", false) => {
            let reference = cur.astring()?;
            let pattern = cur.astring()?;
            Command::Lsub { reference, pattern }
        }
        ("STATUS", false) => {
            let mailbox = cur.astring()?;
            cur.skip_spaces();
            cur.expect_char('(')?;
            let mut items = vec![];
            loop {
                cur.skip_spaces();
                if cur.peek() == Some(')') {
                    cur.bump();
                    break;
                }
                let word = cur.atom()?.to_ascii_uppercase();
                items.push(match word.as_str() {
                    "MESSAGES" => StatusItem::Messages,
                    "RECENT" => StatusItem::Recent,
                    "UIDNEXT" => StatusItem::UidNext,
                    "UIDVALIDITY" => StatusItem::UidValidity,
                    "UNSEEN" => StatusItem::Unseen,
                    other => {
                        return Err(ParseError::Invalid(format!("unknown status item {other}")))
                    }
                });
            }
            Command::Status { mailbox, items }
        }
        ("APPEND", false) => {
            let mailbox = cur.astring()?;
            cur.skip_spaces();
            let mut flags = vec![];
            if cur.peek() == Some('(') {
                cur.bump();
                loop {
                    cur.skip_spaces();
                    if cur.peek() == Some(')') {
                        cur.bump();
                        break;
                    }
                    flags.push(Flag::parse(&cur.atom()?));
                }
            }
            cur.skip_spaces();
            let date = if cur.peek() == Some('"') {
                Some(parse_date_time(&cur.quoted()?)?)
            } else {
                None
            };
            let message = cur.astring_bytes()?;
            Command::Append {
                mailbox,
                flags,
                date,
                message,
            }
        }
        ("GETQUOTA", false) => Command::GetQuota {
            root: cur.astring()?,
        },
        ("GETQUOTAROOT", false) => Command::GetQuotaRoot {
            mailbox: cur.astring()?,
        },
        ("SEARCH", uid) => parse_search(&mut cur, uid)?,
        ("FETCH", uid) => parse_fetch(&mut cur, uid)?,
        ("STORE", uid) => parse_store(&mut cur, uid)?,
        ("COPY", uid) => {
            let set = cur.sequence_set()?;
            let mailbox = cur.astring()?;
            Command::Copy { set, mailbox, uid }
        }
        (other, false) => return Err(ParseError::UnknownCommand(other.to_string())),
        (other, true) => return Err(ParseError::UnknownCommand(format!("UID {other}"))),
    };

    Ok(Request { tag, command })
}

fn parse_search(cur: &mut Cursor, uid: bool) -> Result<Command, ParseError> {
    cur.skip_spaces();
    let mut charset = None;
    let mark = cur.save();
    match cur.atom() {
        Ok(word) if word.eq_ignore_ascii_case("CHARSET") => {
            charset = Some(cur.astring()?);
        }
        _ => cur.restore(mark),
    }

    let mut keys = vec![];
    loop {
        cur.skip_spaces();
        if cur.at_end() {
            break;
        }
        keys.push(parse_search_key(cur)?);
    }
    let criteria = match keys.len() {
        0 => return Err(ParseError::Expected("search key")),
        1 => keys.remove(0),
        _ => SearchKey::And(keys),
    };
    Ok(Command::Search {
        charset,
        criteria,
        uid,
    })
}

fn parse_search_key(cur: &mut Cursor) -> Result<SearchKey, ParseError> {
    cur.skip_spaces();
    if cur.peek() == Some('(') {
        cur.bump();
        let mut keys = vec![];
        loop {
            cur.skip_spaces();
            if cur.peek() == Some(')') {
                cur.bump();
                break;
            }
            keys.push(parse_search_key(cur)?);
        }
        return Ok(match keys.len() {
            0 => return Err(ParseError::Expected("search key")),
            1 => keys.remove(0),
            _ => SearchKey::And(keys),
        });
    }

    let word = cur.atom()?;
    if word
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_digit() || c == '*')
    {
        return Ok(SearchKey::Seq(SequenceSet::parse(&word)?));
    }

    Ok(match word.to_ascii_uppercase().as_str() {
        "ALL" => SearchKey::All,
        "ANSWERED" => SearchKey::Answered,
        "DELETED" => SearchKey::Deleted,
        "DRAFT" => SearchKey::Draft,
        "FLAGGED" => SearchKey::Flagged,
        "NEW" => SearchKey::New,
        "OLD" => SearchKey::Old,
        "RECENT" => SearchKey::Recent,
        "SEEN" => SearchKey::Seen,
        "UNANSWERED" => SearchKey::Unanswered,
        "UNDELETED" => SearchKey::Undeleted,
        "UNDRAFT" => SearchKey::Undraft,
        "UNFLAGGED" => SearchKey::Unflagged,
        "UNSEEN" => SearchKey::Unseen,
        "KEYWORD" => SearchKey::Keyword(cur.astring()?),
        "UNKEYWORD" => SearchKey::Unkeyword(cur.astring()?),
        "FROM" => SearchKey::From(cur.astring()?),
        "TO" => SearchKey::To(cur.astring()?),
        "CC" => SearchKey::Cc(cur.astring()?),
        "BCC" => SearchKey::Bcc(cur.astring()?),
        "SUBJECT" => SearchKey::Subject(cur.astring()?),
        "BODY" => SearchKey::Body(cur.astring()?),
        "TEXT" => SearchKey::Text(cur.astring()?),
        "HEADER" => {
            let name = cur.astring()?;
            let value = cur.astring()?;
            SearchKey::Header(name, value)
        }
        "LARGER" => {
            cur.skip_spaces();
            SearchKey::Larger(cur.number64()?)
        }
        "SMALLER" => {
            cur.skip_spaces();
            SearchKey::Smaller(cur.number64()?)
        }
        "BEFORE" => SearchKey::Before(parse_date(&cur.astring()?)?),
        "ON" => SearchKey::On(parse_date(&cur.astring()?)?),
        "SINCE" => SearchKey::Since(parse_date(&cur.astring()?)?),
        "SENTBEFORE" => SearchKey::SentBefore(parse_date(&cur.astring()?)?),
        "SENTON" => SearchKey::SentOn(parse_date(&cur.astring()?)?),
        "SENTSINCE" => SearchKey::SentSince(parse_date(&cur.astring()?)?),
        "UID" => SearchKey::Uid(cur.sequence_set()?),
        "OR" => {
            let a = parse_search_key(cur)?;
            let b = parse_search_key(cur)?;
            SearchKey::Or(Box::new(a), Box::new(b))
        }
        "NOT" => SearchKey::Not(Box::new(parse_search_key(cur)?)),
        other => return Err(ParseError::Invalid(format!("unknown search key {other}"))),
    })
}

fn parse_fetch(cur: &mut Cursor, uid: bool) -> Result<Command, ParseError> {
    let set = cur.sequence_set()?;
    cur.skip_spaces();
    let mut items = vec![];
    if cur.peek() == Some('(') {
        cur.bump();
        loop {
            cur.skip_spaces();
            if cur.peek() == Some(')') {
                cur.bump();
                break;
            }
            parse_fetch_item(cur, &mut items)?;
        }
    } else {
        parse_fetch_item(cur, &mut items)?;
    }
    if items.is_empty() {
        return Err(ParseError::Expected("fetch attribute"));
    }
    Ok(Command::Fetch { set, items, uid })
}

fn parse_fetch_item(cur: &mut Cursor, items: &mut Vec<FetchItem>) -> Result<(), ParseError> {
    let word = cur.atom()?.to_ascii_uppercase();
    match word.as_str() {
        "ALL" => items.extend([
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
        ]),
        "FAST" => items.extend([
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
        ]),
        "FULL" => items.extend([
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
            FetchItem::Body,
        ]),
        "UID" => items.push(FetchItem::Uid),
        "FLAGS" => items.push(FetchItem::Flags),
        "INTERNALDATE" => items.push(FetchItem::InternalDate),
        "ENVELOPE" => items.push(FetchItem::Envelope),
        "RFC822" => items.push(FetchItem::Rfc822),
        "RFC822.HEADER" => items.push(FetchItem::Rfc822Header),
        "RFC822.TEXT" => items.push(FetchItem::Rfc822Text),
        "RFC822.SIZE" => items.push(FetchItem::Rfc822Size),
        "BODYSTRUCTURE" => items.push(FetchItem::BodyStructure),
        "BODY" | "BODY.PEEK" => {
            let peek = word == "BODY.PEEK";
            if cur.peek() == Some('[') {
                cur.bump();
                let section = parse_section(cur)?;
                let partial = parse_partial(cur)?;
                items.push(FetchItem::BodySection {
                    peek,
                    section,
                    partial,
                });
            } else if peek {
                return Err(ParseError::Expected("section after BODY.PEEK"));
            } else {
                items.push(FetchItem::Body);
            }
        }
        other => {
            return Err(ParseError::Invalid(format!(
                "unknown fetch attribute {other}"
            )))
        }
    }
    Ok(())
}

fn parse_section(cur: &mut Cursor) -> Result<Section, ParseError> {
    let mut section = Section::default();
    loop {
        match cur.peek() {
            Some(']') => {
                cur.bump();
                return Ok(section);
            }
            Some(c) if c.is_ascii_digit() => {
                section.parts.push(cur.number()?);
                if cur.peek() == Some('.') {
                    cur.bump();
                }
            }
            Some(_) => {
                let word = cur.atom()?.to_ascii_uppercase();
                section.text = Some(match word.as_str() {
                    "HEADER" => SectionText::Header,
                    "HEADER.FIELDS" => SectionText::HeaderFields(parse_header_list(cur)?),
                    "HEADER.FIELDS.NOT" => SectionText::HeaderFieldsNot(parse_header_list(cur)?),
                    "TEXT" => SectionText::Text,
                    "MIME" => SectionText::Mime,
                    other => {
                        return Err(ParseError::Invalid(format!("unknown section {other}")))
                    }
                });
            }
            None => return Err(ParseError::UnexpectedEnd),
        }
    }
}

fn parse_header_list(cur: &mut Cursor) -> Result<Vec<String>, ParseError> {
    cur.skip_spaces();
    cur.expect_char('(')?;
    let mut fields = vec![];
    loop {
        cur.skip_spaces();
        if cur.peek() == Some(')') {
            cur.bump();
            break;
        }
        fields.push(cur.astring()?);
    }
    Ok(fields)
}

fn parse_partial(cur: &mut Cursor) -> Result<Option<(u32, u32)>, ParseError> {
    if cur.peek() != Some('<') {
        return Ok(None);
    }
    cur.bump();
    let start = cur.number()?;
    cur.expect_char('.')?;
    let length = cur.number()?;
    cur.expect_char('>')?;
    Ok(Some((start, length)))
}

fn parse_store(cur: &mut Cursor, uid: bool) -> Result<Command, ParseError> {
    let set = cur.sequence_set()?;
    cur.skip_spaces();
    let verb = cur.atom()?.to_ascii_uppercase();
    let (verb, silent) = match verb.strip_suffix(".SILENT") {
        Some(prefix) => (prefix.to_string(), true),
        None => (verb, false),
    };
    let action = match verb.as_str() {
        "FLAGS" => StoreAction::Replace,
        "+FLAGS" => StoreAction::Add,
        "-FLAGS" => StoreAction::Remove,
        other => return Err(ParseError::Invalid(format!("unknown store verb {other}"))),
    };
    cur.skip_spaces();
    let mut flags = vec![];
    if cur.peek() == Some('(') {
        cur.bump();
        loop {
            cur.skip_spaces();
            if cur.peek() == Some(')') {
                cur.bump();
                break;
            }
            flags.push(Flag::parse(&cur.atom()?));
        }
    } else {
        loop {
            cur.skip_spaces();
            if cur.at_end() || cur.peek().is_none() {
                break;
            }
            flags.push(Flag::parse(&cur.atom()?));
        }
    }
    Ok(Command::Store {
        set,
        action,
        silent,
        flags,
        uid,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn parse(line: &str) -> Request {
        parse_request_line(line).unwrap()
    }

    #[test]
    fn literal_suffixes() {
        assert_equal!(literal_suffix("a APPEND INBOX {310}\r\n"), Some((310, false)));
        assert_equal!(literal_suffix("a LOGIN {5+}"), Some((5, true)));
        assert_equal!(literal_suffix("a NOOP"), None);
        assert_equal!(literal_suffix("a SELECT {}"), None);
        assert_equal!(strip_literal_suffix("a APPEND INBOX {310}\r\n"), "a APPEND INBOX ");
    }

    #[test]
    fn simple_commands() {
        assert_equal!(parse("a1 CAPABILITY").command, Command::Capability);
        assert_equal!(parse("a2 noop").command, Command::Noop);
        assert_equal!(parse("a3 LOGOUT").command, Command::Logout);
        assert_equal!(parse("a4 CHECK").command, Command::Check);
        assert_equal!(
            parse("a5 SELECT INBOX").command,
            Command::Select {
                mailbox: "INBOX".to_string()
            }
        );
        assert_equal!(
            parse("a6 EXAMINE \"My Folder\"").command,
            Command::Examine {
                mailbox: "My Folder".to_string()
            }
        );
        assert!(parse_request_line("a7 FROBNICATE").is_err());
        assert!(parse_request_line("").is_err());
    }

    #[test]
    fn login_with_literals() {
        let segments = [
            Segment::Text("a1 LOGIN".to_string()),
            Segment::Literal(b"fred".to_vec()),
            Segment::Text(" ".to_string()),
            Segment::Literal(b"secret stuff".to_vec()),
            Segment::Text(String::new()),
        ];
        let request = parse_request(&segments).unwrap();
        assert_equal!(
            request.command,
            Command::Login {
                username: "fred".to_string(),
                password: "secret stuff".to_string(),
            }
        );
    }

    #[test]
    fn fetch_items() {
        let request = parse("a1 FETCH 1:3 (UID FLAGS BODY.PEEK[HEADER.FIELDS (Subject Date)]<0.100>)");
        let Command::Fetch { set, items, uid } = request.command else {
            panic!("expected fetch");
        };
        assert_equal!(uid, false);
        assert_equal!(set.contains(2, 10), true);
        assert_equal!(items.len(), 3);
        assert_equal!(
            items[2],
            FetchItem::BodySection {
                peek: true,
                section: Section {
                    parts: vec![],
                    text: Some(SectionText::HeaderFields(vec![
                        "Subject".to_string(),
                        "Date".to_string()
                    ])),
                },
                partial: Some((0, 100)),
            }
        );
    }

    #[test]
    fn fetch_part_sections() {
        let request = parse("a1 UID FETCH 7 BODY[1.2.MIME]");
        let Command::Fetch { items, uid, .. } = request.command else {
            panic!("expected fetch");
        };
        assert_equal!(uid, true);
        assert_equal!(
            items[0],
            FetchItem::BodySection {
                peek: false,
                section: Section {
                    parts: vec![1, 2],
                    text: Some(SectionText::Mime),
                },
                partial: None,
            }
        );
    }

    #[test]
    fn fetch_macro() {
        let request = parse("a1 FETCH 1 FAST");
        let Command::Fetch { items, .. } = request.command else {
            panic!("expected fetch");
        };
        assert_equal!(
            items,
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size
            ]
        );
    }

    #[test]
    fn search_keys() {
        let request = parse("a1 SEARCH UNSEEN FROM \"fred\" SINCE 1-Feb-1994");
        let Command::Search { criteria, charset, uid } = request.command else {
            panic!("expected search");
        };
        assert_equal!(charset, None);
        assert_equal!(uid, false);
        assert_equal!(
            criteria,
            SearchKey::And(vec![
                SearchKey::Unseen,
                SearchKey::From("fred".to_string()),
                SearchKey::Since(NaiveDate::from_ymd_opt(1994, 2, 1).unwrap()),
            ])
        );
    }

    #[test]
    fn search_or_not_and_charset() {
        let request = parse("a1 UID SEARCH CHARSET UTF-8 OR SEEN NOT DELETED 1:5");
        let Command::Search { criteria, charset, uid } = request.command else {
            panic!("expected search");
        };
        assert_equal!(charset, Some("UTF-8".to_string()));
        assert_equal!(uid, true);
        let SearchKey::And(keys) = criteria else {
            panic!("expected and");
        };
        assert_equal!(keys.len(), 2);
        assert_equal!(
            keys[0],
            SearchKey::Or(
                Box::new(SearchKey::Seen),
                Box::new(SearchKey::Not(Box::new(SearchKey::Deleted)))
            )
        );
        assert!(matches!(keys[1], SearchKey::Seq(_)));
    }

    #[test]
    fn store_forms() {
        let request = parse("a1 STORE 2:4 +FLAGS.SILENT (\\Deleted \\Seen)");
        assert_equal!(
            request.command,
            Command::Store {
                set: SequenceSet::parse("2:4").unwrap(),
                action: StoreAction::Add,
                silent: true,
                flags: vec![Flag::Deleted, Flag::Seen],
                uid: false,
            }
        );

        let request = parse("a2 STORE 1 FLAGS \\Flagged custom");
        assert_equal!(
            request.command,
            Command::Store {
                set: SequenceSet::parse("1").unwrap(),
                action: StoreAction::Replace,
                silent: false,
                flags: vec![Flag::Flagged, Flag::Keyword("custom".to_string())],
                uid: false,
            }
        );
    }

    #[test]
    fn append_full_form() {
        let segments = [
            Segment::Text(
                "a1 APPEND saved-messages (\\Seen) \"17-Jul-1996 02:44:25 -0700\"".to_string(),
            ),
            Segment::Literal(b"Subject: hi\r\n\r\nbody\r\n".to_vec()),
            Segment::Text(String::new()),
        ];
        let request = parse_request(&segments).unwrap();
        let Command::Append {
            mailbox,
            flags,
            date,
            message,
        } = request.command
        else {
            panic!("expected append");
        };
        assert_equal!(mailbox, "saved-messages");
        assert_equal!(flags, vec![Flag::Seen]);
        assert_equal!(
            date.unwrap(),
            parse_date_time("17-Jul-1996 02:44:25 -0700").unwrap()
        );
        assert_equal!(message, b"Subject: hi\r\n\r\nbody\r\n".to_vec());
    }

    #[test]
    fn status_items() {
        let request = parse("a1 STATUS blurdybloop (UIDNEXT MESSAGES)");
        assert_equal!(
            request.command,
            Command::Status {
                mailbox: "blurdybloop".to_string(),
                items: vec![StatusItem::UidNext, StatusItem::Messages],
            }
        );
    }

    #[test]
    fn uid_variants() {
        assert!(matches!(
            parse("a1 UID COPY 1:* Trash").command,
            Command::Copy { uid: true, .. }
        ));
        assert!(matches!(
            parse("a2 UID EXPUNGE 4").command,
            Command::UidExpunge { .. }
        ));
        assert!(parse_request_line("a3 UID NOOP").is_err());
    }

    #[test]
    fn dates() {
        assert_equal!(
            parse_date("17-Jul-1996").unwrap(),
            NaiveDate::from_ymd_opt(1996, 7, 17).unwrap()
        );
        assert_equal!(
            parse_date(" 7-Jul-1996").unwrap(),
            NaiveDate::from_ymd_opt(1996, 7, 7).unwrap()
        );
        assert!(parse_date("17-Julius-1996").is_err());
        let when = parse_date_time("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_equal!(format_date_time(&when), "17-Jul-1996 02:44:25 -0700");
    }
}
