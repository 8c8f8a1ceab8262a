use crate::message::StoredMessage;
use chrono::{DateTime, NaiveDate, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use rfc3501::{Flag, SearchKey};

/// Everything a search key can be evaluated against: the stored
/// message, its parsed MIME view, and positional context.
pub struct SearchContext<'a> {
    pub message: &'a StoredMessage,
    pub parsed: &'a ParsedMail<'a>,
    pub seq: u32,
    pub total: u32,
    pub max_uid: u32,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn header_contains(ctx: &SearchContext, name: &str, needle: &str) -> bool {
    let values = ctx.parsed.headers.get_all_values(name);
    !values.is_empty() && values.iter().any(|value| contains_ci(value, needle))
}

/// Decoded text of all leaf parts, used by BODY and TEXT matching.
fn body_text(part: &ParsedMail) -> String {
    if part.subparts.is_empty() {
        part.get_body().unwrap_or_default()
    } else {
        part.subparts.iter().map(body_text).collect()
    }
}

fn sent_date(ctx: &SearchContext) -> Option<NaiveDate> {
    let value = ctx.parsed.headers.get_first_value("Date")?;
    let epoch = mailparse::dateparse(&value).ok()?;
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|dt| dt.date_naive())
}

/// Evaluate an IMAP search tree against one message.
pub fn evaluate(key: &SearchKey, ctx: &SearchContext) -> bool {
    let flags = &ctx.message.flags;
    match key {
        SearchKey::All => true,
        SearchKey::Answered => flags.contains(&Flag::Answered),
        SearchKey::Deleted => flags.contains(&Flag::Deleted),
        SearchKey::Draft => flags.contains(&Flag::Draft),
        SearchKey::Flagged => flags.contains(&Flag::Flagged),
        SearchKey::Recent => flags.contains(&Flag::Recent),
        SearchKey::Seen => flags.contains(&Flag::Seen),
        SearchKey::New => flags.contains(&Flag::Recent) && !flags.contains(&Flag::Seen),
        SearchKey::Old => !flags.contains(&Flag::Recent),
        SearchKey::Unanswered => !flags.contains(&Flag::Answered),
        SearchKey::Undeleted => !flags.contains(&Flag::Deleted),
        SearchKey::Undraft => !flags.contains(&Flag::Draft),
        SearchKey::Unflagged => !flags.contains(&Flag::Flagged),
        SearchKey::Unseen => !flags.contains(&Flag::Seen),
        SearchKey::Keyword(word) => ctx.message.has_keyword(word),
        SearchKey::Unkeyword(word) => !ctx.message.has_keyword(word),
        SearchKey::From(needle) => header_contains(ctx, "From", needle),
        SearchKey::To(needle) => header_contains(ctx, "To", needle),
        SearchKey::Cc(needle) => header_contains(ctx, "Cc", needle),
        SearchKey::Bcc(needle) => header_contains(ctx, "Bcc", needle),
        SearchKey::Subject(needle) => header_contains(ctx, "Subject", needle),
        SearchKey::Header(name, needle) => header_contains(ctx, name, needle),
        SearchKey::Body(needle) => contains_ci(&body_text(ctx.parsed), needle),
        SearchKey::Text(needle) => {
            contains_ci(&String::from_utf8_lossy(ctx.message.raw()), needle)
        }
        SearchKey::Larger(n) => ctx.message.size() as u64 > *n,
        SearchKey::Smaller(n) => (ctx.message.size() as u64) < *n,
        SearchKey::Before(date) => ctx.message.internal_date.date_naive() < *date,
        SearchKey::On(date) => ctx.message.internal_date.date_naive() == *date,
        SearchKey::Since(date) => ctx.message.internal_date.date_naive() >= *date,
        SearchKey::SentBefore(date) => sent_date(ctx).map_or(false, |sent| sent < *date),
        SearchKey::SentOn(date) => sent_date(ctx).map_or(false, |sent| sent == *date),
        SearchKey::SentSince(date) => sent_date(ctx).map_or(false, |sent| sent >= *date),
        SearchKey::Uid(set) => set.contains(ctx.message.uid, ctx.max_uid),
        SearchKey::Seq(set) => set.contains(ctx.seq, ctx.total),
        SearchKey::And(keys) => keys.iter().all(|key| evaluate(key, ctx)),
        SearchKey::Or(a, b) => evaluate(a, ctx) || evaluate(b, ctx),
        SearchKey::Not(inner) => !evaluate(inner, ctx),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::folder::MailFolder;
    use k9::assert_equal;
    use rfc3501::SequenceSet;

    const RAW: &[u8] = b"From: Fred Foobar <foobar@example.com>\r\n\
To: mooch@owatagu.example.net\r\n\
Subject: afternoon =?UTF-8?Q?caf=C3=A9?= meeting\r\n\
Date: Wed, 17 Jul 1996 02:23:25 -0700\r\n\
\r\n\
Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    fn check(key: SearchKey, expect: bool) {
        let folder = MailFolder::new("fred", "INBOX", 1);
        let uid = folder.append(RAW, &[], None);
        let message = folder.message_by_uid(uid).unwrap();
        let parsed = message.parsed().unwrap();
        let ctx = SearchContext {
            message: &message,
            parsed: &parsed,
            seq: 1,
            total: 1,
            max_uid: uid,
        };
        assert_equal!(evaluate(&key, &ctx), expect);
    }

    #[test]
    fn header_matching_is_substring_and_case_insensitive() {
        check(SearchKey::From("FOOBAR".to_string()), true);
        check(SearchKey::From("nobody".to_string()), false);
        check(SearchKey::Subject("afternoon".to_string()), true);
        check(
            SearchKey::Header("To".to_string(), "owatagu".to_string()),
            true,
        );
        check(SearchKey::Header("Cc".to_string(), String::new()), false);
        check(SearchKey::Header("Date".to_string(), String::new()), true);
    }

    #[test]
    fn mime_encoded_headers_are_decoded_before_matching() {
        check(SearchKey::Subject("café".to_string()), true);
    }

    #[test]
    fn body_and_text() {
        check(SearchKey::Body("meet at 3:30".to_string()), true);
        check(SearchKey::Body("Subject".to_string()), false);
        check(SearchKey::Text("owatagu".to_string()), true);
    }

    #[test]
    fn flags_and_sizes() {
        check(SearchKey::New, true);
        check(SearchKey::Old, false);
        check(SearchKey::Unseen, true);
        check(SearchKey::Larger(10), true);
        check(SearchKey::Smaller(10), false);
    }

    #[test]
    fn sent_dates_use_the_date_header() {
        let date = NaiveDate::from_ymd_opt(1996, 7, 17).unwrap();
        check(SearchKey::SentOn(date), true);
        check(SearchKey::SentBefore(date), false);
        check(SearchKey::SentSince(date), true);
    }

    #[test]
    fn uid_key_roundtrip() {
        check(SearchKey::Uid(SequenceSet::parse("1").unwrap()), true);
        check(SearchKey::Uid(SequenceSet::parse("2").unwrap()), false);
        check(
            SearchKey::Not(Box::new(SearchKey::Uid(SequenceSet::parse("2").unwrap()))),
            true,
        );
    }
}
