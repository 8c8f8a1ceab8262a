//! FETCH data item resolution and response rendering: envelopes,
//! body structures, section addressing and the literal syntax the
//! responses carry message bytes in.
use mailnest_store::StoredMessage;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, SingleInfo};
use rfc3501::{format_date_time, format_flags, FetchItem, Flag, Section, SectionText};

/// Whether any requested item implicitly sets `\Seen`.
pub fn needs_seen(items: &[FetchItem]) -> bool {
    items.iter().any(|item| {
        matches!(
            item,
            FetchItem::Rfc822
                | FetchItem::Rfc822Text
                | FetchItem::BodySection { peek: false, .. }
        )
    })
}

/// Render one complete untagged FETCH response, ready to write.
/// `extra_flags` carries a flag update (from an implicit `\Seen`) to
/// report in the same response when FLAGS was not itself requested.
pub fn render_fetch(
    seq: u32,
    message: &StoredMessage,
    items: &[FetchItem],
    include_uid: bool,
    extra_flags: Option<&[Flag]>,
) -> Vec<u8> {
    let parsed = message.parsed().ok();
    let mut parts: Vec<Vec<u8>> = vec![];
    let mut saw_uid = false;
    let mut saw_flags = false;

    for item in items {
        match item {
            FetchItem::Uid => {
                saw_uid = true;
                parts.push(format!("UID {}", message.uid).into_bytes());
            }
            FetchItem::Flags => {
                saw_flags = true;
                parts.push(render_current_flags(message, extra_flags).into_bytes());
            }
            FetchItem::InternalDate => {
                parts.push(
                    format!(
                        "INTERNALDATE \"{}\"",
                        format_date_time(&message.internal_date)
                    )
                    .into_bytes(),
                );
            }
            FetchItem::Rfc822Size => {
                parts.push(format!("RFC822.SIZE {}", message.size()).into_bytes());
            }
            FetchItem::Envelope => {
                let envelope = match parsed.as_ref() {
                    Some(parsed) => render_envelope(parsed),
                    None => "(NIL NIL NIL NIL NIL NIL NIL NIL NIL NIL)".to_string(),
                };
                parts.push(format!("ENVELOPE {envelope}").into_bytes());
            }
            FetchItem::Rfc822 => parts.push(literal_item("RFC822", message.raw())),
            FetchItem::Rfc822Header => {
                parts.push(literal_item("RFC822.HEADER", &header_of(message.raw())))
            }
            FetchItem::Rfc822Text => {
                parts.push(literal_item("RFC822.TEXT", &body_of(message.raw())))
            }
            FetchItem::Body => {
                let structure = render_structure_or_default(parsed.as_ref());
                parts.push(format!("BODY {structure}").into_bytes());
            }
            FetchItem::BodyStructure => {
                let structure = render_structure_or_default(parsed.as_ref());
                parts.push(format!("BODYSTRUCTURE {structure}").into_bytes());
            }
            FetchItem::BodySection {
                section, partial, ..
            } => {
                let name = section_item_name(section, *partial);
                match section_bytes(message.raw(), parsed.as_ref(), section) {
                    Some(bytes) => {
                        let sliced = apply_partial(&bytes, *partial);
                        let mut rendered = format!("{name} {{{}}}\r\n", sliced.len()).into_bytes();
                        rendered.extend_from_slice(sliced);
                        parts.push(rendered);
                    }
                    None => parts.push(format!("{name} NIL").into_bytes()),
                }
            }
        }
    }

    if include_uid && !saw_uid {
        parts.insert(0, format!("UID {}", message.uid).into_bytes());
    }
    if let Some(flags) = extra_flags {
        if !saw_flags {
            parts.push(format!("FLAGS {}", format_flags(flags.iter())).into_bytes());
        }
    }

    let mut out = format!("* {seq} FETCH (").into_bytes();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(part);
    }
    out.extend_from_slice(b")\r\n");
    out
}

fn render_current_flags(message: &StoredMessage, extra_flags: Option<&[Flag]>) -> String {
    match extra_flags {
        Some(flags) => format!("FLAGS {}", format_flags(flags.iter())),
        None => format!("FLAGS {}", format_flags(message.flags.iter())),
    }
}

fn render_structure_or_default(parsed: Option<&ParsedMail>) -> String {
    match parsed {
        Some(parsed) => render_bodystructure(parsed),
        None => "(\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 0 0)".to_string(),
    }
}

fn literal_item(name: &str, bytes: &[u8]) -> Vec<u8> {
    let mut out = format!("{name} {{{}}}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out
}

fn apply_partial(bytes: &[u8], partial: Option<(u32, u32)>) -> &[u8] {
    match partial {
        None => bytes,
        Some((start, length)) => {
            let start = (start as usize).min(bytes.len());
            let end = start.saturating_add(length as usize).min(bytes.len());
            &bytes[start..end]
        }
    }
}

/// The header block including the terminating blank line.
pub fn header_of(raw: &[u8]) -> Vec<u8> {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => raw[..idx + 4].to_vec(),
        None => {
            let mut out = raw.to_vec();
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

/// Everything after the header block.
pub fn body_of(raw: &[u8]) -> Vec<u8> {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => raw[idx + 4..].to_vec(),
        None => vec![],
    }
}

fn section_item_name(section: &Section, partial: Option<(u32, u32)>) -> String {
    let mut spec = section
        .parts
        .iter()
        .map(u32::to_string)
        .collect::<Vec<String>>()
        .join(".");
    if let Some(text) = &section.text {
        if !spec.is_empty() {
            spec.push('.');
        }
        match text {
            SectionText::Header => spec.push_str("HEADER"),
            SectionText::HeaderFields(fields) => {
                spec.push_str(&format!("HEADER.FIELDS ({})", fields.join(" ")))
            }
            SectionText::HeaderFieldsNot(fields) => {
                spec.push_str(&format!("HEADER.FIELDS.NOT ({})", fields.join(" ")))
            }
            SectionText::Text => spec.push_str("TEXT"),
            SectionText::Mime => spec.push_str("MIME"),
        }
    }
    match partial {
        // Only the origin octet is echoed back, per the grammar.
        Some((start, _)) => format!("BODY[{spec}]<{start}>"),
        None => format!("BODY[{spec}]"),
    }
}

fn resolve_part<'a>(parsed: &'a ParsedMail<'a>, parts: &[u32]) -> Option<&'a ParsedMail<'a>> {
    let mut cur = parsed;
    for &number in parts {
        if number == 0 {
            return None;
        }
        if cur.subparts.is_empty() {
            // Part 1 of a non-multipart message is the message body.
            if number == 1 {
                continue;
            }
            return None;
        }
        cur = cur.subparts.get(number as usize - 1)?;
    }
    Some(cur)
}

/// Resolve a BODY[] section to its raw bytes, or None if the part
/// does not exist.
pub fn section_bytes(
    raw: &[u8],
    parsed: Option<&ParsedMail>,
    section: &Section,
) -> Option<Vec<u8>> {
    let part_raw: Vec<u8> = if section.parts.is_empty() {
        raw.to_vec()
    } else {
        let parsed = parsed?;
        resolve_part(parsed, &section.parts)?.raw_bytes.to_vec()
    };

    match &section.text {
        None => {
            if section.parts.is_empty() {
                // BODY[] is the entire message.
                Some(part_raw)
            } else {
                // BODY[n] is the part content without its MIME header.
                Some(body_of(&part_raw))
            }
        }
        Some(SectionText::Header) | Some(SectionText::Mime) => Some(header_of(&part_raw)),
        Some(SectionText::Text) => Some(body_of(&part_raw)),
        Some(SectionText::HeaderFields(fields)) => {
            Some(filter_headers(&header_of(&part_raw), fields, true))
        }
        Some(SectionText::HeaderFieldsNot(fields)) => {
            Some(filter_headers(&header_of(&part_raw), fields, false))
        }
    }
}

/// Keep (or drop) the named header fields, preserving continuation
/// lines, and terminate with the blank line clients expect.
fn filter_headers(header_block: &[u8], fields: &[String], keep: bool) -> Vec<u8> {
    let mut out = vec![];
    let mut keeping = false;
    for line in split_inclusive_crlf(header_block) {
        if line == b"\r\n" {
            break;
        }
        let is_continuation = line.first().map_or(false, |b| *b == b' ' || *b == b'\t');
        if !is_continuation {
            let name = line
                .split(|b| *b == b':')
                .next()
                .map(|n| String::from_utf8_lossy(n).trim().to_string())
                .unwrap_or_default();
            let listed = fields.iter().any(|f| f.eq_ignore_ascii_case(&name));
            keeping = listed == keep;
        }
        if keeping {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn split_inclusive_crlf(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = vec![];
    let mut start = 0;
    for idx in 0..bytes.len() {
        if bytes[idx] == b'\n' {
            out.push(&bytes[start..=idx]);
            start = idx + 1;
        }
    }
    if start < bytes.len() {
        out.push(&bytes[start..]);
    }
    out
}

fn imap_string(value: &str) -> String {
    if value
        .bytes()
        .any(|b| b == b'\r' || b == b'\n' || b >= 0x80)
    {
        format!("{{{}}}\r\n{}", value.len(), value)
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    }
}

fn nstring(value: Option<String>) -> String {
    match value {
        Some(value) => imap_string(&value),
        None => "NIL".to_string(),
    }
}

fn render_single_address(single: &SingleInfo) -> String {
    let (mailbox, host) = match single.addr.split_once('@') {
        Some((mailbox, host)) => (mailbox.to_string(), Some(host.to_string())),
        None => (single.addr.clone(), None),
    };
    format!(
        "({} NIL {} {})",
        nstring(single.display_name.clone()),
        imap_string(&mailbox),
        nstring(host)
    )
}

fn address_list(parsed: &ParsedMail, header: &str) -> Option<String> {
    let value = parsed.headers.get_first_value(header)?;
    let addresses = mailparse::addrparse(&value).ok()?;
    if addresses.is_empty() {
        return None;
    }
    let mut out = String::from("(");
    for address in addresses.iter() {
        match address {
            MailAddr::Single(single) => out.push_str(&render_single_address(single)),
            MailAddr::Group(group) => {
                for single in &group.addrs {
                    out.push_str(&render_single_address(single));
                }
            }
        }
    }
    out.push(')');
    Some(out)
}

/// RFC 3501 ENVELOPE: date, subject, from, sender, reply-to, to, cc,
/// bcc, in-reply-to, message-id. Sender and reply-to default to the
/// from list when the headers are absent.
pub fn render_envelope(parsed: &ParsedMail) -> String {
    let headers = &parsed.headers;
    let from = address_list(parsed, "From");
    let sender = address_list(parsed, "Sender").or_else(|| from.clone());
    let reply_to = address_list(parsed, "Reply-To").or_else(|| from.clone());
    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        nstring(headers.get_first_value("Date")),
        nstring(headers.get_first_value("Subject")),
        from.clone().unwrap_or_else(|| "NIL".to_string()),
        sender.unwrap_or_else(|| "NIL".to_string()),
        reply_to.unwrap_or_else(|| "NIL".to_string()),
        address_list(parsed, "To").unwrap_or_else(|| "NIL".to_string()),
        address_list(parsed, "Cc").unwrap_or_else(|| "NIL".to_string()),
        address_list(parsed, "Bcc").unwrap_or_else(|| "NIL".to_string()),
        nstring(headers.get_first_value("In-Reply-To")),
        nstring(headers.get_first_value("Message-ID")),
    )
}

/// Non-extensible BODYSTRUCTURE. Multiparts nest; text parts carry
/// their line count.
pub fn render_bodystructure(part: &ParsedMail) -> String {
    if !part.subparts.is_empty() {
        let children: String = part.subparts.iter().map(render_bodystructure).collect();
        let subtype = part
            .ctype
            .mimetype
            .split('/')
            .nth(1)
            .unwrap_or("MIXED")
            .to_ascii_uppercase();
        return format!("({children} {})", imap_string(&subtype));
    }

    let (mime_type, subtype) = part
        .ctype
        .mimetype
        .split_once('/')
        .unwrap_or(("text", "plain"));
    let mime_type = mime_type.to_ascii_uppercase();
    let subtype = subtype.to_ascii_uppercase();

    let mut params = vec![];
    if !part.ctype.charset.is_empty() {
        params.push(format!(
            "\"CHARSET\" {}",
            imap_string(&part.ctype.charset.to_ascii_uppercase())
        ));
    }
    for (name, value) in &part.ctype.params {
        if name.eq_ignore_ascii_case("charset") {
            continue;
        }
        params.push(format!(
            "{} {}",
            imap_string(&name.to_ascii_uppercase()),
            imap_string(value)
        ));
    }
    let params = if params.is_empty() {
        "NIL".to_string()
    } else {
        format!("({})", params.join(" "))
    };

    let encoding = part
        .headers
        .get_first_value("Content-Transfer-Encoding")
        .map(|enc| enc.to_ascii_uppercase())
        .unwrap_or_else(|| "7BIT".to_string());
    let body = body_of(part.raw_bytes);
    let size = body.len();

    if mime_type == "TEXT" {
        let lines = body.iter().filter(|b| **b == b'\n').count();
        format!(
            "({} {} {params} NIL NIL {} {size} {lines})",
            imap_string(&mime_type),
            imap_string(&subtype),
            imap_string(&encoding)
        )
    } else {
        format!(
            "({} {} {params} NIL NIL {} {size})",
            imap_string(&mime_type),
            imap_string(&subtype),
            imap_string(&encoding)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    const RAW: &[u8] = b"From: Fred Foobar <foobar@example.com>\r\n\
To: mooch@owatagu.example.net\r\n\
Subject: afternoon meeting\r\n\
Date: Wed, 17 Jul 1996 02:23:25 -0700\r\n\
Message-ID: <B27397-0100000@example.com>\r\n\
\r\n\
Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    #[test]
    fn envelope_rendering() {
        let parsed = mailparse::parse_mail(RAW).unwrap();
        assert_equal!(
            render_envelope(&parsed),
            "(\"Wed, 17 Jul 1996 02:23:25 -0700\" \"afternoon meeting\" \
             ((\"Fred Foobar\" NIL \"foobar\" \"example.com\")) \
             ((\"Fred Foobar\" NIL \"foobar\" \"example.com\")) \
             ((\"Fred Foobar\" NIL \"foobar\" \"example.com\")) \
             ((NIL NIL \"mooch\" \"owatagu.example.net\")) \
             NIL NIL NIL \"<B27397-0100000@example.com>\")"
                .to_string()
        );
    }

    #[test]
    fn bodystructure_for_plain_text() {
        let parsed = mailparse::parse_mail(RAW).unwrap();
        let structure = render_bodystructure(&parsed);
        assert!(structure.starts_with("(\"TEXT\" \"PLAIN\""));
        assert!(structure.ends_with(" 1)"), "has a line count: {structure}");
    }

    #[test]
    fn header_fields_section() {
        let section = Section {
            parts: vec![],
            text: Some(SectionText::HeaderFields(vec!["Subject".to_string()])),
        };
        let bytes = section_bytes(RAW, mailparse::parse_mail(RAW).ok().as_ref(), &section).unwrap();
        assert_equal!(bytes, b"Subject: afternoon meeting\r\n\r\n".to_vec());
    }

    #[test]
    fn header_fields_not_section() {
        let section = Section {
            parts: vec![],
            text: Some(SectionText::HeaderFieldsNot(vec![
                "Subject".to_string(),
                "Date".to_string(),
                "Message-ID".to_string(),
            ])),
        };
        let bytes = section_bytes(RAW, mailparse::parse_mail(RAW).ok().as_ref(), &section).unwrap();
        assert_equal!(
            bytes,
            b"From: Fred Foobar <foobar@example.com>\r\nTo: mooch@owatagu.example.net\r\n\r\n"
                .to_vec()
        );
    }

    #[test]
    fn full_and_text_sections() {
        let parsed = mailparse::parse_mail(RAW).unwrap();
        let full = section_bytes(RAW, Some(&parsed), &Section::default()).unwrap();
        assert_equal!(full, RAW.to_vec());

        let text = section_bytes(
            RAW,
            Some(&parsed),
            &Section {
                parts: vec![],
                text: Some(SectionText::Text),
            },
        )
        .unwrap();
        assert_equal!(
            text,
            b"Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n".to_vec()
        );
    }

    #[test]
    fn multipart_part_addressing() {
        let raw = b"From: a@b\r\n\
Content-Type: multipart/alternative; boundary=XX\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain body\r\n\
--XX\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html body</p>\r\n\
--XX--\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();
        let section = Section {
            parts: vec![2],
            text: None,
        };
        let bytes = section_bytes(raw, Some(&parsed), &section).unwrap();
        assert_equal!(
            String::from_utf8_lossy(&bytes).contains("html body"),
            true
        );

        // A part that does not exist resolves to None.
        let missing = Section {
            parts: vec![3],
            text: None,
        };
        assert_equal!(section_bytes(raw, Some(&parsed), &missing), None);
    }

    #[test]
    fn partial_slicing() {
        assert_equal!(apply_partial(b"abcdef", Some((2, 3))), b"cde" as &[u8]);
        assert_equal!(apply_partial(b"abcdef", Some((4, 10))), b"ef" as &[u8]);
        assert_equal!(apply_partial(b"abcdef", Some((9, 1))), b"" as &[u8]);
        assert_equal!(apply_partial(b"abcdef", None), b"abcdef" as &[u8]);
    }

    #[test]
    fn seen_detection() {
        use rfc3501::FetchItem;
        assert_equal!(needs_seen(&[FetchItem::Flags, FetchItem::Envelope]), false);
        assert_equal!(
            needs_seen(&[FetchItem::BodySection {
                peek: true,
                section: Section::default(),
                partial: None
            }]),
            false
        );
        assert_equal!(
            needs_seen(&[FetchItem::BodySection {
                peek: false,
                section: Section::default(),
                partial: None
            }]),
            true
        );
        assert_equal!(needs_seen(&[FetchItem::Rfc822]), true);
    }
}
