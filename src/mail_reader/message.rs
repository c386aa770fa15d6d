use lazy_static::lazy_static;
use log::debug;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;

use crate::mail_reader::encoded_word::{decode_charset, decode_first_segment};
use crate::mail_reader::error::Result;

pub const UNNAMED_ATTACHMENT: &str = "unnamed_attachment";

lazy_static! {
    static ref CHARSET_PARAM: Regex = Regex::new(r"(?i)(?:^|;)\s*charset\*?\s*=").unwrap();
}

/// A message exactly as the server handed it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedEmail {
    pub uid: u32,
    pub from: String,
    pub to: Option<String>,
    pub subject: String,
    pub date: Option<String>,
    pub body: String,
    pub attachments: Vec<AttachmentPart>,
}

/// An attachment after transfer decoding, before it is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    PlainText,
    Html,
    Attachment,
    Other,
}

/// The part tree of a parsed message.
#[derive(Debug)]
pub enum MimeNode<'a> {
    Leaf {
        kind: LeafKind,
        part: &'a ParsedMail<'a>,
    },
    Multipart {
        children: Vec<MimeNode<'a>>,
    },
}

impl<'a> MimeNode<'a> {
    pub fn build(root: &'a ParsedMail<'a>) -> Self {
        Self::classify(root, true)
    }

    fn classify(part: &'a ParsedMail<'a>, is_root: bool) -> Self {
        let mimetype = part.ctype.mimetype.to_lowercase();
        if mimetype.starts_with("multipart/") {
            return MimeNode::Multipart {
                children: part
                    .subparts
                    .iter()
                    .map(|sub| Self::classify(sub, false))
                    .collect(),
            };
        }

        let kind = if !is_root && is_distinct_part(part) {
            LeafKind::Attachment
        } else {
            match mimetype.as_str() {
                "text/plain" => LeafKind::PlainText,
                "text/html" => LeafKind::Html,
                _ => LeafKind::Other,
            }
        };
        MimeNode::Leaf { kind, part }
    }
}

// A part is presented separately when it has a Content-Disposition header that
// either says "attachment" or names a file. A bare `inline` disposition on a
// text body does not make it an attachment.
fn is_distinct_part(part: &ParsedMail) -> bool {
    if part.headers.get_first_header("Content-Disposition").is_none() {
        return false;
    }
    let disposition = part.get_content_disposition();
    disposition.disposition == DispositionType::Attachment || declared_filename(part).is_some()
}

fn declared_filename(part: &ParsedMail) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
}

#[derive(Default)]
struct Selection<'a> {
    plain: Option<&'a ParsedMail<'a>>,
    html: Option<&'a ParsedMail<'a>>,
    attachments: Vec<&'a ParsedMail<'a>>,
}

// Depth-first, document order. The first plain text part ends the body
// search; until then every HTML part replaces the previous one. Attachments
// are collected across the whole tree regardless.
fn select<'a>(node: &MimeNode<'a>, mut acc: Selection<'a>) -> Selection<'a> {
    match node {
        MimeNode::Multipart { children } => children.iter().fold(acc, |acc, child| select(child, acc)),
        MimeNode::Leaf { kind, part } => {
            match kind {
                LeafKind::PlainText if acc.plain.is_none() => acc.plain = Some(*part),
                LeafKind::Html if acc.plain.is_none() => acc.html = Some(*part),
                LeafKind::Attachment => acc.attachments.push(*part),
                _ => {}
            }
            acc
        }
    }
}

fn header(parsed: &ParsedMail, name: &str) -> Result<Option<String>> {
    match parsed.headers.get_first_header(name) {
        Some(h) => decode_first_segment(&String::from_utf8_lossy(h.get_value_raw())).map(Some),
        None => Ok(None),
    }
}

// mailparse reports `us-ascii` when no charset is given; an undeclared
// charset is read as UTF-8 instead.
fn decode_text(part: &ParsedMail) -> Result<String> {
    let bytes = part.get_body_raw()?;
    let declared = part
        .headers
        .get_first_value("Content-Type")
        .is_some_and(|value| CHARSET_PARAM.is_match(&value));
    let label = if declared { part.ctype.charset.as_str() } else { "" };
    decode_charset(label, &bytes)
}

fn extract_attachment(part: &ParsedMail) -> Result<AttachmentPart> {
    let filename = match declared_filename(part) {
        Some(name) => decode_first_segment(&name)?,
        None => UNNAMED_ATTACHMENT.to_string(),
    };
    Ok(AttachmentPart {
        filename,
        content_type: part.ctype.mimetype.clone(),
        content: part.get_body_raw()?,
    })
}

/// Decode headers, pick the body and pull out the attachment parts.
///
/// Any failure (malformed MIME, bad transfer encoding, unknown charset) fails
/// the whole message.
pub fn decode(raw: &RawMessage) -> Result<DecodedEmail> {
    let parsed = parse_mail(&raw.bytes)?;
    let tree = MimeNode::build(&parsed);
    let selection = select(&tree, Selection::default());

    let body = match selection.plain.or(selection.html) {
        Some(part) => decode_text(part)?,
        None => String::new(),
    };
    let attachments = selection
        .attachments
        .into_iter()
        .map(extract_attachment)
        .collect::<Result<Vec<_>>>()?;

    let email = DecodedEmail {
        uid: raw.uid,
        from: header(&parsed, "From")?.unwrap_or_else(|| "No Sender".to_string()),
        to: header(&parsed, "To")?,
        subject: header(&parsed, "Subject")?.unwrap_or_else(|| "No Subject".to_string()),
        date: header(&parsed, "Date")?,
        body,
        attachments,
    };
    debug!(
        "decoded message {} ({} attachment(s))",
        email.uid,
        email.attachments.len()
    );
    Ok(email)
}
