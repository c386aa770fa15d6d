//! RFC 2047 encoded-word decoding for header values and attachment names.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

use crate::mail_reader::error::{Result, SyncError};

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]*)\?([bBqQ])\?([^?\s]*)\?=").unwrap();
}

// Mailers regularly drop the trailing `=` padding inside encoded words.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the first segment of a header value.
///
/// A segment is either the plain text preceding the first encoded word, or a
/// run of adjacent encoded words sharing one charset. Adjacent words are
/// joined at the byte level before charset decoding so multibyte sequences
/// split across words survive. A value without encoded words is returned
/// unfolded and trimmed.
///
/// Fails when the charset is unknown or the word payload is malformed.
pub fn decode_first_segment(value: &str) -> Result<String> {
    let value = unfold(value);

    let Some(first) = ENCODED_WORD.captures(&value) else {
        return Ok(value.trim().to_string());
    };
    let whole = first.get(0).unwrap();

    let leading = value[..whole.start()].trim();
    if !leading.is_empty() {
        return Ok(leading.to_string());
    }

    let charset = first[1].to_string();
    let mut bytes = decode_transfer(&first[2], &first[3])?;
    let rest_start = whole.end();
    let mut cursor = rest_start;

    for next in ENCODED_WORD.captures_iter(&value[rest_start..]) {
        let span = next.get(0).unwrap();
        let between = &value[cursor..rest_start + span.start()];
        if !between.trim().is_empty() || !next[1].eq_ignore_ascii_case(&charset) {
            break;
        }
        bytes.extend(decode_transfer(&next[2], &next[3])?);
        cursor = rest_start + span.end();
    }

    decode_charset(&charset, &bytes)
}

/// Decode `bytes` from the named charset into a `String`.
///
/// An empty label means UTF-8. RFC 2231 language suffixes (`utf-8*en`) are
/// ignored. Malformed sequences are replaced, but an unknown label is an
/// error rather than a silent fallback.
pub fn decode_charset(label: &str, bytes: &[u8]) -> Result<String> {
    let label = label.split('*').next().unwrap_or_default().trim();
    let encoding = if label.is_empty() {
        encoding_rs::UTF_8
    } else {
        Encoding::for_label_no_replacement(label.as_bytes())
            .ok_or_else(|| SyncError::Decoding(format!("unsupported charset '{}'", label)))?
    };
    let (text, _) = encoding.decode_with_bom_removal(bytes);
    Ok(text.into_owned())
}

fn unfold(value: &str) -> String {
    value.replace("\r\n", "").replace('\n', "")
}

fn decode_transfer(encoding: &str, payload: &str) -> Result<Vec<u8>> {
    match encoding {
        "b" | "B" => LENIENT_BASE64
            .decode(payload)
            .map_err(|e| SyncError::Decoding(format!("bad base64 encoded word: {}", e))),
        _ => q_decode(payload),
    }
}

fn q_decode(payload: &str) -> Result<Vec<u8>> {
    let raw = payload.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        SyncError::Decoding(format!("bad quoted-printable encoded word: {}", payload))
                    })?;
                out.push(hex);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Ok(out)
}
