//! Minimal RFC 5322 / MIME decoding: header unfolding, encoded words,
//! multipart walking and transfer-encoding decoding.

use super::Headers;
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

const MAX_MIME_DEPTH: usize = 10;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?]*)\?=").expect("valid encoded-word regex");
    static ref ENCODED_WORD_GAP: Regex =
        Regex::new(r"(\?=)\s+(=\?)").expect("valid encoded-word gap regex");
}

/// A header value split into its main token and `; key=value` parameters
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderParams {
    pub value: String,
    pub params: HashMap<String, String>,
}

/// A leaf part of a (possibly multipart) message
#[derive(Debug, Clone)]
pub struct MimePart {
    pub content_type: String,
    pub filename: Option<String>,
    pub is_attachment: bool,
    pub size: usize,
    pub text: Option<String>,
}

/// Split a normalized (`\n` line endings) message into header block and body
pub fn split_message(raw: &str) -> (&str, &str) {
    if let Some(rest) = raw.strip_prefix('\n') {
        return ("", rest);
    }
    match raw.find("\n\n") {
        Some(pos) => (&raw[..pos], &raw[pos + 2..]),
        None => (raw, ""),
    }
}

/// Field name followed by a colon, e.g. `Subject:`
pub fn looks_like_header_line(line: &str) -> bool {
    match line.find(':') {
        Some(0) | None => false,
        Some(pos) => line[..pos].chars().all(|c| c.is_ascii_graphic()),
    }
}

/// Parse a header block, unfolding continuation lines and keeping repeats in order
pub fn parse_header_block(block: &str) -> Headers {
    let mut headers = Headers::new();
    let mut current: Option<(String, String)> = None;

    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if !looks_like_header_line(line) {
            // mbox "From " separators and stray lines are ignored
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.push(name, value);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }

    if let Some((name, value)) = current {
        headers.push(name, value);
    }
    headers
}

/// Decode RFC 2047 encoded words (`=?utf-8?B?...?=`) in a header value
pub fn decode_header_value(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    let joined = ENCODED_WORD_GAP.replace_all(value, "$1$2");
    ENCODED_WORD
        .replace_all(&joined, |caps: &regex::Captures| {
            let charset = &caps[1];
            let payload = &caps[3];
            let bytes = match &caps[2] {
                "B" | "b" => match general_purpose::STANDARD.decode(payload.trim()) {
                    Ok(bytes) => bytes,
                    Err(_) => return caps[0].to_string(),
                },
                _ => decode_q_encoding(payload),
            };
            bytes_to_string(&bytes, Some(charset))
        })
        .into_owned()
}

fn decode_q_encoding(payload: &str) -> Vec<u8> {
    let underscores = payload.replace('_', " ");
    decode_quoted_printable(&underscores)
}

/// Decode a quoted-printable body, honouring soft line breaks
pub fn decode_quoted_printable(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'=' {
            if bytes.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if let (Some(high), Some(low)) = (
                bytes.get(i + 1).and_then(|b| hex_value(*b)),
                bytes.get(i + 2).and_then(|b| hex_value(*b)),
            ) {
                out.push((high << 4) | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Decode a base64 body; undecodable input is returned unchanged
pub fn decode_base64(input: &str) -> Vec<u8> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    match general_purpose::STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("Base64 body did not decode ({e}), keeping raw text");
            input.as_bytes().to_vec()
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(high), Some(low)) = (
                bytes.get(i + 1).and_then(|b| hex_value(*b)),
                bytes.get(i + 2).and_then(|b| hex_value(*b)),
            ) {
                out.push((high << 4) | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Convert decoded bytes to text. Latin-1 style charsets map byte-to-char,
/// everything else is treated as UTF-8.
pub fn bytes_to_string(bytes: &[u8], charset: Option<&str>) -> String {
    let charset = charset.unwrap_or("utf-8").to_ascii_lowercase();
    match charset.as_str() {
        "iso-8859-1" | "latin1" | "windows-1252" | "cp1252" | "us-ascii" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Parse `value; key=value; key="quoted"` header syntax
pub fn parse_params(header: &str) -> HeaderParams {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in header.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    let mut iter = segments.into_iter();
    let value = iter.next().unwrap_or_default().trim().to_lowercase();
    let mut params = HashMap::new();

    for segment in iter {
        if let Some((key, raw)) = segment.split_once('=') {
            let key = key.trim().to_lowercase();
            let raw = raw.trim().trim_matches('"');
            if let Some(base) = key.strip_suffix('*') {
                // RFC 2231: charset'language'percent-encoded
                let encoded = raw.rsplit("''").next().unwrap_or(raw);
                let decoded = String::from_utf8_lossy(&percent_decode(encoded)).into_owned();
                params.insert(base.to_string(), decoded);
            } else {
                params.insert(key, raw.to_string());
            }
        }
    }

    HeaderParams { value, params }
}

fn split_multipart<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let delimiter = format!("--{boundary}");
    let close = format!("--{boundary}--");
    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == close {
            if let Some(start) = current.take() {
                parts.push(&body[start..offset]);
            }
            break;
        }
        if trimmed == delimiter {
            if let Some(start) = current.take() {
                parts.push(&body[start..offset]);
            }
            current = Some(offset + line.len());
        }
        offset += line.len();
    }

    if let Some(start) = current {
        if start < body.len() {
            parts.push(&body[start..]);
        }
    }
    parts
}

/// Walk the MIME tree and collect every leaf part
pub fn collect_parts(headers: &Headers, body: &str, out: &mut Vec<MimePart>) {
    collect_parts_at(headers, body, 0, out);
}

fn collect_parts_at(headers: &Headers, body: &str, depth: usize, out: &mut Vec<MimePart>) {
    let content_type = headers
        .get("content-type")
        .map(parse_params)
        .unwrap_or_else(|| HeaderParams {
            value: "text/plain".to_string(),
            params: HashMap::new(),
        });
    let mime = content_type.value.clone();

    if depth < MAX_MIME_DEPTH {
        if mime.starts_with("multipart/") {
            if let Some(boundary) = content_type.params.get("boundary") {
                for part in split_multipart(body, boundary) {
                    let (header_block, part_body) = split_message(part);
                    let part_headers = parse_header_block(header_block);
                    collect_parts_at(&part_headers, part_body, depth + 1, out);
                }
                return;
            }
            log::debug!("Multipart part without boundary, treating as text");
        } else if mime == "message/rfc822" {
            let (header_block, inner_body) = split_message(body);
            let inner_headers = parse_header_block(header_block);
            collect_parts_at(&inner_headers, inner_body, depth + 1, out);
            return;
        }
    }

    let encoding = headers
        .get("content-transfer-encoding")
        .unwrap_or("7bit")
        .trim()
        .to_lowercase();
    let bytes = match encoding.as_str() {
        "base64" => decode_base64(body),
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.as_bytes().to_vec(),
    };

    let disposition = headers.get("content-disposition").map(parse_params);
    let filename = disposition
        .as_ref()
        .and_then(|d| d.params.get("filename").cloned())
        .or_else(|| content_type.params.get("name").cloned())
        .map(|name| decode_header_value(&name));

    let is_attachment = disposition
        .as_ref()
        .map(|d| d.value == "attachment")
        .unwrap_or(false)
        || (filename.is_some() && !mime.starts_with("text/"));

    let text = if !is_attachment && mime.starts_with("text/") {
        let charset = content_type.params.get("charset").map(String::as_str);
        Some(bytes_to_string(&bytes, charset))
    } else {
        None
    };

    out.push(MimePart {
        content_type: mime,
        filename,
        is_attachment,
        size: bytes.len(),
        text,
    });
}
