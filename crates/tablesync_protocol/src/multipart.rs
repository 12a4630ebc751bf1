//! Multipart bodies for batched file transfer.
//!
//! Uploads are sent as `multipart/form-data`; download responses come back
//! as `multipart/mixed`. Every part names its file in the
//! `Content-Disposition` header, which is how a response part is matched to
//! the file that was requested.

use crate::error::{ProtocolError, ProtocolResult};

const CRLF: &[u8] = b"\r\n";

/// Which multipart flavor a body uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartKind {
    /// `multipart/form-data`, used for uploads.
    FormData,
    /// `multipart/mixed`, used for download responses.
    Mixed,
}

impl MultipartKind {
    fn media_type(&self) -> &'static str {
        match self {
            MultipartKind::FormData => "multipart/form-data",
            MultipartKind::Mixed => "multipart/mixed",
        }
    }

    fn disposition(&self, filename: &str) -> String {
        match self {
            MultipartKind::FormData => {
                format!("form-data; name=\"file\"; filename=\"{filename}\"")
            }
            MultipartKind::Mixed => format!("attachment; filename=\"{filename}\""),
        }
    }
}

/// One file carried in a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// File name relative to the row's attachment set.
    pub filename: String,
    /// MIME type of the contents.
    pub content_type: String,
    /// Raw bytes.
    pub contents: Vec<u8>,
}

impl FilePart {
    /// Creates a part, guessing the content type from the file extension.
    pub fn new(filename: impl Into<String>, contents: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = content_type_for(&filename);
        Self {
            filename,
            content_type,
            contents,
        }
    }
}

/// Guesses a MIME type from a file name.
pub fn content_type_for(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Returns the `Content-Type` header value for a body.
pub fn content_type(kind: MultipartKind, boundary: &str) -> String {
    format!("{}; boundary={boundary}", kind.media_type())
}

/// Extracts the boundary parameter from a multipart `Content-Type` value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (name, raw) = param.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let boundary = raw.trim().trim_matches('"');
        (!boundary.is_empty()).then(|| boundary.to_string())
    })
}

/// Encodes parts into a multipart body.
pub fn encode(kind: MultipartKind, boundary: &str, parts: &[FilePart]) -> Vec<u8> {
    let payload: usize = parts.iter().map(|p| p.contents.len() + 160).sum();
    let mut body = Vec::with_capacity(payload + boundary.len() + 8);
    for part in parts {
        body.extend_from_slice(b"--");
        body.extend_from_slice(boundary.as_bytes());
        body.extend_from_slice(CRLF);
        body.extend_from_slice(b"Content-Disposition: ");
        body.extend_from_slice(kind.disposition(&part.filename).as_bytes());
        body.extend_from_slice(CRLF);
        body.extend_from_slice(b"Content-Type: ");
        body.extend_from_slice(part.content_type.as_bytes());
        body.extend_from_slice(CRLF);
        body.extend_from_slice(CRLF);
        body.extend_from_slice(&part.contents);
        body.extend_from_slice(CRLF);
    }
    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"--");
    body.extend_from_slice(CRLF);
    body
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Multipart(msg.into())
}

fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (name, raw) = param.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        Some(raw.trim().trim_matches('"').to_string())
    })
}

fn parse_part(raw: &[u8]) -> ProtocolResult<FilePart> {
    let split = find(raw, b"\r\n\r\n", 0).ok_or_else(|| malformed("part without header block"))?;
    let headers = std::str::from_utf8(&raw[..split])
        .map_err(|_| malformed("part headers are not UTF-8"))?;

    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            filename = disposition_filename(value);
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    let filename = filename.ok_or_else(|| malformed("part without a filename"))?;
    Ok(FilePart {
        content_type: content_type.unwrap_or_else(|| content_type_for(&filename)),
        filename,
        contents: raw[split + 4..].to_vec(),
    })
}

/// Decodes a multipart body given its `Content-Type` header value.
///
/// # Errors
///
/// Returns `ProtocolError::Multipart` if the header carries no boundary or
/// the body is truncated.
pub fn decode(content_type: &str, body: &[u8]) -> ProtocolResult<Vec<FilePart>> {
    let boundary = boundary_from_content_type(content_type)
        .ok_or_else(|| malformed(format!("no boundary in {content_type:?}")))?;
    let opening = format!("--{boundary}");
    let delimiter = format!("\r\n--{boundary}");

    let first = find(body, opening.as_bytes(), 0).ok_or_else(|| malformed("missing opening boundary"))?;
    let mut cursor = first + opening.len();
    let mut parts = Vec::new();

    loop {
        if body[cursor..].starts_with(b"--") {
            return Ok(parts);
        }
        if !body[cursor..].starts_with(CRLF) {
            return Err(malformed("boundary not followed by CRLF"));
        }
        let start = cursor + CRLF.len();
        let end = find(body, delimiter.as_bytes(), start)
            .ok_or_else(|| malformed("missing closing boundary"))?;
        parts.push(parse_part(&body[start..end])?);
        cursor = end + delimiter.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_preserves_parts() {
        let parts = vec![
            FilePart::new("a.jpg", vec![0, 1, 2, 13, 10, 255]),
            FilePart::new("notes/b.txt", b"hello\r\n--not-a-boundary".to_vec()),
            FilePart::new("empty.bin", Vec::new()),
        ];
        let header = content_type(MultipartKind::FormData, "xyz123");
        let body = encode(MultipartKind::FormData, "xyz123", &parts);
        assert_eq!(decode(&header, &body).unwrap(), parts);
    }

    #[test]
    fn mixed_parts_use_attachment_disposition() {
        let body = encode(MultipartKind::Mixed, "b", &[FilePart::new("x.png", vec![1])]);
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Content-Disposition: attachment; filename=\"x.png\""));
        assert!(text.contains("Content-Type: image/png"));
    }

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type_for("media/photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("notes.txt"), "text/plain");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("no_extension"), "application/octet-stream");
        assert_eq!(FilePart::new("a.jpg", vec![]).content_type, "image/jpeg");
    }

    #[test]
    fn boundary_parameter_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/mixed; boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; Boundary=q").as_deref(),
            Some("q")
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }

    #[test]
    fn empty_body_decodes_to_no_parts() {
        let body = encode(MultipartKind::Mixed, "b", &[]);
        assert!(decode("multipart/mixed; boundary=b", &body).unwrap().is_empty());
    }

    #[test]
    fn truncated_body_is_rejected() {
        let body = encode(MultipartKind::Mixed, "b", &[FilePart::new("x", vec![1, 2])]);
        let cut = &body[..body.len() - 10];
        assert!(decode("multipart/mixed; boundary=b", cut).is_err());
        assert!(decode("multipart/mixed", &body).is_err());
    }
}
