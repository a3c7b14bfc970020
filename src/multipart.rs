//! Byte-preserving multipart body editing
//!
//! A body is split into raw delimiter/preamble segments and parts. Parts are
//! split into their header block and content. Reassembly concatenates the
//! segments in order, so a body that was not edited comes back byte for byte.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::model::{is_text_content_type, multipart_boundary};

#[derive(Debug, Clone)]
enum Segment {
    Raw(Vec<u8>),
    Part { head: Vec<u8>, body: Vec<u8> },
}

/// A parsed multipart body
#[derive(Debug, Clone)]
pub struct MultipartBody {
    segments: Vec<Segment>,
}

impl MultipartBody {
    /// Split `body` on `boundary`. Returns `None` if no delimiter is found.
    #[must_use]
    pub fn parse(body: &[u8], boundary: &str) -> Option<Self> {
        let delimiter = format!("--{boundary}").into_bytes();
        let positions = find_delimiters(body, &delimiter);
        let first = *positions.first()?;

        let mut segments = vec![Segment::Raw(body[..first].to_vec())];
        for (k, &pos) in positions.iter().enumerate() {
            let after = pos + delimiter.len();
            if body[after..].starts_with(b"--") {
                segments.push(Segment::Raw(body[pos..].to_vec()));
                return Some(Self { segments });
            }

            let line_end = body[pos..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(body.len(), |i| pos + i + 1);
            segments.push(Segment::Raw(body[pos..line_end].to_vec()));

            let next = positions.get(k + 1).copied().unwrap_or(body.len());
            let mut part_end = next;
            if k + 1 < positions.len() {
                if part_end >= line_end + 2 && &body[part_end - 2..part_end] == b"\r\n" {
                    part_end -= 2;
                } else if part_end > line_end && body[part_end - 1] == b'\n' {
                    part_end -= 1;
                }
            }
            let part_end = part_end.max(line_end);

            let (head, content) = split_head(&body[line_end..part_end]);
            segments.push(Segment::Part {
                head,
                body: content,
            });
            segments.push(Segment::Raw(body[part_end..next].to_vec()));
        }

        Some(Self { segments })
    }

    /// Reassemble the body
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Raw(raw) => bytes.extend_from_slice(raw),
                Segment::Part { head, body } => {
                    bytes.extend_from_slice(head);
                    bytes.extend_from_slice(body);
                }
            }
        }
        bytes
    }

    /// Number of parts
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Part { .. }))
            .count()
    }

    fn parts_mut(&mut self) -> impl Iterator<Item = (&mut Vec<u8>, &mut Vec<u8>)> {
        self.segments.iter_mut().filter_map(|segment| match segment {
            Segment::Part { head, body } => Some((head, body)),
            Segment::Raw(_) => None,
        })
    }
}

fn find_delimiters(body: &[u8], delimiter: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    if delimiter.is_empty() || body.len() < delimiter.len() {
        return positions;
    }

    let mut start = 0;
    while let Some(offset) = body[start..]
        .windows(delimiter.len())
        .position(|window| window == delimiter)
    {
        let pos = start + offset;
        if pos == 0 || body[pos - 1] == b'\n' {
            positions.push(pos);
        }
        start = pos + delimiter.len();
        if start >= body.len() {
            break;
        }
    }
    positions
}

fn split_head(content: &[u8]) -> (Vec<u8>, Vec<u8>) {
    for separator in [&b"\r\n\r\n"[..], &b"\n\n"[..]] {
        if let Some(index) = content
            .windows(separator.len())
            .position(|window| window == separator)
        {
            let split = index + separator.len();
            return (content[..split].to_vec(), content[split..].to_vec());
        }
    }
    (content.to_vec(), Vec::new())
}

/// Value of a header inside a part's header block
#[must_use]
pub fn part_header(head: &[u8], name: &str) -> Option<String> {
    String::from_utf8_lossy(head).lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// Apply `edit` to every textual part, descending into nested multiparts.
///
/// `edit` receives the part text and its content type and returns the new
/// text, or `None` to leave it. Returns the reassembled body only when some
/// part actually changed.
pub fn edit_text_parts(
    body: &[u8],
    boundary: &str,
    edit: &mut dyn FnMut(&str, Option<&str>) -> Option<String>,
) -> Option<Vec<u8>> {
    let mut multipart = MultipartBody::parse(body, boundary)?;
    let mut changed = false;

    for (head, content) in multipart.parts_mut() {
        let content_type = part_header(head, "Content-Type");

        if let Some(nested) = content_type.as_deref().and_then(multipart_boundary) {
            if let Some(updated) = edit_text_parts(content, &nested, edit) {
                *content = updated;
                changed = true;
            }
            continue;
        }

        if !content_type.as_deref().map_or(true, is_text_content_type) {
            continue;
        }
        let Ok(text) = std::str::from_utf8(content) else {
            continue;
        };
        if let Some(updated) = edit(text, content_type.as_deref()) {
            if updated != text {
                *content = updated.into_bytes();
                changed = true;
            }
        }
    }

    changed.then(|| multipart.to_bytes())
}

fn filename_regex() -> &'static Regex {
    static FILENAME: OnceLock<Regex> = OnceLock::new();
    FILENAME.get_or_init(|| {
        Regex::new(r#"(?i)(\bfilename\*?\s*=\s*)("[^"]*"|[^;\r\n]*)"#)
            .expect("filename pattern is valid")
    })
}

fn normalize_filename_value(value: &str) -> String {
    value
        .replace('/', "\\")
        .replace("%2F", "%5C")
        .replace("%2f", "%5C")
}

fn normalize_disposition_head(head: &str) -> String {
    let mut output = String::with_capacity(head.len());
    for line in head.split_inclusive('\n') {
        let is_disposition = line
            .split_once(':')
            .is_some_and(|(key, _)| key.trim().eq_ignore_ascii_case("Content-Disposition"));
        if is_disposition {
            let rewritten = filename_regex().replace_all(line, |caps: &Captures| {
                format!("{}{}", &caps[1], normalize_filename_value(&caps[2]))
            });
            output.push_str(&rewritten);
        } else {
            output.push_str(line);
        }
    }
    output
}

/// Rewrite forward slashes in `Content-Disposition` filenames to backslashes.
///
/// Covers the quoted, bare and percent-encoded `filename*` forms. Other
/// headers and part contents are left alone. Returns `None` when nothing
/// changed.
#[must_use]
pub fn normalize_filename_separators(body: &[u8], boundary: &str) -> Option<Vec<u8>> {
    let mut multipart = MultipartBody::parse(body, boundary)?;
    let mut changed = false;

    for (head, content) in multipart.parts_mut() {
        if let Ok(text) = std::str::from_utf8(head) {
            let normalized = normalize_disposition_head(text);
            if normalized != text {
                *head = normalized.into_bytes();
                changed = true;
            }
        }

        let nested = part_header(head, "Content-Type")
            .as_deref()
            .and_then(multipart_boundary);
        if let Some(nested) = nested {
            if let Some(updated) = normalize_filename_separators(content, &nested) {
                *content = updated;
                changed = true;
            }
        }
    }

    changed.then(|| multipart.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &[u8] = b"--boundary\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"dir/sub/file.txt\"\r\n\
Content-Type: text/plain; charset=utf-8; note=a/b\r\n\
\r\n\
hello/world\r\n\
--boundary\r\n\
Content-Disposition: form-data; name=\"other\"; filename*=UTF-8''dir%2Fname.bin\r\n\
Content-Type: application/octet-stream\r\n\
\r\n\
\x00\x01/\x02\r\n\
--boundary--\r\n";

    #[test]
    fn test_parse_and_reassemble_is_identity() {
        let multipart = MultipartBody::parse(FORM, "boundary").unwrap();
        assert_eq!(multipart.part_count(), 2);
        assert_eq!(multipart.to_bytes(), FORM);
    }

    #[test]
    fn test_normalize_only_touches_filenames() {
        let normalized = normalize_filename_separators(FORM, "boundary").unwrap();
        let text = String::from_utf8_lossy(&normalized);

        assert!(text.contains("filename=\"dir\\sub\\file.txt\""));
        assert!(text.contains("filename*=UTF-8''dir%5Cname.bin"));
        assert!(text.contains("note=a/b"));
        assert!(text.contains("hello/world"));
        assert_eq!(normalized.len(), FORM.len());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_filename_separators(FORM, "boundary").unwrap();
        assert!(normalize_filename_separators(&once, "boundary").is_none());
    }

    #[test]
    fn test_forward_and_back_slash_forms_converge() {
        let backslashed = normalize_filename_separators(FORM, "boundary").unwrap();
        let forward = FORM.to_vec();

        let from_forward = normalize_filename_separators(&forward, "boundary").unwrap();
        let from_back =
            normalize_filename_separators(&backslashed, "boundary").unwrap_or(backslashed);
        assert_eq!(from_forward, from_back);
    }

    #[test]
    fn test_edit_without_change_returns_none() {
        let result = edit_text_parts(FORM, "boundary", &mut |text, _| Some(text.to_string()));
        assert!(result.is_none());
    }

    #[test]
    fn test_edit_text_part_only() {
        let result = edit_text_parts(FORM, "boundary", &mut |text, _| {
            Some(text.replace("hello", "HELLO"))
        })
        .unwrap();

        let expected = String::from_utf8_lossy(FORM).replace("hello/world", "HELLO/world");
        assert_eq!(String::from_utf8_lossy(&result), expected);
    }

    #[test]
    fn test_no_delimiter_is_none() {
        assert!(MultipartBody::parse(b"plain body", "boundary").is_none());
    }

    #[test]
    fn test_part_header_lookup() {
        let head = b"Content-Type: application/json\r\nX-Other: 1\r\n\r\n";
        assert_eq!(
            part_header(head, "content-type"),
            Some("application/json".to_string())
        );
        assert_eq!(part_header(head, "missing"), None);
    }
}
