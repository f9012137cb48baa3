// Slice-based STOMP frame parser (produces owned Vecs from input slices)

/// A frame as found on the wire, before command lookup and unescaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Option<Vec<u8>>,
}

/// One unit parsed from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// An empty line
    Heartbeat,
    Frame(RawFrame),
}

/// `Ok(Some((item, consumed)))` for a complete unit, `Ok(None)` when more
/// bytes are needed, `Err` on protocol errors.
type ParseResult = Result<Option<(Parsed, usize)>, String>;

/// Minimal helper: extract optional content-length header value from a header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid Content-Length header is present and parsed.
/// - Ok(None) when no Content-Length header is present.
/// - Err(String) when Content-Length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    for (k, v) in headers {
        if k.eq_ignore_ascii_case(&b"content-length"[..]) {
            let s =
                std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err("empty content-length".to_string());
            }
            match trimmed.parse::<usize>() {
                Ok(n) => return Ok(Some(n)),
                Err(e) => return Err(format!("invalid content-length '{}': {}", trimmed, e)),
            }
        }
    }
    Ok(None)
}

/// Find the next LF at or after `pos` and return the line without its
/// terminator (and without a trailing CR) plus the position after the LF.
fn next_line(input: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let end_rel = input[pos..].iter().position(|&b| b == b'\n')?;
    let mut line = &input[pos..pos + end_rel];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, pos + end_rel + 1))
}

/// Parse a single STOMP frame (or heartbeat) from the front of `input`.
///
/// Never looks past the end of the first frame: bytes after the NUL
/// terminator belong to the next call.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let (command_line, mut pos) = match next_line(input, 0) {
        Some(v) => v,
        None => return Ok(None),
    };
    if command_line.is_empty() {
        return Ok(Some((Parsed::Heartbeat, pos)));
    }
    let command = command_line.to_vec();

    // parse headers until an empty line (LF) is found
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        let (line, next) = match next_line(input, pos) {
            Some(v) => v,
            None => return Ok(None),
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => {
                return Err(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                ));
            }
        }
    }

    match get_content_length(&headers)? {
        Some(content_len) => {
            // need content_len bytes, plus terminating NUL
            let body_end = pos
                .checked_add(content_len)
                .filter(|end| *end < usize::MAX)
                .ok_or_else(|| format!("content-length {} out of range", content_len))?;
            if body_end + 1 > input.len() {
                return Ok(None);
            }
            let body = input[pos..body_end].to_vec();
            pos = body_end;
            if input[pos] != 0 {
                return Err(format!(
                    "body longer than content-length {}: missing NUL terminator",
                    content_len
                ));
            }
            pos += 1;
            let body = if body.is_empty() { None } else { Some(body) };
            Ok(Some((
                Parsed::Frame(RawFrame {
                    command,
                    headers,
                    body,
                }),
                pos,
            )))
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul_rel) => {
                let body = input[pos..pos + nul_rel].to_vec();
                pos += nul_rel + 1;
                let body = if body.is_empty() { None } else { Some(body) };
                Ok(Some((
                    Parsed::Frame(RawFrame {
                        command,
                        headers,
                        body,
                    }),
                    pos,
                )))
            }
            None => Ok(None),
        },
    }
}

/// Reverse STOMP 1.2 header escaping (`\\`, `\n`, `\r`, `\c`).
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(other) => return Err(format!("undefined escape sequence \\{}", *other as char)),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

/// Apply STOMP 1.2 header escaping.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_lines_are_accepted() {
        let raw = b"SEND\r\ndestination:/queue/a\r\n\r\nhi\0";
        let (parsed, consumed) = parse_frame_slice(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        match parsed {
            Parsed::Frame(f) => {
                assert_eq!(f.command, b"SEND");
                assert_eq!(f.headers[0].1, b"/queue/a");
                assert_eq!(f.body.as_deref(), Some(&b"hi"[..]));
            }
            Parsed::Heartbeat => panic!("expected frame"),
        }
    }

    #[test]
    fn stops_at_first_nul() {
        let raw = b"SEND\ndestination:/q/a\n\nx\0\n";
        let (_, consumed) = parse_frame_slice(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len() - 1);
    }

    #[test]
    fn unescape_rejects_unknown_sequence() {
        assert!(unescape_header_value(b"a\\tb").is_err());
        assert_eq!(unescape_header_value(b"a\\cb").unwrap(), b"a:b");
    }

    #[test]
    fn escape_is_reversible() {
        let s = "a:b\\c\nd\re";
        let escaped = escape_header_value(s);
        assert_eq!(unescape_header_value(escaped.as_bytes()).unwrap(), s.as_bytes());
    }
}
