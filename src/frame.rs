use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::command::{Command, header};

/// Errors raised while building a [`Frame`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A header the command requires is absent
    #[error("{command} frame requires a '{header}' header")]
    MissingHeader {
        command: Command,
        header: &'static str,
    },
    /// The command does not carry a body
    #[error("{0} frame cannot carry a body")]
    BodyNotAllowed(Command),
    /// `content-length` disagrees with the body or is not a number
    #[error("invalid content-length '{value}' for a body of {actual} bytes")]
    InvalidContentLength { value: String, actual: usize },
    /// A CONNECT/CONNECTED header that cannot be written unescaped
    #[error("{command} header '{header}' contains a line break or a ':' in its name")]
    UnencodableHeader { command: Command, header: String },
}

/// Ordered, case-insensitive, multi-valued STOMP headers.
///
/// A header name appears once; repeated values for that name are kept in
/// insertion order and comma-joined on the wire.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Append a value, keeping the position of an existing name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.entries[i].1 = vec![value.into()],
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// First value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
    }

    /// Every value for `name`, with comma-joined values split apart.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        match self.position(name) {
            Some(i) => self.entries[i]
                .1
                .iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Iterate `(name, values)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Iterate `(name, wire value)` in insertion order.
    pub fn wire_iter(&self) -> impl Iterator<Item = (&str, String)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.join(",")))
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, va), (kb, vb))| {
                    ka.eq_ignore_ascii_case(kb) && va.join(",") == vb.join(",")
                })
    }
}

impl Eq for Headers {}

/// An immutable STOMP frame.
///
/// A frame without a command is a heartbeat: it has no headers and no body
/// and travels as a bare LF. Every other frame is created through
/// [`FrameBuilder`], which checks the command's mandatory headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Option<Command>,
    headers: Headers,
    body: Option<Bytes>,
}

impl Frame {
    /// The heartbeat frame.
    pub fn heartbeat() -> Self {
        Self {
            command: None,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Start building a frame for `command`.
    pub fn builder(command: Command) -> FrameBuilder {
        FrameBuilder::new(command)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command.is_none()
    }

    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.header(header::DESTINATION)
    }

    pub fn receipt(&self) -> Option<&str> {
        self.header(header::RECEIPT)
    }

    pub fn session(&self) -> Option<&str> {
        self.header(header::SESSION)
    }

    pub fn id(&self) -> Option<&str> {
        self.header(header::ID)
    }

    pub fn transaction(&self) -> Option<&str> {
        self.header(header::TRANSACTION)
    }

    pub fn subscription(&self) -> Option<&str> {
        self.header(header::SUBSCRIPTION)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// A builder seeded with this frame's contents.
    ///
    /// Returns `None` for the heartbeat frame, which has nothing to build.
    pub fn to_builder(&self) -> Option<FrameBuilder> {
        self.command.map(|command| FrameBuilder {
            command,
            headers: self.headers.clone(),
            body: self.body.clone(),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            Some(c) => writeln!(f, "Command: {}", c)?,
            None => return writeln!(f, "Heartbeat"),
        }
        for (k, v) in self.headers.wire_iter() {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(
            f,
            "Body ({} bytes)",
            self.body.as_ref().map(|b| b.len()).unwrap_or(0)
        )
    }
}

/// Mutable builder producing validated [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    command: Command,
    headers: Headers,
    body: Option<Bytes>,
}

impl FrameBuilder {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Add a header value (builder style). Repeating a name appends a value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Add a header only when `value` is present.
    pub fn header_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.header(name, v),
            None => self,
        }
    }

    /// Replace any existing values of `name`.
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn destination(self, destination: impl Into<String>) -> Self {
        self.set_header(header::DESTINATION, destination)
    }

    pub fn receipt(self, receipt: impl Into<String>) -> Self {
        self.set_header(header::RECEIPT, receipt)
    }

    pub fn session(self, session: impl Into<String>) -> Self {
        self.set_header(header::SESSION, session)
    }

    /// Set the body. An empty body is the same as no body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    /// Set a binary body and the matching `content-length` header.
    pub fn binary_body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let len = body.len();
        self.set_header(header::CONTENT_LENGTH, len.to_string())
            .body(body)
    }

    /// Validate and produce the frame.
    ///
    /// Bodies that cannot be NUL-framed (they contain NUL or are not UTF-8)
    /// get a derived `content-length` header when none was given.
    pub fn build(mut self) -> Result<Frame, FrameError> {
        for name in self.command.mandatory_headers() {
            if !self.headers.contains(name) {
                return Err(FrameError::MissingHeader {
                    command: self.command,
                    header: name,
                });
            }
        }

        // CONNECT and CONNECTED go out unescaped.
        if !self.command.escapes_headers() {
            let breaks = |s: &str| s.contains(['\r', '\n']);
            for (name, values) in self.headers.iter() {
                if breaks(name) || name.contains(':') || values.iter().any(|v| breaks(v)) {
                    return Err(FrameError::UnencodableHeader {
                        command: self.command,
                        header: name.to_string(),
                    });
                }
            }
        }

        if let Some(body) = &self.body {
            if !self.command.has_body() {
                return Err(FrameError::BodyNotAllowed(self.command));
            }
            let needs_length = body.contains(&0) || std::str::from_utf8(body).is_err();
            if needs_length && !self.headers.contains(header::CONTENT_LENGTH) {
                self.headers
                    .set(header::CONTENT_LENGTH, body.len().to_string());
            }
        }

        if let Some(value) = self.headers.get(header::CONTENT_LENGTH) {
            let actual = self.body.as_ref().map(|b| b.len()).unwrap_or(0);
            if value.trim().parse::<usize>().ok() != Some(actual) {
                return Err(FrameError::InvalidContentLength {
                    value: value.to_string(),
                    actual,
                });
            }
        }

        Ok(Frame {
            command: Some(self.command),
            headers: self.headers,
            body: self.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let mut h = Headers::new();
        h.add("Destination", "/queue/a");
        h.add("x-b", "1");
        h.add("x-b", "2");
        assert_eq!(h.get("destination"), Some("/queue/a"));
        assert_eq!(h.get_all("X-B"), vec!["1", "2"]);
        let names: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Destination", "x-b"]);
        assert_eq!(h.wire_iter().nth(1).unwrap().1, "1,2");
    }

    #[test]
    fn headers_equal_on_wire_form() {
        let mut a = Headers::new();
        a.add("accept-version", "1.1");
        a.add("accept-version", "1.2");
        let mut b = Headers::new();
        b.add("Accept-Version", "1.1,1.2");
        assert_eq!(a, b);
    }

    #[test]
    fn build_derives_content_length_for_binary_body() {
        let f = Frame::builder(Command::Send)
            .destination("/queue/a")
            .body(vec![1u8, 0, 2])
            .build()
            .unwrap();
        assert_eq!(f.content_length(), Some(3));
    }

    #[test]
    fn build_rejects_body_on_bodiless_command() {
        let err = Frame::builder(Command::Subscribe)
            .destination("/queue/a")
            .header("id", "0")
            .body("x")
            .build()
            .unwrap_err();
        assert_eq!(err, FrameError::BodyNotAllowed(Command::Subscribe));
    }

    #[test]
    fn build_rejects_line_breaks_in_unescaped_headers() {
        for value in ["relay\nx:y", "relay\r"] {
            let err = Frame::builder(Command::Connected)
                .header("version", "1.2")
                .header("server", value)
                .build()
                .unwrap_err();
            assert_eq!(
                err,
                FrameError::UnencodableHeader {
                    command: Command::Connected,
                    header: "server".into(),
                }
            );
        }
        let err = Frame::builder(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", "localhost")
            .header("x:y", "1")
            .build()
            .unwrap_err();
        assert!(matches!(err, FrameError::UnencodableHeader { .. }));

        // Escaped commands carry the same values safely.
        assert!(
            Frame::builder(Command::Send)
                .destination("/queue/a")
                .header("note", "a\nb:c")
                .build()
                .is_ok()
        );
    }

    #[test]
    fn build_rejects_wrong_content_length() {
        let err = Frame::builder(Command::Send)
            .destination("/queue/a")
            .header("content-length", "9")
            .body("abc")
            .build()
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidContentLength { .. }));
    }
}
