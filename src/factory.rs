use crate::broker::{BrokerError, BrokerMessage, Destination, MessageBody};
use crate::command::{Command, header};
use crate::frame::{Frame, FrameError};

const HYPHEN: &str = "_HYPHEN_";
const DOT: &str = "_DOT_";

/// Headers that map onto message structure rather than properties.
const STRUCTURAL: [&str; 13] = [
    header::CONTENT_LENGTH,
    header::CORRELATION_ID,
    header::DESTINATION,
    header::EXPIRATION,
    header::MESSAGE_ID,
    header::PRIORITY,
    header::RECEIPT,
    header::REDELIVERED,
    header::REPLY_TO,
    header::SUBSCRIPTION,
    header::TIMESTAMP,
    header::TRANSACTION,
    header::TYPE,
];

/// Encode a STOMP header name as a broker property name.
///
/// Broker property names must be identifiers, so `-` and `.` are replaced by
/// `_HYPHEN_` and `_DOT_`.
pub fn to_property_name(header_name: &str) -> String {
    header_name.replace('-', HYPHEN).replace('.', DOT)
}

/// Reverse of [`to_property_name`].
pub fn to_header_name(property_name: &str) -> String {
    property_name.replace(HYPHEN, "-").replace(DOT, ".")
}

/// Translates between frames and broker messages, and creates the frames
/// the server originates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Factory;

impl Factory {
    pub fn destination(&self, path: &str) -> Result<Destination, BrokerError> {
        Destination::parse(path)
    }

    /// Build the broker message for a SEND frame.
    ///
    /// The body is binary when the frame declares `content-length` and text
    /// otherwise; a body that is not UTF-8 stays binary so nothing is lost.
    pub fn to_message(&self, frame: &Frame) -> Result<(Destination, BrokerMessage), BrokerError> {
        let path = frame
            .destination()
            .ok_or_else(|| BrokerError::InvalidDestination(String::new()))?;
        let destination = self.destination(path)?;

        let bytes = frame.body().cloned().unwrap_or_default();
        let mut message = if frame.headers().contains(header::CONTENT_LENGTH) {
            BrokerMessage::binary(bytes)
        } else {
            match String::from_utf8(bytes.to_vec()) {
                Ok(text) => BrokerMessage::text(text),
                Err(_) => BrokerMessage::binary(bytes),
            }
        };

        for (name, value) in frame.headers().wire_iter() {
            if STRUCTURAL.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                continue;
            }
            message.set_property(to_property_name(name), value);
        }

        message.correlation_id = frame.header(header::CORRELATION_ID).map(str::to_string);
        message.message_type = frame.header(header::TYPE).map(str::to_string);
        message.reply_to = frame
            .header(header::REPLY_TO)
            .map(|r| self.destination(r))
            .transpose()?;
        message.expiration = frame
            .header(header::EXPIRATION)
            .and_then(|v| v.trim().parse().ok())
            .filter(|v| *v != 0);
        message.priority = frame
            .header(header::PRIORITY)
            .and_then(|v| v.trim().parse().ok());

        Ok((destination, message))
    }

    /// Build the MESSAGE frame delivering `message` to `subscription_id`.
    pub fn to_frame(&self, message: &BrokerMessage, subscription_id: &str) -> Result<Frame, FrameError> {
        let mut builder = Frame::builder(Command::Message)
            .header(header::SUBSCRIPTION, subscription_id)
            .header_opt(
                header::DESTINATION,
                message.destination.as_ref().map(|d| d.to_string()),
            )
            .header_opt(header::MESSAGE_ID, message.id.as_deref())
            .header_opt(header::CORRELATION_ID, message.correlation_id.as_deref())
            .header_opt(header::EXPIRATION, message.expiration.map(|v| v.to_string()))
            .header_opt(header::REDELIVERED, message.redelivered.then_some("true"))
            .header_opt(header::PRIORITY, message.priority.map(|v| v.to_string()))
            .header_opt(
                header::REPLY_TO,
                message.reply_to.as_ref().map(|d| d.to_string()),
            )
            .header_opt(header::TIMESTAMP, message.timestamp.map(|v| v.to_string()))
            .header_opt(header::TYPE, message.message_type.as_deref());

        for (name, value) in &message.properties {
            builder = builder.header(to_header_name(name), value.as_str());
        }

        builder = match &message.body {
            MessageBody::Text(text) => builder.body(text.clone()),
            MessageBody::Binary(bytes) => builder.binary_body(bytes.clone()),
        };
        builder.build()
    }

    /// CONNECTED reply. `heart_beat` is `(send_ms, read_ms)` from the
    /// server's point of view.
    pub fn connected(
        &self,
        version: &str,
        session_id: &str,
        server: &str,
        heart_beat: Option<(u64, u64)>,
    ) -> Result<Frame, FrameError> {
        Frame::builder(Command::Connected)
            .header(header::VERSION, version)
            .header(header::SESSION, session_id)
            .header(header::SERVER, server)
            .header_opt(
                header::HEART_BEAT,
                heart_beat.map(|(send, read)| format!("{},{}", send, read)),
            )
            .build()
    }

    pub fn receipt(&self, receipt_id: &str) -> Result<Frame, FrameError> {
        Frame::builder(Command::Receipt)
            .header(header::RECEIPT_ID, receipt_id)
            .build()
    }

    /// ERROR frame with a short `message` header and a plain-text body.
    pub fn error(
        &self,
        message: &str,
        receipt_id: Option<&str>,
        detail: &str,
    ) -> Result<Frame, FrameError> {
        let short = message.lines().next().unwrap_or_default();
        Frame::builder(Command::Error)
            .header(header::MESSAGE, short)
            .header_opt(header::RECEIPT_ID, receipt_id)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(detail.to_string())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn property_names_round_trip() {
        assert_eq!(to_property_name("x-app.key"), "x_HYPHEN_app_DOT_key");
        assert_eq!(to_header_name("x_HYPHEN_app_DOT_key"), "x-app.key");
    }

    #[test]
    fn send_frame_maps_to_text_message() {
        let frame = Frame::builder(Command::Send)
            .destination("/queue/foo")
            .header("correlation-id", "c1")
            .header("reply-to", "/topic/replies")
            .header("x-app", "7")
            .header("receipt", "r1")
            .body("hello")
            .build()
            .unwrap();
        let (dest, msg) = Factory.to_message(&frame).unwrap();
        assert_eq!(dest, Destination::Queue("foo".into()));
        assert_eq!(msg.body, MessageBody::Text("hello".into()));
        assert_eq!(msg.correlation_id.as_deref(), Some("c1"));
        assert_eq!(msg.reply_to, Some(Destination::Topic("replies".into())));
        assert_eq!(msg.property("x_HYPHEN_app"), Some("7"));
        assert_eq!(msg.property("receipt"), None);
        assert_eq!(msg.property("destination"), None);
    }

    #[test]
    fn content_length_selects_binary() {
        let frame = Frame::builder(Command::Send)
            .destination("/queue/foo")
            .binary_body(Bytes::from_static(b"abc"))
            .build()
            .unwrap();
        let (_, msg) = Factory.to_message(&frame).unwrap();
        assert_eq!(msg.body, MessageBody::Binary(Bytes::from_static(b"abc")));
        assert_eq!(msg.property("content_HYPHEN_length"), None);
    }

    #[test]
    fn message_frame_carries_only_present_fields() {
        let mut msg = BrokerMessage::text("hello");
        msg.id = Some("ID:1".into());
        msg.destination = Some(Destination::Queue("foo".into()));
        let frame = Factory.to_frame(&msg, "sub-0").unwrap();
        let names: Vec<_> = frame.headers().iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["subscription", "destination", "message-id"]);
        assert_eq!(frame.body().map(|b| &b[..]), Some(&b"hello"[..]));
    }

    #[test]
    fn binary_message_frame_sets_content_length() {
        let mut msg = BrokerMessage::binary(Bytes::from_static(&[0, 1, 2]));
        msg.id = Some("ID:2".into());
        msg.destination = Some(Destination::Topic("t".into()));
        msg.redelivered = true;
        msg.set_property("x_HYPHEN_a", "1");
        let frame = Factory.to_frame(&msg, "s").unwrap();
        assert_eq!(frame.content_length(), Some(3));
        assert_eq!(frame.header("redelivered"), Some("true"));
        assert_eq!(frame.header("x-a"), Some("1"));
    }

    #[test]
    fn invalid_destination_is_rejected() {
        let frame = Frame::builder(Command::Send)
            .destination("/temp-queue/x")
            .build()
            .unwrap();
        assert!(matches!(
            Factory.to_message(&frame),
            Err(BrokerError::TemporaryDestination(_))
        ));
    }
}
