//! JSON wire format of the HTTP long-poll backend.

use serde::Deserialize;
use serde_json::Value;

use crate::transport::{LongPollResponse, RawEvent, TransportError};
use crate::types::{Cursor, Timetoken};

/// `{"t": "<timetoken>", "r": <region>}`; timetokens travel as strings.
#[derive(Debug, Deserialize)]
struct WireTimetoken {
    t: String,
    #[serde(default)]
    r: u32,
}

impl WireTimetoken {
    fn timetoken(&self) -> Result<Timetoken, TransportError> {
        self.t
            .parse()
            .map_err(|e| TransportError::Decode(format!("bad timetoken {:?}: {e}", self.t)))
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    /// Channel
    c: String,
    /// Matched subscription (group or wildcard)
    #[serde(default)]
    b: Option<String>,
    /// Publish timetoken
    p: WireTimetoken,
    /// Publisher id
    #[serde(default)]
    i: Option<String>,
    /// Message type
    #[serde(default)]
    e: Option<i32>,
    /// Payload
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    t: WireTimetoken,
    #[serde(default)]
    m: Vec<WireMessage>,
}

/// Error document returned with 4xx/5xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

pub(crate) fn decode_subscribe(body: &str) -> Result<LongPollResponse, TransportError> {
    let body: SubscribeBody =
        serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;
    let cursor = Cursor::new(body.t.timetoken()?, body.t.r);
    let events = body
        .m
        .into_iter()
        .map(|m| {
            Ok(RawEvent {
                timetoken: m.p.timetoken()?,
                channel: m.c,
                subscription: m.b,
                message_type: m.e,
                publisher: m.i,
                payload: m.d,
            })
        })
        .collect::<Result<Vec<_>, TransportError>>()?;
    Ok(LongPollResponse { cursor, events })
}

/// Publish acknowledgement: `[1, "Sent", "<timetoken>"]`.
pub(crate) fn decode_publish(body: &str) -> Result<Timetoken, TransportError> {
    let (code, text, timetoken): (i64, String, String) =
        serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;
    if code != 1 {
        return Err(TransportError::Rejected {
            status: 200,
            message: text,
        });
    }
    timetoken
        .parse()
        .map_err(|e| TransportError::Decode(format!("bad timetoken {timetoken:?}: {e}")))
}

/// Map a non-success HTTP status and its body to a [`TransportError`].
pub(crate) fn classify_status(status: u16, body: &str) -> TransportError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(m), ..
        }) => m,
        Ok(ErrorBody { error: Some(e), .. }) => match e {
            Value::String(s) => s,
            other => other.to_string(),
        },
        _ => body.trim().to_string(),
    };
    match status {
        400 if message.to_ascii_lowercase().contains("timetoken") => {
            TransportError::CursorInvalidated(message)
        }
        400..=499 => TransportError::Rejected { status, message },
        _ => TransportError::Server { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_subscribe_response() {
        let body = r#"{
            "t": {"t": "17000000000000005", "r": 12},
            "m": [
                {"a": "1", "f": 0, "i": "pub-1", "p": {"t": "17000000000000004", "r": 12},
                 "k": "sub-key", "c": "ch1", "d": {"text": "hi"}},
                {"p": {"t": "17000000000000005", "r": 12}, "c": "ch1-pnpres", "b": "grp-pnpres",
                 "d": {"action": "join", "uuid": "u", "occupancy": 1}},
                {"p": {"t": "17000000000000005", "r": 12}, "c": "ch2", "e": 1, "d": "typing"}
            ]
        }"#;
        let resp = decode_subscribe(body).unwrap();
        assert_eq!(resp.cursor, Cursor::new(Timetoken(17_000_000_000_000_005), 12));
        assert_eq!(resp.events.len(), 3);

        let first = &resp.events[0];
        assert_eq!(first.channel, "ch1");
        assert_eq!(first.publisher.as_deref(), Some("pub-1"));
        assert_eq!(first.timetoken, Timetoken(17_000_000_000_000_004));
        assert_eq!(first.payload["text"], "hi");
        assert_eq!(resp.events[1].subscription.as_deref(), Some("grp-pnpres"));
        assert_eq!(resp.events[2].message_type, Some(1));
    }

    #[test]
    fn handshake_response_has_no_messages() {
        let resp = decode_subscribe(r#"{"t":{"t":"17000000000000000","r":1}}"#).unwrap();
        assert!(resp.events.is_empty());
        assert_eq!(resp.cursor.region, 1);
    }

    #[test]
    fn rejects_malformed_timetoken() {
        let err = decode_subscribe(r#"{"t":{"t":"soon","r":1},"m":[]}"#).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
        assert!(matches!(
            decode_subscribe("<html>").unwrap_err(),
            TransportError::Decode(_)
        ));
    }

    #[test]
    fn decodes_publish_ack() {
        assert_eq!(
            decode_publish(r#"[1,"Sent","17000000000000001"]"#).unwrap(),
            Timetoken(17_000_000_000_000_001)
        );
        assert!(matches!(
            decode_publish(r#"[0,"Message Too Large","0"]"#),
            Err(TransportError::Rejected { status: 200, .. })
        ));
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_status(400, r#"{"message":"Invalid Timetoken","error":true}"#),
            TransportError::CursorInvalidated(m) if m == "Invalid Timetoken"
        ));
        assert_eq!(
            classify_status(403, r#"{"message":"Forbidden","status":403}"#),
            TransportError::Rejected {
                status: 403,
                message: "Forbidden".into()
            }
        );
        assert_eq!(
            classify_status(400, r#"{"error":"Invalid Subscribe Key"}"#),
            TransportError::Rejected {
                status: 400,
                message: "Invalid Subscribe Key".into()
            }
        );
        assert_eq!(
            classify_status(502, "Bad Gateway\n"),
            TransportError::Server {
                status: 502,
                message: "Bad Gateway".into()
            }
        );
    }
}
