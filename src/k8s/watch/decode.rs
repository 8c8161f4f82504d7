/**
 * Wire decoding for list responses and newline delimited watch streams
 */
use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use k8s_openapi::serde_json::{self, Value};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// HTTP status the server embeds in an ERROR record when the cursor is gone
const GONE: i64 = 410;

/// Kind of change observed for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl ChangeKind {
    /// Parse the `type` field of a watch record
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            "BOOKMARK" => Some(Self::Bookmark),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One page of a list response
#[derive(Debug, Deserialize)]
#[serde(bound = "K: DeserializeOwned")]
pub struct ResourceList<K> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<K>,
}

impl<K> ResourceList<K> {
    /// Continue token, if the server has more pages
    #[must_use]
    pub fn continue_token(&self) -> Option<&str> {
        self.metadata.continue_.as_deref().filter(|t| !t.is_empty())
    }
}

/// Raw `{type, object}` envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    object: Value,
}

/// A decoded watch record
#[derive(Debug)]
pub enum WatchRecord<K> {
    Change(ChangeKind, K),
    /// ERROR record reporting 410 Gone
    Gone,
    /// ERROR record whose object is not a `K`, with the server supplied message
    Failure(String),
}

/// Result of decoding one line. A readable envelope counts as stream
/// activity even when its object is rejected.
pub struct DecodedLine<K> {
    /// `true` when the `{type, object}` envelope parsed
    pub envelope_ok: bool,
    pub record: Result<WatchRecord<K>>,
}

/// Decode one non-empty line of a watch stream
#[must_use]
pub fn decode_line<K: DeserializeOwned>(line: &str) -> DecodedLine<K> {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            return DecodedLine {
                envelope_ok: false,
                record: Err(e.into()),
            };
        }
    };

    let record = match ChangeKind::from_wire(&envelope.type_) {
        Some(ChangeKind::Error) => Ok(decode_error(envelope.object)),
        Some(change) => serde_json::from_value::<K>(envelope.object)
            .map(|object| WatchRecord::Change(change, object))
            .map_err(Error::from),
        None => Err(Error::Custom(format!("unknown watch event type {}", envelope.type_))),
    };

    DecodedLine {
        envelope_ok: true,
        record,
    }
}

/// ERROR records other than 410 are regular changes when the object reads as `K`
fn decode_error<K: DeserializeOwned>(object: Value) -> WatchRecord<K> {
    if object.get("code").and_then(Value::as_i64) == Some(GONE) {
        return WatchRecord::Gone;
    }
    if let Ok(decoded) = serde_json::from_value::<K>(object.clone()) {
        return WatchRecord::Change(ChangeKind::Error, decoded);
    }
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| object.to_string(), ToString::to_string);
    WatchRecord::Failure(message)
}

/// Reassembles lines from arbitrarily split chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed. The trailing
    /// fragment is kept for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(to_line)
            .collect()
    }

    /// Flush whatever is left once the stream ended
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        to_line(&rest)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn to_line(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::DynamicObject;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(br#"{"type":"ADD"#).is_empty());
        let lines = buffer.push(b"ED\"}\n{\"type\":");
        assert_eq!(lines, vec![r#"{"type":"ADDED"}"#.to_string()]);
        let lines = buffer.push(b"\"DELETED\"}\r\n\n");
        assert_eq!(lines, vec![r#"{"type":"DELETED"}"#.to_string()]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"tail").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn test_decode_change() {
        let line = r#"{"type":"MODIFIED","object":{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a","uid":"u1","resourceVersion":"7"}}}"#;
        let decoded = decode_line::<ConfigMap>(line);
        assert!(decoded.envelope_ok);
        match decoded.record.unwrap() {
            WatchRecord::Change(ChangeKind::Modified, cm) => {
                assert_eq!(cm.metadata.uid.as_deref(), Some("u1"));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_decode_gone() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":410,"message":"too old"}}"#;
        assert!(matches!(
            decode_line::<ConfigMap>(line).record,
            Ok(WatchRecord::Gone)
        ));
    }

    #[test]
    fn test_decode_error_of_another_kind() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":500,"message":"boom"}}"#;
        match decode_line::<ConfigMap>(line).record {
            Ok(WatchRecord::Failure(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_as_change() {
        let line = r#"{"type":"ERROR","object":{"apiVersion":"v1","kind":"Status","code":500,"message":"boom"}}"#;
        match decode_line::<DynamicObject>(line).record {
            Ok(WatchRecord::Change(ChangeKind::Error, status)) => {
                assert_eq!(status.data["code"], 500);
                assert_eq!(status.data["message"], "boom");
            }
            other => panic!("unexpected record {other:?}"),
        }

        let line = r#"{"type":"ERROR","object":{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a","uid":"u1"}}}"#;
        assert!(matches!(
            decode_line::<ConfigMap>(line).record,
            Ok(WatchRecord::Change(ChangeKind::Error, _))
        ));
    }

    #[test]
    fn test_decode_malformed() {
        let decoded = decode_line::<ConfigMap>("{not json");
        assert!(!decoded.envelope_ok);
        assert!(decoded.record.is_err());

        let decoded = decode_line::<ConfigMap>(r#"{"type":"SHRUGGED","object":{}}"#);
        assert!(decoded.envelope_ok);
        assert!(decoded.record.is_err());
    }

    #[test]
    fn test_list_continue_token() {
        let list: ResourceList<ConfigMap> = serde_json::from_str(
            r#"{"metadata":{"resourceVersion":"12","continue":"abc"},"items":[]}"#,
        )
        .unwrap();
        assert_eq!(list.metadata.resource_version.as_deref(), Some("12"));
        assert_eq!(list.continue_token(), Some("abc"));

        let list: ResourceList<ConfigMap> =
            serde_json::from_str(r#"{"metadata":{"continue":""}}"#).unwrap();
        assert_eq!(list.continue_token(), None);
        assert!(list.items.is_empty());
    }
}
