//! Line-framed JSON protocol between hub and clients
//!
//! Every frame is one JSON object followed by a single `\n`. JSON string
//! escaping guarantees no raw newline appears inside a frame, and byte
//! payloads travel as base64.
//!
//! ```text
//! {"id":"6f1c…","from":"laptop","op":"upload-request","path":"notes/a.md","offset":0,"size":5,"totalSize":5,"data":"aGVsbG8="}
//! {"id":"6f1c…","from":"hub","op":"upload-ack","path":"notes/a.md"}
//! ```
//!
//! Operations:
//! - `diff-request`: `payload` maps path → `{contentHash, modifiedAt}`
//! - `diff-ack`: `payload` is `{download: [...], upload: [...]}`
//! - `upload-request`: `path`, `offset`, `size`, `totalSize`, `data`
//! - `upload-ack`: `path`
//! - `download-request`: `path`, `offset`, `size`
//! - `download-ack`: `path`, `offset`, `size`, `totalSize`, `data`
//! - `notify`: `path` (hub → client, unsolicited)
//!
//! A reply carries the request's `id`. A failed request is answered with the
//! matching ack (or the request's own op when it cannot be served) and an
//! `error` string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::reconcile::DiffPayload;
use crate::snapshot::WireSnapshot;

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    DiffRequest,
    DiffAck,
    UploadRequest,
    UploadAck,
    DownloadRequest,
    DownloadAck,
    Notify,
}

impl Op {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiffRequest => "diff-request",
            Self::DiffAck => "diff-ack",
            Self::UploadRequest => "upload-request",
            Self::UploadAck => "upload-ack",
            Self::DownloadRequest => "download-request",
            Self::DownloadAck => "download-ack",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation-specific part of a message, tagged by `op`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Body {
    DiffRequest {
        #[serde(default)]
        payload: WireSnapshot,
    },
    DiffAck {
        /// Absent on an error reply
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<DiffPayload>,
    },
    UploadRequest {
        path: String,
        #[serde(default)]
        offset: u64,
        #[serde(default)]
        size: u64,
        #[serde(default, rename = "totalSize")]
        total_size: u64,
        #[serde(default, with = "base64_bytes")]
        data: Vec<u8>,
    },
    UploadAck {
        #[serde(default)]
        path: String,
    },
    DownloadRequest {
        path: String,
        #[serde(default)]
        offset: u64,
        size: u64,
    },
    /// Everything but `path` is absent on an error reply
    DownloadAck {
        #[serde(default)]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, rename = "totalSize", skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
    },
    Notify {
        path: String,
    },
}

impl Body {
    #[must_use]
    pub fn op(&self) -> Op {
        match self {
            Self::DiffRequest { .. } => Op::DiffRequest,
            Self::DiffAck { .. } => Op::DiffAck,
            Self::UploadRequest { .. } => Op::UploadRequest,
            Self::UploadAck { .. } => Op::UploadAck,
            Self::DownloadRequest { .. } => Op::DownloadRequest,
            Self::DownloadAck { .. } => Op::DownloadAck,
            Self::Notify { .. } => Op::Notify,
        }
    }

    /// Path the operation concerns, if any
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::UploadRequest { path, .. }
            | Self::UploadAck { path }
            | Self::DownloadRequest { path, .. }
            | Self::DownloadAck { path, .. }
            | Self::Notify { path } => Some(path),
            Self::DiffRequest { .. } | Self::DiffAck { .. } => None,
        }
    }

    /// A body to carry an error back for this request
    ///
    /// Requests map to their ack; anything else echoes its own op. Only
    /// the path survives, every payload field is left out.
    #[must_use]
    pub fn error_body(&self) -> Self {
        let path = self.path().unwrap_or_default().to_string();
        match self {
            Self::DiffRequest { .. } | Self::DiffAck { .. } => Self::DiffAck { payload: None },
            Self::UploadRequest { .. } | Self::UploadAck { .. } => Self::UploadAck { path },
            Self::DownloadRequest { .. } | Self::DownloadAck { .. } => Self::DownloadAck {
                path,
                offset: None,
                size: None,
                total_size: None,
                data: None,
            },
            Self::Notify { .. } => Self::Notify { path },
        }
    }
}

/// The envelope for every exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation token, echoed by the reply
    pub id: String,
    /// Sender identity
    #[serde(default)]
    pub from: String,
    #[serde(flatten)]
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// A new request with a fresh correlation id
    #[must_use]
    pub fn request(from: impl Into<String>, body: Body) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            body,
            error: None,
        }
    }

    /// A reply to `self` carrying `body`
    #[must_use]
    pub fn reply(&self, from: impl Into<String>, body: Body) -> Self {
        Self {
            id: self.id.clone(),
            from: from.into(),
            body,
            error: None,
        }
    }

    /// An error reply to `self`
    #[must_use]
    pub fn error_reply(&self, from: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            id: self.id.clone(),
            from: from.into(),
            body: self.body.error_body(),
            error: Some(error.to_string()),
        }
    }

    #[must_use]
    pub fn op(&self) -> Op {
        self.body.op()
    }

    /// Turn an error envelope into `SyncError::Remote`
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(message) => Err(SyncError::Remote {
                op: self.body.op().to_string(),
                message,
            }),
            None => Ok(self),
        }
    }

    /// Encode as one newline-terminated frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)
            .map_err(|e| SyncError::Protocol(format!("encode {}: {e}", self.op())))?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Decode one frame, with or without its trailing newline
    pub fn decode(line: &[u8]) -> Result<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        serde_json::from_slice(line).map_err(|e| SyncError::Protocol(format!("decode: {e}")))
    }
}

/// Serde adapter carrying bytes as a base64 string
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// [`base64_bytes`] for a field that may be absent
mod base64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => super::base64_bytes::serialize(data, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super::base64_bytes")] Vec<u8>);

        let wrapped = Option::<Wrapped>::deserialize(deserializer)?;
        Ok(wrapped.map(|Wrapped(data)| data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::scan::FileRecord;
    use crate::snapshot::Snapshot;
    use chrono::Utc;

    #[test]
    fn test_frame_is_single_line() {
        let msg = Message::request(
            "laptop",
            Body::UploadRequest {
                path: "notes/a\nb.md".to_string(),
                offset: 0,
                size: 7,
                total_size: 7,
                data: b"line1\nx".to_vec(),
            },
        );

        let frame = msg.encode().unwrap();

        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message {
            id: "1".to_string(),
            from: "hub".to_string(),
            body: Body::DownloadAck {
                path: "a.md".to_string(),
                offset: Some(0),
                size: Some(5),
                total_size: Some(5),
                data: Some(b"hello".to_vec()),
            },
            error: None,
        };

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["op"], "download-ack");
        assert_eq!(value["totalSize"], 5);
        assert_eq!(value["data"], "aGVsbG8=");
        assert!(value.get("error").is_none());
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_notify_carries_only_path_and_sender() {
        let msg = Message::request(
            "phone",
            Body::Notify {
                path: "a.md".to_string(),
            },
        );
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["from", "id", "op", "path"]);
    }

    #[test]
    fn test_diff_request_carries_snapshot() {
        let snapshot = Snapshot::from_records(vec![FileRecord {
            path: "notes/a.md".to_string(),
            hash: ContentHash::from_bytes(b"hello"),
            modified: Utc::now(),
            size: 5,
        }]);
        let msg = Message::request(
            "laptop",
            Body::DiffRequest {
                payload: snapshot.to_wire(),
            },
        );

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let Body::DiffRequest { payload } = decoded.body else {
            panic!("wrong op");
        };
        let (back, rejected) = Snapshot::from_wire(&payload);
        assert!(rejected.is_empty());
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_decode_handwritten_frame() {
        let line = br#"{"id":"abc","from":"c1","op":"download-request","path":"x.txt","offset":10,"size":4}"#;
        let msg = Message::decode(line).unwrap();
        assert_eq!(msg.id, "abc");
        assert_eq!(msg.from, "c1");
        assert_eq!(
            msg.body,
            Body::DownloadRequest {
                path: "x.txt".to_string(),
                offset: 10,
                size: 4,
            }
        );
    }

    #[test]
    fn test_decode_failures_are_protocol_errors() {
        for bad in [
            &b"not json"[..],
            br#"{"id":"1","op":"teleport","path":"a"}"#,
            br#"{"id":"1","op":"upload-request"}"#,
            br#"{"id":"1","op":"upload-request","path":"a","data":"!!notbase64"}"#,
        ] {
            assert!(
                matches!(Message::decode(bad), Err(SyncError::Protocol(_))),
                "{}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_error_reply_echoes_id_and_ack_op() {
        let req = Message::request(
            "c1",
            Body::DownloadRequest {
                path: "gone.md".to_string(),
                offset: 0,
                size: 1024,
            },
        );

        let reply = req.error_reply("hub", "no such file");

        assert_eq!(reply.id, req.id);
        assert_eq!(reply.op(), Op::DownloadAck);
        assert_eq!(reply.body.path(), Some("gone.md"));

        let value: serde_json::Value = serde_json::from_slice(&reply.encode().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["error", "from", "id", "op", "path"]);

        let err = reply.into_result().unwrap_err();
        assert!(matches!(err, SyncError::Remote { ref op, .. } if op == "download-ack"));
    }

    #[test]
    fn test_failed_diff_carries_no_plan() {
        let req = Message::request("c1", Body::DiffRequest { payload: Default::default() });
        let frame = req.error_reply("hub", "scan failed").encode().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["op"], "diff-ack");
        assert_eq!(value["error"], "scan failed");
        assert!(value.get("payload").is_none());

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.body, Body::DiffAck { payload: None });
    }

    #[test]
    fn test_empty_download_chunk_keeps_data_field() {
        let ack = Message::request(
            "hub",
            Body::DownloadAck {
                path: "empty.md".to_string(),
                offset: Some(0),
                size: Some(0),
                total_size: Some(0),
                data: Some(Vec::new()),
            },
        );
        let frame = ack.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["data"], "");
        assert_eq!(Message::decode(&frame).unwrap(), ack);
    }

    #[test]
    fn test_error_reply_for_unservable_op_echoes_it() {
        let stray = Message::request(
            "c1",
            Body::Notify {
                path: "a.md".to_string(),
            },
        );
        let reply = stray.error_reply("hub", "unsupported");
        assert_eq!(reply.op(), Op::Notify);
        assert_eq!(reply.id, stray.id);
    }
}
