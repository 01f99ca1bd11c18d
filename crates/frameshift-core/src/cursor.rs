//! Opaque pagination cursors for the composite job listing.
//!
//! A cursor is base64url(JSON) of a section-tagged position: the `pending`
//! section continues strictly after `(queue_position, created_at, id)`, the
//! `finished` section strictly before `(updated_at, id)`. The decoder also
//! accepts the legacy untagged `{id, created_at}` shape, which predates
//! section tagging and is treated as the initial listing position.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::store::types::JobId;

/// Position in the two-section listing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "lowercase")]
pub enum Cursor {
    Pending {
        queue_position: Option<i64>,
        created_at: String,
        id: JobId,
    },
    Finished {
        updated_at: String,
        id: JobId,
    },
}

/// Legacy cursor body from before section-aware pagination.
#[derive(Debug, Deserialize)]
struct LegacyCursor {
    #[allow(dead_code)]
    id: JobId,
    #[allow(dead_code)]
    created_at: String,
}

impl Cursor {
    /// Start of the pending section (page one).
    pub fn initial() -> Self {
        Cursor::Pending {
            queue_position: None,
            created_at: String::new(),
            id: 0,
        }
    }

    /// True for the sentinel returned by [`Cursor::initial`] and legacy decodes.
    pub fn is_initial(&self) -> bool {
        matches!(self, Cursor::Pending { id: 0, created_at, .. } if created_at.is_empty())
    }

    pub fn encode(&self) -> String {
        // Serialization of this enum cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a client-supplied cursor. Returns None on malformed input
    /// (callers surface 400); legacy bodies normalize to the initial position.
    pub fn decode(s: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(s.trim()).ok()?;
        if let Ok(cursor) = serde_json::from_slice::<Cursor>(&bytes) {
            return Some(cursor);
        }
        serde_json::from_slice::<LegacyCursor>(&bytes)
            .ok()
            .map(|_| Cursor::initial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_identity_pending() {
        let cursor = Cursor::Pending {
            queue_position: Some(7),
            created_at: "2024-06-01T12:30:00Z".into(),
            id: 42,
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn encode_decode_identity_finished() {
        let cursor = Cursor::Finished {
            updated_at: "2024-06-02T08:00:00Z".into(),
            id: 99,
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn null_queue_position_roundtrips() {
        let cursor = Cursor::Pending {
            queue_position: None,
            created_at: "2024-06-01T12:30:00Z".into(),
            id: 3,
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn legacy_shape_yields_initial_position() {
        let legacy = URL_SAFE_NO_PAD.encode(r#"{"id":12,"created_at":"2023-01-01 00:00:00"}"#);
        let decoded = Cursor::decode(&legacy).unwrap();
        assert!(decoded.is_initial());
    }

    #[test]
    fn malformed_input_is_none() {
        assert!(Cursor::decode("not base64 at all!").is_none());
        let junk = URL_SAFE_NO_PAD.encode(r#"{"foo": 1}"#);
        assert!(Cursor::decode(&junk).is_none());
        let not_json = URL_SAFE_NO_PAD.encode("plain text");
        assert!(Cursor::decode(&not_json).is_none());
    }
}
