use chrono::{serde::ts_milliseconds, DateTime, Utc};
use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Deserializer, Serialize};

/// Everything but ASCII alphanumerics and `-` is escaped, `_` included, so
/// the `_` separators of a storage key are unambiguous.
const SESSION_ID_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-');

/// Latest unsaved edit for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub question_id: String,
    pub selected_answers: Vec<String>,
    pub is_flagged: bool,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub current_page: u32,
    pub total_answered: u32,
    pub flagged_count: u32,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_answered: 0,
            flagged_count: 0,
        }
    }
}

impl SessionMetadata {
    /// Merges a partial update field by field. Pages are 1-based.
    pub fn apply(&mut self, update: &SessionMetadataUpdate) {
        if let Some(page) = update.current_page {
            self.current_page = page.max(1);
        }
        if let Some(answered) = update.total_answered {
            self.total_answered = answered;
        }
        if let Some(flagged) = update.flagged_count {
            self.flagged_count = flagged;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadataUpdate {
    pub current_page: Option<u32>,
    pub total_answered: Option<u32>,
    pub flagged_count: Option<u32>,
}

impl SessionMetadataUpdate {
    pub fn current_page(mut self, page: u32) -> Self {
        self.current_page = Some(page);
        self
    }

    pub fn total_answered(mut self, answered: u32) -> Self {
        self.total_answered = Some(answered);
        self
    }

    pub fn flagged_count(mut self, flagged: u32) -> Self {
        self.flagged_count = Some(flagged);
        self
    }
}

/// Identifies one quiz-taking session of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub exam_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(exam_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            exam_id: exam_id.into(),
            user_id: user_id.into(),
        }
    }

    /// `autosave_{examId}_{userId}` with both ids percent-encoded, so
    /// distinct sessions never share a key.
    pub fn storage_key(&self) -> String {
        format!(
            "autosave_{}_{}",
            utf8_percent_encode(&self.exam_id, SESSION_ID_ENCODE_SET),
            utf8_percent_encode(&self.user_id, SESSION_ID_ENCODE_SET)
        )
    }
}

/// Frozen batch handed to the save gateway. Retries resend it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveAttempt {
    pub id: u64,
    pub changes: Vec<PendingChange>,
    pub session_metadata: SessionMetadata,
    pub attempt_number: u32,
}

impl SaveAttempt {
    pub fn to_request(&self, session: &SessionKey) -> AutosaveRequest {
        AutosaveRequest {
            exam_quiz_id: session.exam_id.clone(),
            user_id: session.user_id.clone(),
            changes: self.changes.clone(),
            session_data: self.session_metadata.clone(),
        }
    }
}

/// Durable mirror of everything not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBackup {
    pub changes: IndexMap<String, PendingChange>,
    pub session_metadata: SessionMetadata,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /autosave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveRequest {
    pub exam_quiz_id: String,
    pub user_id: String,
    pub changes: Vec<PendingChange>,
    pub session_data: SessionMetadata,
}

/// Response of `POST /autosave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfirmation {
    pub success: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub saved: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    FractionalMillis(f64),
    Text(String),
}

/// Servers echo either epoch milliseconds or an RFC 3339 string. The value is
/// informational, so anything unparseable decodes as `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let timestamp = match Option::<WireTimestamp>::deserialize(deserializer)? {
        Some(WireTimestamp::Millis(millis)) => DateTime::from_timestamp_millis(millis),
        Some(WireTimestamp::FractionalMillis(millis)) => {
            DateTime::from_timestamp_millis(millis as i64)
        }
        Some(WireTimestamp::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        None => None,
    };
    Ok(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_wire_field_names() {
        let attempt = SaveAttempt {
            id: 1,
            changes: vec![PendingChange {
                question_id: "q1".to_string(),
                selected_answers: vec!["a1".to_string()],
                is_flagged: true,
                timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            }],
            session_metadata: SessionMetadata::default(),
            attempt_number: 0,
        };

        let body = serde_json::to_value(attempt.to_request(&SessionKey::new("exam-1", "user-7")))
            .unwrap();

        assert_eq!(
            body,
            json!({
                "examQuizId": "exam-1",
                "userId": "user-7",
                "changes": [{
                    "questionId": "q1",
                    "selectedAnswers": ["a1"],
                    "isFlagged": true,
                    "timestamp": 1_700_000_000_123i64,
                }],
                "sessionData": { "currentPage": 1, "totalAnswered": 0, "flaggedCount": 0 },
            })
        );
    }

    #[test]
    fn confirmation_tolerates_missing_optional_fields() {
        let confirmation: SaveConfirmation =
            serde_json::from_value(json!({ "success": false, "message": "locked" })).unwrap();
        assert!(!confirmation.success);
        assert_eq!(confirmation.saved, 0);
        assert_eq!(confirmation.message.as_deref(), Some("locked"));
    }

    #[test]
    fn confirmation_accepts_millisecond_and_rfc3339_timestamps() {
        let expected = DateTime::from_timestamp_millis(1_700_000_000_123);

        let millis: SaveConfirmation = serde_json::from_str(
            r#"{"success":true,"timestamp":1700000000123,"saved":1}"#,
        )
        .unwrap();
        assert_eq!(millis.timestamp, expected);
        assert_eq!(millis.saved, 1);

        let text: SaveConfirmation = serde_json::from_str(
            r#"{"success":true,"timestamp":"2023-11-14T22:13:20.123Z","saved":1}"#,
        )
        .unwrap();
        assert_eq!(text.timestamp, expected);

        let garbled: SaveConfirmation = serde_json::from_str(
            r#"{"success":true,"timestamp":"yesterday","saved":1}"#,
        )
        .unwrap();
        assert!(garbled.success);
        assert_eq!(garbled.timestamp, None);

        let null: SaveConfirmation =
            serde_json::from_str(r#"{"success":true,"timestamp":null}"#).unwrap();
        assert_eq!(null.timestamp, None);
    }

    #[test]
    fn metadata_update_merges_only_present_fields() {
        let mut metadata = SessionMetadata::default();
        metadata.apply(&SessionMetadataUpdate::default().total_answered(4));
        metadata.apply(&SessionMetadataUpdate::default().current_page(0));

        assert_eq!(metadata.current_page, 1);
        assert_eq!(metadata.total_answered, 4);
        assert_eq!(metadata.flagged_count, 0);
    }

    #[test]
    fn storage_key_combines_exam_and_user() {
        assert_eq!(SessionKey::new("e", "u").storage_key(), "autosave_e_u");
        assert_eq!(
            SessionKey::new("exam-1", "user-7").storage_key(),
            "autosave_exam-1_user-7"
        );
    }

    #[test]
    fn storage_keys_of_distinct_sessions_differ() {
        let pairs = [
            (SessionKey::new("a_b", "c"), SessionKey::new("a", "b_c")),
            (SessionKey::new("exam.1", "u"), SessionKey::new("exam_1", "u")),
            (SessionKey::new("экзамен", "u"), SessionKey::new("история", "u")),
        ];

        for (left, right) in pairs {
            assert_ne!(left.storage_key(), right.storage_key(), "{:?} vs {:?}", left, right);
        }
        assert_eq!(SessionKey::new("a_b", "c").storage_key(), "autosave_a%5Fb_c");
    }
}
