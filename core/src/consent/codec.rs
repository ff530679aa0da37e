//! Consent wire codec
//!
//! Read and write paths use deliberately different formats:
//!
//! - **Read frame** (peripheral → central): thirteen fields in
//!   [`CONSENT_FIELD_NAMES`] order, each `[len: u8][len bytes]`, one byte
//!   per character. Truncation never fails: the first field that cannot be
//!   read completely, and every field after it, decodes as `""`.
//! - **Acceptance frame** (central → peripheral): consent ids joined with
//!   `;`, one byte per character, no length prefix.
//! - **Delete command** (central → peripheral): `delete:` followed by the
//!   short consent code (`q<digits>`).

use super::types::{ConsentId, ConsentRecord, CONSENT_FIELD_COUNT, CONSENT_FIELD_NAMES};
use thiserror::Error;

/// Separator between ids in an acceptance frame
pub const ACCEPTANCE_DELIMITER: char = ';';

/// Prefix of the delete command
pub const DELETE_COMMAND_PREFIX: &str = "delete:";

/// Largest field a one-byte length prefix can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Errors for frame construction and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Field {field} is {len} bytes, longer than a read frame can carry")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("Character {0:?} has no single-byte encoding")]
    NonLatin1(char),
    #[error("Consent id {0:?} has no q<digits> short code")]
    MissingShortCode(String),
    #[error("Acceptance frame needs at least one consent id")]
    EmptyAcceptance,
    #[error("Read frame carried no consent id")]
    MissingConsentId,
    #[error("Frame of {0} bytes exceeds the characteristic size")]
    FrameTooLarge(usize),
}

/// Stateless encoder/decoder for consent frames.
pub struct ConsentCodec;

impl ConsentCodec {
    /// Decode a read frame. Never fails; see the module docs for the
    /// truncation rule.
    pub fn decode_record(data: &[u8]) -> ConsentRecord {
        let mut cursor = FieldCursor::new(data);
        let fields: [String; CONSENT_FIELD_COUNT] =
            std::array::from_fn(|_| cursor.next_field());
        if cursor.truncated {
            tracing::debug!(
                bytes = data.len(),
                "consent frame truncated, trailing fields left empty"
            );
        }
        ConsentRecord::from_fields(fields)
    }

    /// Encode a record as a read frame.
    pub fn encode_record(record: &ConsentRecord) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Vec::new();
        for (name, value) in CONSENT_FIELD_NAMES.into_iter().zip(record.fields()) {
            let bytes = latin1_bytes(value)?;
            if bytes.len() > MAX_FIELD_LEN {
                return Err(ProtocolError::FieldTooLong {
                    field: name,
                    len: bytes.len(),
                });
            }
            frame.push(bytes.len() as u8);
            frame.extend_from_slice(&bytes);
        }
        Ok(frame)
    }

    /// Encode an acceptance frame for one or more consent ids.
    pub fn encode_acceptance(ids: &[ConsentId]) -> Result<Vec<u8>, ProtocolError> {
        if ids.is_empty() {
            return Err(ProtocolError::EmptyAcceptance);
        }
        let joined = ids
            .iter()
            .map(ConsentId::as_str)
            .collect::<Vec<_>>()
            .join(&ACCEPTANCE_DELIMITER.to_string());
        latin1_bytes(&joined)
    }

    /// Encode the delete command for a consent id.
    pub fn encode_delete(id: &ConsentId) -> Result<Vec<u8>, ProtocolError> {
        let code = id
            .code()
            .ok_or_else(|| ProtocolError::MissingShortCode(id.as_str().to_string()))?;
        let command = format!("{}{}", DELETE_COMMAND_PREFIX, code);
        Ok(command.into_bytes())
    }
}

/// Forward-only reader over a read frame.
struct FieldCursor<'a> {
    data: &'a [u8],
    pos: usize,
    truncated: bool,
}

impl<'a> FieldCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            truncated: false,
        }
    }

    fn next_field(&mut self) -> String {
        if self.truncated {
            return String::new();
        }
        let Some(&len) = self.data.get(self.pos) else {
            self.truncated = true;
            return String::new();
        };
        let start = self.pos + 1;
        let end = start + len as usize;
        match self.data.get(start..end) {
            Some(payload) => {
                self.pos = end;
                payload.iter().map(|&b| b as char).collect()
            }
            None => {
                self.truncated = true;
                String::new()
            }
        }
    }
}

/// One byte per character; anything outside U+0000..=U+00FF is rejected.
fn latin1_bytes(text: &str) -> Result<Vec<u8>, ProtocolError> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| ProtocolError::NonLatin1(c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_record() -> ConsentRecord {
        ConsentRecord {
            id: "q1 Occupancy".into(),
            device_name: "Thermostat".to_string(),
            summary: "Collects room occupancy".to_string(),
            purposes: "Heating schedule".to_string(),
            processing: "On device".to_string(),
            data_category: "Presence".to_string(),
            measures: "Aggregation".to_string(),
            legal_bases: "Consent".to_string(),
            storage: "30 days".to_string(),
            scale: "Single household".to_string(),
            duration: "Until revoked".to_string(),
            frequency: "Every 5 minutes".to_string(),
            location: "Living room".to_string(),
        }
    }

    #[test]
    fn test_decode_well_formed_frame() {
        let record = sample_record();
        let frame = ConsentCodec::encode_record(&record).expect("encode");
        assert_eq!(ConsentCodec::decode_record(&frame), record);
    }

    #[test]
    fn test_decode_empty_buffer_yields_empty_record() {
        let record = ConsentCodec::decode_record(&[]);
        assert_eq!(record, ConsentRecord::default());
    }

    #[test]
    fn test_decode_truncated_payload() {
        // id "q1" complete, deviceName claims 10 bytes but only 3 follow
        let frame = [2, b'q', b'1', 10, b'a', b'b', b'c'];
        let record = ConsentCodec::decode_record(&frame);
        assert_eq!(record.id, "q1");
        assert_eq!(record.device_name, "");
        assert_eq!(record.location, "");
    }

    #[test]
    fn test_decode_stops_after_first_short_field() {
        // A short field must not let later bytes be re-read as fields
        let frame = [2, b'q', b'1', 200, 1, b'x'];
        let record = ConsentCodec::decode_record(&frame);
        assert_eq!(record.id, "q1");
        assert!(record.fields()[1..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn test_decode_high_bytes_map_to_latin1() {
        let frame = [3, b'q', b'1', 0xE9];
        let record = ConsentCodec::decode_record(&frame);
        assert_eq!(record.id.as_str(), "q1\u{e9}");
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut frame = ConsentCodec::encode_record(&sample_record()).expect("encode");
        frame.extend_from_slice(&[5, 1, 2, 3]);
        assert_eq!(ConsentCodec::decode_record(&frame), sample_record());
    }

    #[test]
    fn test_encode_record_rejects_long_field() {
        let record = ConsentRecord {
            summary: "x".repeat(MAX_FIELD_LEN + 1),
            ..sample_record()
        };
        assert_eq!(
            ConsentCodec::encode_record(&record),
            Err(ProtocolError::FieldTooLong {
                field: "summary",
                len: MAX_FIELD_LEN + 1
            })
        );
    }

    #[test]
    fn test_encode_acceptance_joins_with_semicolon() {
        let ids = vec![ConsentId::new("q1"), ConsentId::new("q2")];
        let bytes = ConsentCodec::encode_acceptance(&ids).expect("encode");
        assert_eq!(bytes, b"q1;q2".to_vec());
    }

    #[test]
    fn test_encode_acceptance_single_id_has_no_delimiter() {
        let bytes = ConsentCodec::encode_acceptance(&[ConsentId::new("q7 Camera")])
            .expect("encode");
        assert_eq!(bytes, b"q7 Camera".to_vec());
    }

    #[test]
    fn test_encode_acceptance_empty() {
        assert_eq!(
            ConsentCodec::encode_acceptance(&[]),
            Err(ProtocolError::EmptyAcceptance)
        );
    }

    #[test]
    fn test_encode_acceptance_rejects_wide_chars() {
        let ids = vec![ConsentId::new("q1 \u{2713}")];
        assert_eq!(
            ConsentCodec::encode_acceptance(&ids),
            Err(ProtocolError::NonLatin1('\u{2713}'))
        );
    }

    #[test]
    fn test_encode_delete_uses_short_code() {
        let id = ConsentId::new("q12 Microphone recording");
        let bytes = ConsentCodec::encode_delete(&id).expect("encode");
        assert_eq!(bytes, b"delete:q12".to_vec());
    }

    #[test]
    fn test_encode_delete_without_short_code_fails() {
        let id = ConsentId::new("microphone");
        assert_eq!(
            ConsentCodec::encode_delete(&id),
            Err(ProtocolError::MissingShortCode("microphone".to_string()))
        );
    }

    fn latin1_field() -> impl Strategy<Value = String> {
        proptest::collection::vec(any::<u8>(), 0..=MAX_FIELD_LEN)
            .prop_map(|bytes| bytes.into_iter().map(char::from).collect())
    }

    proptest! {
        #[test]
        fn prop_read_frame_roundtrip(fields in proptest::array::uniform13(latin1_field())) {
            let record = ConsentRecord::from_fields(fields);
            let frame = ConsentCodec::encode_record(&record).expect("encode");
            prop_assert_eq!(ConsentCodec::decode_record(&frame), record);
        }

        #[test]
        fn prop_truncation_empties_tail(
            fields in proptest::array::uniform13(latin1_field()),
            cut in any::<prop::sample::Index>(),
        ) {
            let record = ConsentRecord::from_fields(fields);
            let frame = ConsentCodec::encode_record(&record).expect("encode");
            let cut_at = cut.index(frame.len());
            let decoded = ConsentCodec::decode_record(&frame[..cut_at]);

            // Count the fields that fit entirely within the first cut_at bytes
            let mut complete = 0;
            let mut offset = 0;
            for value in record.fields() {
                let next = offset + 1 + value.chars().count();
                if next > cut_at {
                    break;
                }
                offset = next;
                complete += 1;
            }

            let original = record.fields();
            let got = decoded.fields();
            for i in 0..CONSENT_FIELD_COUNT {
                if i < complete {
                    prop_assert_eq!(got[i], original[i]);
                } else {
                    prop_assert_eq!(got[i], "");
                }
            }
        }
    }
}
