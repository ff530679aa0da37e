// Consent types: what a peripheral discloses about its data processing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Short consent code: `q` followed by one or more digits (e.g. `q12`).
///
/// This is the only part of a consent id that peripherals understand in
/// commands; the rest of the id is a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsentCode(String);

impl ConsentCode {
    /// Find the first `q<digits>` token inside `text`.
    pub fn find_in(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        for (start, &b) in bytes.iter().enumerate() {
            if b != b'q' {
                continue;
            }
            let digits = bytes[start + 1..]
                .iter()
                .take_while(|c| c.is_ascii_digit())
                .count();
            if digits > 0 {
                return Some(Self(text[start..start + 1 + digits].to_string()));
            }
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Consent identifier as sent by the peripheral.
///
/// The raw text is kept verbatim (it is what gets persisted and compared
/// for dedup), while the short code is extracted once at construction so
/// command builders never pattern-match strings at send time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ConsentId {
    raw: String,
    code: Option<ConsentCode>,
}

impl ConsentId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let code = ConsentCode::find_in(&raw);
        Self { raw, code }
    }

    /// Full identifier, including any descriptive suffix.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Short code, if the identifier carries one.
    pub fn code(&self) -> Option<&ConsentCode> {
        self.code.as_ref()
    }

    /// Descriptive text following the short code (empty when absent).
    pub fn suffix(&self) -> &str {
        match &self.code {
            Some(code) => self
                .raw
                .find(code.as_str())
                .map(|at| self.raw[at + code.as_str().len()..].trim_start())
                .unwrap_or(""),
            None => "",
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl PartialEq for ConsentId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ConsentId {}

impl std::hash::Hash for ConsentId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialEq<str> for ConsentId {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}

impl PartialEq<&str> for ConsentId {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}

impl From<String> for ConsentId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for ConsentId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<ConsentId> for String {
    fn from(id: ConsentId) -> Self {
        id.raw
    }
}

impl fmt::Display for ConsentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Number of text fields carried by a consent record on the wire.
pub const CONSENT_FIELD_COUNT: usize = 13;

/// Wire order of the consent record fields.
pub const CONSENT_FIELD_NAMES: [&str; CONSENT_FIELD_COUNT] = [
    "id",
    "deviceName",
    "summary",
    "purposes",
    "processing",
    "dataCategory",
    "measures",
    "legalBases",
    "storage",
    "scale",
    "duration",
    "frequency",
    "location",
];

/// A data-processing consent disclosed by a peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub id: ConsentId,
    pub device_name: String,
    pub summary: String,
    pub purposes: String,
    pub processing: String,
    pub data_category: String,
    pub measures: String,
    pub legal_bases: String,
    pub storage: String,
    pub scale: String,
    pub duration: String,
    pub frequency: String,
    pub location: String,
}

impl ConsentRecord {
    /// Build a record from its fields in wire order.
    pub fn from_fields(fields: [String; CONSENT_FIELD_COUNT]) -> Self {
        let [id, device_name, summary, purposes, processing, data_category, measures, legal_bases, storage, scale, duration, frequency, location] =
            fields;
        Self {
            id: ConsentId::new(id),
            device_name,
            summary,
            purposes,
            processing,
            data_category,
            measures,
            legal_bases,
            storage,
            scale,
            duration,
            frequency,
            location,
        }
    }

    /// Fields in wire order.
    pub fn fields(&self) -> [&str; CONSENT_FIELD_COUNT] {
        [
            self.id.as_str(),
            &self.device_name,
            &self.summary,
            &self.purposes,
            &self.processing,
            &self.data_category,
            &self.measures,
            &self.legal_bases,
            &self.storage,
            &self.scale,
            &self.duration,
            &self.frequency,
            &self.location,
        ]
    }

    /// Case-insensitive match of `query_lower` against the text fields a
    /// user can search by. `device_name` is matched at the entry level.
    pub fn matches(&self, query_lower: &str) -> bool {
        [
            self.id.as_str(),
            &self.data_category,
            &self.purposes,
            &self.processing,
            &self.summary,
            &self.measures,
            &self.legal_bases,
            &self.storage,
            &self.scale,
            &self.duration,
            &self.frequency,
            &self.location,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(query_lower))
    }
}

/// Consents stored for one peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConsentEntry {
    pub peripheral_id: String,
    pub device_name: String,
    pub consents: Vec<ConsentRecord>,
}

impl DeviceConsentEntry {
    pub fn new(peripheral_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            peripheral_id: peripheral_id.into(),
            device_name: device_name.into(),
            consents: Vec::new(),
        }
    }

    pub fn consent(&self, consent_id: &str) -> Option<&ConsentRecord> {
        self.consents.iter().find(|c| c.id == *consent_id)
    }
}
