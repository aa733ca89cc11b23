// Self-describing event envelope persisted as the value of a log record.
//
// The canonical form is a JSON object carrying the envelope metadata and the
// payload bytes encoded as base64. Consumers round-trip
// validate -> serialize -> parse -> extract without losing the content type
// or the payload.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Envelope format version accepted by this codec.
pub const SPEC_VERSION: &str = "1.0";

// Defaults applied at construction; producers usually override neither.
const DEFAULT_SOURCE: &str = "urn:rill:stream-client";
const DEFAULT_EVENT_TYPE: &str = "dev.rill.stream.event";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("envelope id is missing")]
    MissingId,
    #[error("envelope source is missing")]
    MissingSource,
    #[error("envelope type is missing")]
    MissingType,
    #[error("envelope content type is missing")]
    MissingContentType,
    #[error("unsupported envelope version {0}")]
    UnsupportedSpecVersion(String),
    #[error("failed to serialize envelope")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse envelope")]
    Parse(#[source] serde_json::Error),
}

/// A self-describing event: identity, content type, opaque payload bytes,
/// plus string extension attributes.
///
/// ```
/// use bytes::Bytes;
/// use rill_envelope::Envelope;
///
/// let mut envelope = Envelope::new("example-1");
/// envelope.set_content_type("text/plain");
/// envelope.set_data(Bytes::from_static(b"FOO"));
/// let bytes = envelope.to_bytes().expect("serialize");
/// let parsed = Envelope::from_bytes(&bytes).expect("parse");
/// assert_eq!(parsed.data(), Bytes::from_static(b"FOO"));
/// assert_eq!(parsed.content_type(), Some("text/plain"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "specversion")]
    spec_version: String,
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(
        rename = "datacontenttype",
        skip_serializing_if = "Option::is_none",
        default
    )]
    content_type: Option<String>,
    #[serde(rename = "data_base64", with = "base64_bytes")]
    data: Bytes,
    // Extension attributes are flattened into the top-level JSON object.
    #[serde(flatten)]
    extensions: BTreeMap<String, String>,
}

impl Envelope {
    /// Creates an envelope with the given id and the library defaults for
    /// source and type. Payload starts present but empty.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            id: id.into(),
            source: DEFAULT_SOURCE.to_string(),
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            content_type: None,
            data: Bytes::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn set_event_type(&mut self, event_type: impl Into<String>) {
        self.event_type = event_type.into();
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_data(&mut self, data: Bytes) {
        self.data = data;
    }

    /// Payload bytes. Cheap to clone; may be empty.
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    /// Sets a string extension attribute, replacing any previous value.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extensions.insert(name.into(), value.into());
    }

    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    /// Checks that every required field is present and the version is one
    /// this codec understands.
    pub fn validate(&self) -> Result<()> {
        if self.spec_version != SPEC_VERSION {
            return Err(Error::UnsupportedSpecVersion(self.spec_version.clone()));
        }
        if self.id.is_empty() {
            return Err(Error::MissingId);
        }
        if self.source.is_empty() {
            return Err(Error::MissingSource);
        }
        if self.event_type.is_empty() {
            return Err(Error::MissingType);
        }
        match &self.content_type {
            Some(content_type) if !content_type.is_empty() => Ok(()),
            _ => Err(Error::MissingContentType),
        }
    }

    /// Serializes to the canonical JSON form. Validates first, so an
    /// envelope that reaches the wire is always well formed.
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.validate()?;
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Parse)
    }
}

mod base64_bytes {
    // Binary payloads ride inside JSON as base64 strings.
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
