use std::collections::HashMap;

/// Codec translating the header mapping to and from its persisted form.
///
/// The storage engine treats the encoded text as opaque: it is written to
/// the `headers` column on append and handed back to [`decode`] on claim,
/// without inspection in between. Implementations must round-trip every
/// mapping they accept.
///
/// [`decode`]: HeaderCodec::decode
pub trait HeaderCodec: Send + Sync {
    /// Codec-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode a header mapping into its persisted text form.
    fn encode(&self, headers: &HashMap<String, String>) -> Result<String, Self::Error>;

    /// Decode a persisted text form back into a header mapping.
    fn decode(&self, raw: &str) -> Result<HashMap<String, String>, Self::Error>;
}

/// Header codec persisting the mapping as a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHeaderCodec;

impl HeaderCodec for JsonHeaderCodec {
    type Error = serde_json::Error;

    fn encode(&self, headers: &HashMap<String, String>) -> Result<String, Self::Error> {
        serde_json::to_string(headers)
    }

    fn decode(&self, raw: &str) -> Result<HashMap<String, String>, Self::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips_headers() {
        let codec = JsonHeaderCodec;
        let headers = HashMap::from([
            ("content-type".to_owned(), "application/json".to_owned()),
            ("subject".to_owned(), "order.created".to_owned()),
        ]);

        let encoded = codec.encode(&headers).unwrap();
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(decoded, headers);
    }

    #[test]
    fn json_codec_encodes_empty_mapping() {
        let codec = JsonHeaderCodec;

        let encoded = codec.encode(&HashMap::new()).unwrap();

        assert_eq!(encoded, "{}");
        assert!(codec.decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn json_codec_rejects_malformed_input() {
        assert!(JsonHeaderCodec.decode("not json").is_err());
    }
}
