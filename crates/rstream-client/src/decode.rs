//! Conversion of raw data messages to structured values

use std::sync::Arc;

use bytes::Bytes;

use crate::error::DecodeError;

/// Producer-supplied conversion from a raw message to a plain structured value
pub type MessageDecoder =
    Arc<dyn Fn(&Bytes) -> Result<serde_json::Value, DecodeError> + Send + Sync>;

/// Decoder for transports that carry JSON-encoded messages
pub fn json_decoder() -> MessageDecoder {
    Arc::new(|bytes: &Bytes| Ok(serde_json::from_slice(bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_decoder() {
        let decode = json_decoder();
        let value = decode(&Bytes::from_static(br#"{"price":42}"#)).unwrap();
        assert_eq!(value["price"], 42);

        let err = decode(&Bytes::from_static(b"\x08\x96\x01")).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }
}
