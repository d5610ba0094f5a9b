//! Serde helper encoding byte vectors as base64 strings
//!
//! Keeps the persisted JSON card state compact and readable. Apply
//! with `#[serde(with = "crate::bytes")]`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if bytes.is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: String = Deserialize::deserialize(deserializer)?;
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "crate::bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_round_trip() {
        let original = Wrapper {
            data: vec![0x00, 0xFF, 0x10],
        };
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("AP8Q"));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_empty() {
        let original = Wrapper { data: vec![] };
        let json = serde_json::to_string(&original).unwrap();
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }
}
