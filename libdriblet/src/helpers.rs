//! Serde adapters for hex-encoded byte fields, plus the wall-clock helper.
//!
//! Records hold signatures, salts and digests as raw bytes; these adapters keep them readable
//! as lowercase hex in the human-oriented store format.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Serializes any byte field (`Vec<u8>`, `[u8; N]`, ...) as a lowercase hex string.
pub fn to_hex<T, S>(bytes: &T, ser: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]> + ?Sized,
    S: Serializer,
{
    ser.serialize_str(&hex::encode(bytes.as_ref()))
}

/// Deserializes a hex string of any length into a byte vector.
pub fn from_hex<'de, D>(de: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(de)?;
    hex::decode(&encoded).map_err(|e| D::Error::custom(format!("not a hex string: {e}")))
}

/// Deserializes a hex string into a fixed-size array; the length is checked against `N`.
pub fn fixed_from_hex<'de, const N: usize, D>(de: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(de)?;
    let mut bytes = [0u8; N];
    hex::decode_to_slice(&encoded, &mut bytes)
        .map_err(|e| D::Error::custom(format!("expected {} hex characters: {e}", 2 * N)))?;
    Ok(bytes)
}

pub fn option_to_hex<T, S>(opt: &Option<T>, ser: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    match opt {
        Some(bytes) => ser.serialize_some(&hex::encode(bytes.as_ref())),
        None => ser.serialize_none(),
    }
}

pub fn option_from_hex<'de, D>(de: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(de)?
        .map(|encoded| {
            hex::decode(&encoded).map_err(|e| D::Error::custom(format!("not a hex string: {e}")))
        })
        .transpose()
}

/// The current wall-clock time as a UNIX timestamp in seconds.
///
/// Channel expiry is defined in terms of block timestamps, which track wall-clock time to within
/// a few hours. That fuzz is part of the protocol contract; callers must leave a safety margin.
pub fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(
            serialize_with = "super::to_hex",
            deserialize_with = "super::fixed_from_hex"
        )]
        digest: [u8; 4],
        #[serde(
            serialize_with = "super::option_to_hex",
            deserialize_with = "super::option_from_hex",
            default
        )]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn hex_fields_round_trip() {
        let wrapper = Wrapper { digest: [0xde, 0xad, 0xbe, 0xef], extra: Some(vec![1, 2, 3]) };
        let encoded = ron::to_string(&wrapper).unwrap();
        assert!(encoded.contains("deadbeef"));
        let decoded: Wrapper = ron::from_str(&encoded).unwrap();
        assert_eq!(decoded.digest, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decoded.extra, Some(vec![1, 2, 3]));
    }

    #[test]
    fn absent_options_stay_absent() {
        let encoded = ron::to_string(&Wrapper { digest: [0; 4], extra: None }).unwrap();
        let decoded: Wrapper = ron::from_str(&encoded).unwrap();
        assert_eq!(decoded.extra, None);
    }

    #[test]
    fn bad_digests_are_rejected() {
        // Too short for four bytes.
        assert!(ron::from_str::<Wrapper>(r#"(digest:"deadbe",extra:None)"#).is_err());
        // Right length, not hex.
        assert!(ron::from_str::<Wrapper>(r#"(digest:"deadbeez",extra:None)"#).is_err());
    }
}
