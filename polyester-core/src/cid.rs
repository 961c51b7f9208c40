use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-byte Blake3 hash that addresses a stored object.
///
/// On the wire a cid is a 64-character lowercase hex string, so it survives
/// a trip through JSON documents unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

/// Error returned when parsing a cid from its hex form.
#[derive(Debug, thiserror::Error)]
pub enum CidError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl Cid {
    /// Computes the cid (hash) of the given data.
    pub fn from_data(data: &[u8]) -> Self {
        Cid(*blake3::hash(data).as_bytes())
    }

    /// Returns the cid as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CidError::Length(bytes.len()))?;
        Ok(Cid(arr))
    }
}

impl Serialize for Cid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CidVisitor;

        impl serde::de::Visitor<'_> for CidVisitor {
            type Value = Cid;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("64 hex characters")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(CidVisitor)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_deterministic() {
        let data = b"hello world";
        assert_eq!(Cid::from_data(data), Cid::from_data(data));
    }

    #[test]
    fn cid_different_data() {
        assert_ne!(Cid::from_data(b"hello"), Cid::from_data(b"world"));
    }

    #[test]
    fn cid_parses_its_display_form() {
        let cid = Cid::from_data(b"test");
        let s = cid.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn cid_rejects_short_hex() {
        assert!(matches!("abcd".parse::<Cid>(), Err(CidError::Length(2))));
        assert!(matches!("zz".parse::<Cid>(), Err(CidError::Hex(_))));
    }

    #[test]
    fn cid_json_is_a_string() {
        let cid = Cid::from_data(b"json");
        let value = serde_json::to_value(cid).unwrap();
        assert_eq!(value, serde_json::Value::String(cid.to_string()));
        let back: Cid = serde_json::from_value(value).unwrap();
        assert_eq!(back, cid);
    }
}
