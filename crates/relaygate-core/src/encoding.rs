//! Serde helpers for byte fields carried inside JSON

/// `Vec<u8>` as a standard base64 string
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw.as_bytes()).map_err(D::Error::custom)
    }
}

/// `HashMap<String, Vec<u8>>` with every value base64 encoded
pub mod base64_map {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::collections::{BTreeMap, HashMap};

    pub fn serialize<S: Serializer>(map: &HashMap<String, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        // sorted keys keep the encoding deterministic
        let sorted: BTreeMap<&String, &Vec<u8>> = map.iter().collect();
        let mut out = s.serialize_map(Some(sorted.len()))?;
        for (key, val) in sorted {
            out.serialize_entry(key, &STANDARD.encode(val))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
        let raw = HashMap::<String, String>::deserialize(d)?;
        raw.into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
