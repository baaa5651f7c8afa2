//! Base64 (standard alphabet, padded) encoding for raw byte fields.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serializer};

pub(crate) mod bytes {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(raw) => s.serialize_some(&STANDARD.encode(raw)),
            None => s.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub(crate) mod bytes_list {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Vec<Vec<u8>>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(list) => {
                let encoded: Vec<String> = list.iter().map(|raw| STANDARD.encode(raw)).collect();
                s.serialize_some(&encoded)
            }
            None => s.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Vec<Vec<u8>>>, D::Error> {
        Option::<Vec<String>>::deserialize(d)?
            .map(|list| {
                list.into_iter()
                    .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
                    .collect()
            })
            .transpose()
    }
}
