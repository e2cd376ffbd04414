//! Defines helper methods for Serializing and Deserializing external types.
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

//------------ Bytes ---------------------------------------------------------

pub fn de_bytes<'de, D>(d: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let some = String::deserialize(d)?;
    let dec = BASE64.decode(&some).map_err(de::Error::custom)?;
    Ok(Bytes::from(dec))
}

pub fn ser_bytes<S>(b: &Bytes, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    BASE64.encode(b).serialize(s)
}

//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

pub fn ser_level_filter<S>(f: &LevelFilter, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    f.to_string().serialize(s)
}

//------------ Tests ---------------------------------------------------------
