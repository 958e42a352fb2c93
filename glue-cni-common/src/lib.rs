pub mod partition;
pub mod topology;

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use macaddr::MacAddr6;
pub use partition::{NodeAddressPlan, partition};
pub use topology::{DEFAULT_NEIGHBOR_MAC, Master, MasterKind, NetworkTopology};

/// Name of the link the agent manages on the host.
pub const MANAGED_LINK: &str = "glue";

pub const DEFAULT_TOPOLOGY_FILE: &str = "/run/glue/subnet.json";

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn serialize_to_string<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    value.to_string().serialize(serializer)
}

pub fn serialize_to_string_slice<S, T>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<String>>()
        .serialize(serializer)
}

pub fn serialize_opt_to_string<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    value.as_ref().map(|v| v.to_string()).serialize(serializer)
}

pub fn deserialize_from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let buf = String::deserialize(deserializer)?;
    T::from_str(&buf).map_err(|e| serde::de::Error::custom(e.to_string()))
}

pub fn deserialize_from_str_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let buf: Vec<String> = Vec::deserialize(deserializer)?;
    let mut out = vec![];
    for val in buf {
        out.push(T::from_str(&val).map_err(|e| serde::de::Error::custom(e.to_string()))?);
    }
    Ok(out)
}

/// Treats a missing, null or empty string as `None`.
pub fn deserialize_non_empty<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let buf: Option<String> = Option::deserialize(deserializer)?;
    match buf.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => T::from_str(s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(e.to_string())),
    }
}
