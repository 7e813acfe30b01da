//! Core types for subflow sampling

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// Subflow identifier, scoped to one socket
pub type SubflowId = u32;

/// OS handle of the sampled socket (a file descriptor on Linux)
pub type SocketHandle = i32;

/// Feature name to value mapping for one subflow
pub type FeatureMap = BTreeMap<String, FeatureValue>;

/// A named scalar telemetry value
///
/// Serializes untagged, so a sample stored as JSON reads as a plain object
/// (`{"tcpi_rtt": 50}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Unsigned counter or gauge (all `tcp_info` fields)
    Unsigned(u64),
    /// Signed value
    Signed(i64),
    /// Floating point value
    Float(f64),
    /// Free-form text value
    Text(String),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Unsigned(v) => write!(f, "{}", v),
            FeatureValue::Signed(v) => write!(f, "{}", v),
            FeatureValue::Float(v) => write!(f, "{}", v),
            FeatureValue::Text(v) => f.write_str(v),
        }
    }
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for FeatureValue {
            fn from(v: $t) -> Self {
                FeatureValue::Unsigned(u64::from(v))
            }
        })*
    };
}

impl_from_unsigned!(u8, u16, u32, u64);

impl From<i32> for FeatureValue {
    fn from(v: i32) -> Self {
        FeatureValue::Signed(i64::from(v))
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Signed(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

/// Raw statistics of one active subflow
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowStats {
    /// Subflow id
    pub id: SubflowId,
    /// Raw feature map as read from the socket, reserved columns included
    pub features: FeatureMap,
}

impl SubflowStats {
    /// Create stats for a subflow with an empty feature map
    pub fn new(id: SubflowId) -> Self {
        Self {
            id,
            features: FeatureMap::new(),
        }
    }

    /// Add a feature
    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }
}

/// Endpoint address pair of one subflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubflowAddrs {
    /// Subflow id
    pub id: SubflowId,
    /// Local endpoint
    pub local: SocketAddr,
    /// Remote endpoint
    pub remote: SocketAddr,
}

impl SubflowAddrs {
    /// Create an address pair entry
    pub fn new(id: SubflowId, local: SocketAddr, remote: SocketAddr) -> Self {
        Self { id, local, remote }
    }
}
