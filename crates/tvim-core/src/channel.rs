//! Channel URIs and tune parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DomainError, DomainResult};
use crate::input::InputId;

const CHANNEL_PREFIX: &str = "content://android.media.tv/channel/";
const PASSTHROUGH_PREFIX: &str = "content://android.media.tv/passthrough/";
const CONTENT_SCHEME: &str = "content://";

/// Escape character for encoded tune params.
const ESCAPE: char = '%';

/// Characters that must be escaped inside an encoded key or value.
const ESCAPED_CHARS: &[char] = &['%', '=', ','];

/// The target of a `tune` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelUri {
    /// A row in the channel table.
    Channel(i64),
    /// Pass-through to the given input; never logged as a channel watch.
    Passthrough(InputId),
    /// Any other content URI (programs, recordings).
    Other(String),
}

impl ChannelUri {
    /// Parses a content URI.
    ///
    /// Only `content://` URIs are accepted. A channel URI must end in a
    /// numeric id.
    pub fn parse(uri: &str) -> DomainResult<Self> {
        if let Some(id) = uri.strip_prefix(CHANNEL_PREFIX) {
            return id
                .parse::<i64>()
                .map(Self::Channel)
                .map_err(|_| DomainError::InvalidChannelUri {
                    uri: uri.to_string(),
                });
        }
        if let Some(input) = uri.strip_prefix(PASSTHROUGH_PREFIX) {
            if input.is_empty() {
                return Err(DomainError::InvalidChannelUri {
                    uri: uri.to_string(),
                });
            }
            return Ok(Self::Passthrough(InputId::new(input)));
        }
        if uri.starts_with(CONTENT_SCHEME) {
            return Ok(Self::Other(uri.to_string()));
        }
        Err(DomainError::InvalidChannelUri {
            uri: uri.to_string(),
        })
    }

    pub fn channel(id: i64) -> Self {
        Self::Channel(id)
    }

    pub fn passthrough(input: impl Into<InputId>) -> Self {
        Self::Passthrough(input.into())
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough(_))
    }

    /// Channel row id, if this is a channel URI.
    pub fn channel_id(&self) -> Option<i64> {
        match self {
            Self::Channel(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "{CHANNEL_PREFIX}{id}"),
            Self::Passthrough(input) => write!(f, "{PASSTHROUGH_PREFIX}{input}"),
            Self::Other(uri) => write!(f, "{uri}"),
        }
    }
}

impl TryFrom<String> for ChannelUri {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelUri> for String {
    fn from(uri: ChannelUri) -> Self {
        uri.to_string()
    }
}

/// Extra key/value parameters passed along with a tune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TuneParams(BTreeMap<String, String>);

impl TuneParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes as `key=value, key=value` in key order.
    ///
    /// `%`, `=` and `,` inside keys and values are prefixed with `%`.
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<BTreeMap<String, String>> for TuneParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

fn escape(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        if ESCAPED_CHARS.contains(&c) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}
