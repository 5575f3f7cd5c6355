// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every payload travels inside a [`MessageEnvelope`] carrying its identity,
//! creation time, retry counter and optional delay, priority and headers. The
//! envelope is encoded as JSON:
//!
//! ```json
//! {"id":"…","data":{…},"timestamp":1700000000000,"retryCount":0}
//! ```
//!
//! Unknown fields are ignored when decoding. A frame lacking `id`, `data` or
//! `timestamp` is malformed and must never be retried.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Header linking a retried envelope to the first envelope of its chain
pub const HEADER_ORIGINAL_ID: &str = "x-original-id";
/// Header linking a retried envelope to the envelope it replaces
pub const HEADER_PREVIOUS_ID: &str = "x-previous-id";
/// Header hinting the delay, in milliseconds, applied before a retry
pub const HEADER_RETRY_DELAY: &str = "x-retry-delay";

/// JSON object keyed by header name.
pub type EnvelopeHeaders = BTreeMap<String, Value>;

/// Transport wrapper around an application payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Fresh UUID per attempt; see [`original_id`](MessageEnvelope::original_id).
    pub id: String,
    /// Application payload.
    pub data: Value,
    /// Milliseconds since epoch at first send.
    pub timestamp: i64,
    /// Zero on the first attempt.
    pub retry_count: u32,
    /// Delay in milliseconds requested for this attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<EnvelopeHeaders>,
}

/// Optional envelope fields supplied at send time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeOptions {
    pub delay: Option<u64>,
    pub priority: Option<u8>,
    pub headers: Option<EnvelopeHeaders>,
}

/// Wire shape accepted on decode; every field is optional so that missing
/// ones are reported as malformed instead of as a serde error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    id: Option<String>,
    #[serde(default, deserialize_with = "present")]
    data: Option<Value>,
    timestamp: Option<i64>,
    #[serde(default)]
    retry_count: Option<u32>,
    delay: Option<u64>,
    priority: Option<u8>,
    headers: Option<EnvelopeHeaders>,
}

/// Distinguishes a `null` payload from a missing one.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl MessageEnvelope {
    /// Wraps a payload into a fresh envelope with a new id and the current time.
    pub fn new<T>(payload: &T, options: EnvelopeOptions) -> Result<MessageEnvelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(MessageEnvelope {
            id: Uuid::new_v4().to_string(),
            data,
            timestamp: now_millis(),
            retry_count: 0,
            delay: options.delay,
            priority: options.priority,
            headers: options.headers.filter(|h| !h.is_empty()),
        })
    }

    /// Encodes the envelope into its JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// Parses a frame, failing with [`AmqpError::MalformedEnvelope`] when it
    /// is not JSON or lacks a mandatory field.
    pub fn decode(frame: &[u8]) -> Result<MessageEnvelope, AmqpError> {
        let raw: RawEnvelope = serde_json::from_slice(frame)
            .map_err(|err| AmqpError::MalformedEnvelope(err.to_string()))?;

        let id = match raw.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(AmqpError::MalformedEnvelope("missing id".to_owned())),
        };

        let Some(data) = raw.data else {
            return Err(AmqpError::MalformedEnvelope("missing data".to_owned()));
        };

        let timestamp = match raw.timestamp {
            Some(ts) if ts > 0 => ts,
            _ => return Err(AmqpError::MalformedEnvelope("missing timestamp".to_owned())),
        };

        Ok(MessageEnvelope {
            id,
            data,
            timestamp,
            retry_count: raw.retry_count.unwrap_or_default(),
            delay: raw.delay,
            priority: raw.priority,
            headers: raw.headers,
        })
    }

    /// Deserializes the payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }

    /// Id of the first envelope of this retry chain.
    pub fn original_id(&self) -> &str {
        self.header(HEADER_ORIGINAL_ID)
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }

    /// Builds the envelope for the next attempt with the default exponential
    /// backoff.
    pub fn next_retry(&self, max_retries: u32) -> Result<MessageEnvelope, AmqpError> {
        self.next_retry_with(&RetryPolicy::new(max_retries))
    }

    /// Builds the envelope for the next attempt.
    ///
    /// The retry counter is incremented, the id is replaced and linked back
    /// through [`HEADER_ORIGINAL_ID`] and [`HEADER_PREVIOUS_ID`], and the delay
    /// is recomputed from the policy backoff. The creation timestamp is kept.
    pub fn next_retry_with(&self, policy: &RetryPolicy) -> Result<MessageEnvelope, AmqpError> {
        let retry_count = self.retry_count + 1;
        if retry_count > policy.max_retries {
            return Err(AmqpError::RetryLimitExceeded(retry_count, policy.max_retries));
        }

        let delay = policy.delay_for(retry_count);

        let mut headers = self.headers.clone().unwrap_or_default();
        headers.insert(
            HEADER_ORIGINAL_ID.to_owned(),
            Value::String(self.original_id().to_owned()),
        );
        headers.insert(HEADER_PREVIOUS_ID.to_owned(), Value::String(self.id.clone()));

        Ok(MessageEnvelope {
            id: Uuid::new_v4().to_string(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            retry_count,
            delay: Some(delay.as_millis() as u64),
            priority: self.priority,
            headers: Some(headers),
        })
    }
}

/// Delay applied before a retry, as a function of the new retry count.
#[derive(Clone)]
pub enum Backoff {
    /// `base * 2^retry_count`
    Exponential { base: Duration },
    /// Same delay for every attempt.
    Fixed(Duration),
    /// Delay computed from the retry count.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential { base } => f
                .debug_struct("Exponential")
                .field("base", base)
                .finish(),
            Backoff::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Backoff::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Backoff {
    /// Delay before attempt `retry_count`. Exponential delays saturate instead of
    /// overflowing.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                base.saturating_mul(2u32.saturating_pow(retry_count.min(31)))
            }
            Backoff::Fixed(delay) => *delay,
            Backoff::Custom(f) => f(retry_count),
        }
    }
}

/// Retry behaviour of a protected queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3)
    }
}

impl RetryPolicy {
    /// Policy with the default exponential backoff starting at one second.
    ///
    /// # Parameters
    /// * `max_retries` - Retries allowed after the first attempt
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            backoff: Backoff::default(),
        }
    }

    /// Replaces the backoff.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff.delay(retry_count)
    }
}
