//! Relay wire frames
//!
//! Frames are JSON arrays whose first element names the frame type:
//!
//! - client to relay: `EVENT`, `REQ`, `CLOSE`
//! - relay to client: `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`

use serde_json::Value;

use crate::errors::{CoreError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::types::SubscriptionId;

// ----------------------------------------------------------------------------
// Client Frames
// ----------------------------------------------------------------------------

/// Frames sent from client to relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Box<Event>),
    /// `["REQ", <subscription id>, <filter>...]`
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <subscription id>]`
    Close(SubscriptionId),
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        Self::Event(Box::new(event))
    }

    pub fn req(subscription_id: SubscriptionId, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id,
            filters,
        }
    }

    pub fn close(subscription_id: SubscriptionId) -> Self {
        Self::Close(subscription_id)
    }

    pub fn as_value(&self) -> Result<Value> {
        let frame = match self {
            Self::Event(event) => {
                vec![Value::from("EVENT"), serde_json::to_value(event.as_ref())?]
            }
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                frame
            }
            Self::Close(subscription_id) => {
                vec![Value::from("CLOSE"), Value::from(subscription_id.as_str())]
            }
        };
        Ok(Value::Array(frame))
    }

    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.as_value()?)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let (label, rest) = split_frame(&value)?;

        match label {
            "EVENT" => {
                let event = rest
                    .first()
                    .ok_or_else(|| CoreError::invalid_frame("EVENT frame without event"))?;
                Ok(Self::event(serde_json::from_value(event.clone())?))
            }
            "REQ" => {
                let subscription_id = string_at(rest, 0, "REQ subscription id")?;
                let filters = rest[1..]
                    .iter()
                    .map(|filter| serde_json::from_value(filter.clone()))
                    .collect::<core::result::Result<Vec<Filter>, _>>()?;
                Ok(Self::req(SubscriptionId::new(subscription_id), filters))
            }
            "CLOSE" => {
                let subscription_id = string_at(rest, 0, "CLOSE subscription id")?;
                Ok(Self::close(SubscriptionId::new(subscription_id)))
            }
            other => Err(CoreError::invalid_frame(format!(
                "unknown client frame type {other:?}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Frames
// ----------------------------------------------------------------------------

/// Frames sent from relay to client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription id>, <event>]`
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <subscription id>]`
    EndOfStoredEvents(SubscriptionId),
    /// `["CLOSED", <subscription id>, <message>]`
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice(String),
}

impl RelayMessage {
    pub fn event(subscription_id: SubscriptionId, event: Event) -> Self {
        Self::Event {
            subscription_id,
            event: Box::new(event),
        }
    }

    pub fn ok<S: Into<String>>(event_id: &str, accepted: bool, message: S) -> Self {
        Self::Ok {
            event_id: event_id.to_string(),
            accepted,
            message: message.into(),
        }
    }

    pub fn eose(subscription_id: SubscriptionId) -> Self {
        Self::EndOfStoredEvents(subscription_id)
    }

    pub fn closed<S: Into<String>>(subscription_id: SubscriptionId, message: S) -> Self {
        Self::Closed {
            subscription_id,
            message: message.into(),
        }
    }

    pub fn notice<S: Into<String>>(message: S) -> Self {
        Self::Notice(message.into())
    }

    pub fn as_value(&self) -> Result<Value> {
        let frame = match self {
            Self::Event {
                subscription_id,
                event,
            } => vec![
                Value::from("EVENT"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(event.as_ref())?,
            ],
            Self::Ok {
                event_id,
                accepted,
                message,
            } => vec![
                Value::from("OK"),
                Value::from(event_id.as_str()),
                Value::from(*accepted),
                Value::from(message.as_str()),
            ],
            Self::EndOfStoredEvents(subscription_id) => {
                vec![Value::from("EOSE"), Value::from(subscription_id.as_str())]
            }
            Self::Closed {
                subscription_id,
                message,
            } => vec![
                Value::from("CLOSED"),
                Value::from(subscription_id.as_str()),
                Value::from(message.as_str()),
            ],
            Self::Notice(message) => vec![Value::from("NOTICE"), Value::from(message.as_str())],
        };
        Ok(Value::Array(frame))
    }

    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.as_value()?)?)
    }

    /// Parse a relay frame.
    ///
    /// Unknown frame types and malformed frames are errors; callers count them
    /// as protocol violations.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let (label, rest) = split_frame(&value)?;

        match label {
            "EVENT" => {
                let subscription_id = string_at(rest, 0, "EVENT subscription id")?;
                let event = rest
                    .get(1)
                    .ok_or_else(|| CoreError::invalid_frame("EVENT frame without event"))?;
                Ok(Self::event(
                    SubscriptionId::new(subscription_id),
                    serde_json::from_value(event.clone())?,
                ))
            }
            "OK" => {
                let event_id = string_at(rest, 0, "OK event id")?;
                let accepted = rest
                    .get(1)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| CoreError::invalid_frame("OK frame without accepted flag"))?;
                // Some relays omit the message on success
                let message = rest.get(2).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::ok(event_id, accepted, message))
            }
            "EOSE" => {
                let subscription_id = string_at(rest, 0, "EOSE subscription id")?;
                Ok(Self::eose(SubscriptionId::new(subscription_id)))
            }
            "CLOSED" => {
                let subscription_id = string_at(rest, 0, "CLOSED subscription id")?;
                let message = rest.get(1).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::closed(SubscriptionId::new(subscription_id), message))
            }
            "NOTICE" => {
                let message = string_at(rest, 0, "NOTICE message")?;
                Ok(Self::notice(message))
            }
            other => Err(CoreError::invalid_frame(format!(
                "unknown relay frame type {other:?}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn split_frame(value: &Value) -> Result<(&str, &[Value])> {
    let array = value
        .as_array()
        .ok_or_else(|| CoreError::invalid_frame("frame is not a JSON array"))?;
    let (label, rest) = array
        .split_first()
        .ok_or_else(|| CoreError::invalid_frame("empty frame"))?;
    let label = label
        .as_str()
        .ok_or_else(|| CoreError::invalid_frame("frame type is not a string"))?;
    Ok((label, rest))
}

fn string_at<'a>(values: &'a [Value], index: usize, what: &str) -> Result<&'a str> {
    values
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::invalid_frame(format!("missing {what}")))
}
