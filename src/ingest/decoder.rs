use thiserror::Error;

use crate::db::models::Reading;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("metric doesn't follow slash format: {topic}")]
    MalformedTopic { topic: String },

    #[error("metric has {found} segments instead of 4: {topic}")]
    WrongSegmentCount { topic: String, found: usize },

    #[error("metric segment {index} is empty: {topic}")]
    EmptySegment { topic: String, index: usize },

    #[error("unable to convert payload to a finite float: {payload:?}")]
    InvalidNumber { payload: String },
}

/// Decode a topic and its payload into a [`Reading`].
///
/// The topic must be `<location>/<room>/<sensor>/<measurement>`: exactly four
/// non-empty segments, bound positionally.
/// The payload must be UTF-8 text holding a finite decimal number; `NaN`
/// and infinities are rejected.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Reading, DecodeError> {
    if !topic.contains('/') {
        return Err(DecodeError::MalformedTopic {
            topic: topic.to_owned(),
        });
    }

    let segments: Vec<&str> = topic.split('/').collect();
    let &[location, room, sensor, measurement] = segments.as_slice() else {
        return Err(DecodeError::WrongSegmentCount {
            topic: topic.to_owned(),
            found: segments.len(),
        });
    };

    if let Some(index) = segments.iter().position(|s| s.is_empty()) {
        return Err(DecodeError::EmptySegment {
            topic: topic.to_owned(),
            index,
        });
    }

    let value = parse_value(payload)?;

    Ok(Reading {
        location: location.to_owned(),
        room: room.to_owned(),
        sensor: sensor.to_owned(),
        measurement: measurement.to_owned(),
        value,
    })
}

fn parse_value(payload: &[u8]) -> Result<f64, DecodeError> {
    let invalid = || DecodeError::InvalidNumber {
        payload: String::from_utf8_lossy(payload).into_owned(),
    };

    let text = std::str::from_utf8(payload).map_err(|_| invalid())?;
    let value: f64 = text.parse().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value)
}
