// src/utils/polyline.rs
//
// Encoded polyline format used by the Directions API: each coordinate is a
// pair of zigzag-encoded deltas from the previous point, at 1e-5 precision,
// written as 5-bit groups offset by 63 with 0x20 as the continuation bit.

use crate::errors::DispatchError;
use crate::models::ride::Coordinate;

const PRECISION: f64 = 1e5;
const CHAR_OFFSET: i64 = 63;
const CONTINUATION_BIT: i64 = 0x20;
const GROUP_MASK: i64 = 0x1f;
// 13 groups already exceed 64 bits
const MAX_SHIFT: u32 = 60;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolylineError {
    #[error("invalid character {character:?} at offset {offset}")]
    InvalidCharacter { character: char, offset: usize },

    #[error("input ends in the middle of a value at offset {0}")]
    Truncated(usize),

    #[error("value starting at offset {0} overflows")]
    Overflow(usize),

    #[error("point starting at offset {0} is not a valid coordinate")]
    OutOfRange(usize),
}

impl From<PolylineError> for DispatchError {
    fn from(err: PolylineError) -> Self {
        DispatchError::InvalidPolyline(err.to_string())
    }
}

pub fn decode_polyline(encoded: &str) -> Result<Vec<Coordinate>, PolylineError> {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;
    let mut points = Vec::new();

    while index < bytes.len() {
        let start = index;
        lat = accumulate(lat, bytes, &mut index)?;
        if index >= bytes.len() {
            // A latitude without its longitude
            return Err(PolylineError::Truncated(index));
        }
        lng = accumulate(lng, bytes, &mut index)?;

        let point = Coordinate::new(lat as f64 / PRECISION, lng as f64 / PRECISION);
        if !point.is_valid() {
            return Err(PolylineError::OutOfRange(start));
        }
        points.push(point);
    }

    Ok(points)
}

fn accumulate(total: i64, bytes: &[u8], index: &mut usize) -> Result<i64, PolylineError> {
    let start = *index;
    let delta = next_value(bytes, index)?;
    total.checked_add(delta).ok_or(PolylineError::Overflow(start))
}

fn next_value(bytes: &[u8], index: &mut usize) -> Result<i64, PolylineError> {
    let start = *index;
    let mut result: i64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = *bytes.get(*index).ok_or(PolylineError::Truncated(*index))?;
        if !(63..=126).contains(&byte) {
            return Err(PolylineError::InvalidCharacter {
                character: byte as char,
                offset: *index,
            });
        }
        *index += 1;

        let chunk = byte as i64 - CHAR_OFFSET;
        result |= (chunk & GROUP_MASK) << shift;
        shift += 5;

        if chunk < CONTINUATION_BIT {
            break;
        }
        if shift > MAX_SHIFT {
            return Err(PolylineError::Overflow(start));
        }
    }

    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

pub fn encode_polyline(coordinates: &[Coordinate]) -> String {
    let mut encoded = String::new();
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for coordinate in coordinates {
        let lat = (coordinate.latitude * PRECISION).round() as i64;
        let lng = (coordinate.longitude * PRECISION).round() as i64;

        encode_value(lat - prev_lat, &mut encoded);
        encode_value(lng - prev_lng, &mut encoded);

        prev_lat = lat;
        prev_lng = lng;
    }

    encoded
}

fn encode_value(delta: i64, out: &mut String) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };

    while value >= CONTINUATION_BIT {
        out.push(((CONTINUATION_BIT | (value & GROUP_MASK)) + CHAR_OFFSET) as u8 as char);
        value >>= 5;
    }
    out.push((value + CHAR_OFFSET) as u8 as char);
}
