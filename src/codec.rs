//! Transport encoding for frames crossing a process or network boundary.
//!
//! Wire form: `{"shape": [h, w, c], "data": "<base64>"}`. An `"order"` field
//! is added only when the channel order is not the default for the channel
//! count (e.g. BGR), so payloads from producers that know nothing about it
//! still decode.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, FrameError};
use crate::frame::{ChannelOrder, Frame, Shape};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFrame {
    pub shape: [u32; 3],
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<ChannelOrder>,
}

pub fn encode(frame: &Frame) -> EncodedFrame {
    let shape = frame.shape();
    let order = frame.order();
    EncodedFrame {
        shape: shape.as_array(),
        data: STANDARD.encode(frame.as_bytes()),
        order: (ChannelOrder::default_for(shape.channels) != Some(order)).then_some(order),
    }
}

pub fn decode(encoded: &EncodedFrame) -> Result<Frame, DecodeError> {
    let [height, width, channels] = encoded.shape;
    let channels = u8::try_from(channels)
        .ok()
        .filter(|c| (1..=4).contains(c))
        .ok_or(FrameError::UnsupportedChannels(channels.min(u8::MAX as u32) as u8))?;
    let shape = Shape::new(height, width, channels);
    let expected = shape.byte_len().ok_or(FrameError::InvalidShape(shape))?;

    let bytes = STANDARD.decode(encoded.data.as_bytes())?;
    if bytes.len() != expected {
        return Err(DecodeError::LengthMismatch {
            shape,
            expected,
            actual: bytes.len(),
        });
    }

    let order = match encoded.order {
        Some(order) => order,
        None => ChannelOrder::default_for(channels).ok_or(FrameError::UnsupportedChannels(channels))?,
    };
    Ok(Frame::new(shape, order, bytes)?)
}
