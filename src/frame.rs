//! Length-prefixed controller packets received over serial.
//!
//! Wire layout: `[len] [0x40] [ch0 lo] [ch0 hi] ... [ch13 lo] [ch13 hi] [..]`
//! where `len` counts itself plus every following byte of the packet.

use crate::error::DeviceFault;
use crate::hardware::SerialDevice;

pub const CONTROLLER_HEADER: u8 = 0x40;
pub const CONTROLLER_CHANNELS: usize = 14;

const CONTROLLER_BODY_LEN: usize = 1 + CONTROLLER_CHANNELS * 2;

pub fn decode_controller_frame(body: &[u8]) -> Result<Vec<u16>, DeviceFault> {
    let Some((&header, payload)) = body.split_first() else {
        return Err(DeviceFault::Protocol("empty controller frame".into()));
    };
    if header != CONTROLLER_HEADER {
        return Err(DeviceFault::Protocol(format!(
            "unknown frame header {header:#04x}"
        )));
    }
    if body.len() < CONTROLLER_BODY_LEN {
        return Err(DeviceFault::Protocol(format!(
            "controller frame too short: {} bytes",
            body.len()
        )));
    }

    Ok(payload
        .chunks_exact(2)
        .take(CONTROLLER_CHANNELS)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn read_controller_frame(device: &mut dyn SerialDevice) -> Result<Vec<u16>, DeviceFault> {
    let mut len = [0u8; 1];
    device.read_exact_serial(&mut len)?;

    let len = usize::from(len[0]);
    if len < 2 {
        return Err(DeviceFault::Protocol(format!("invalid frame length {len}")));
    }

    // The length byte is gone from the stream, so a stall here has to be
    // reported as a broken packet rather than as an idle line.
    let mut body = vec![0u8; len - 1];
    device.read_exact_serial(&mut body).map_err(|e| match e {
        DeviceFault::TimedOut(detail) => {
            DeviceFault::Protocol(format!("truncated frame of {len} bytes: {detail}"))
        }
        e => e,
    })?;
    decode_controller_frame(&body)
}

/// Encodes channels into a full packet, length byte included.
pub fn encode_controller_frame(channels: &[u16; CONTROLLER_CHANNELS]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + CONTROLLER_BODY_LEN);
    packet.push((1 + CONTROLLER_BODY_LEN) as u8);
    packet.push(CONTROLLER_HEADER);
    for ch in channels {
        packet.extend_from_slice(&ch.to_le_bytes());
    }
    packet
}
