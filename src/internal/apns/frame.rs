/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The APNS binary wire format.
//!
//! Sends use the v2 framed layout: `command=2 | frameLen:u32` followed by
//! five items, each `itemId:u8 | itemLen:u16 | bytes`, always in the order
//! device token, payload, notification id, expiry, priority. The gateway
//! only ever reads one thing back: the 6-byte error frame
//! `command=8 | status:u8 | id:u32`, after which the vendor closes the
//! socket.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PushError, Result};
use crate::internal::registration::{DeliveryPoint, Notification, PushServiceProvider};

pub const SEND_COMMAND: u8 = 2;
pub const ERROR_COMMAND: u8 = 8;
pub const ERROR_FRAME_LEN: usize = 6;

/// No item may exceed this many bytes; the payload cap doubles as the
/// vendor's notification size limit.
pub const MAX_ITEM_LEN: usize = 2048;

const ITEM_DEVICE_TOKEN: u8 = 1;
const ITEM_PAYLOAD: u8 = 2;
const ITEM_NOTIFICATION_ID: u8 = 3;
const ITEM_EXPIRY: u8 = 4;
const ITEM_PRIORITY: u8 = 5;

const PRIORITY_IMMEDIATE: u8 = 10;

pub fn encode_notification(
    token: &[u8],
    payload: &[u8],
    id: u32,
    expiry: u32,
) -> Result<Vec<u8>> {
    if payload.len() > MAX_ITEM_LEN {
        return Err(PushError::NotificationTooBig { limit: MAX_ITEM_LEN });
    }
    if token.len() > MAX_ITEM_LEN {
        return Err(PushError::Connection(format!(
            "device token of {} bytes exceeds the frame item limit",
            token.len()
        )));
    }
    // itemId + itemLen for each of the five items, plus the item bytes.
    let frame_len = (3 + token.len()) + (3 + payload.len()) + (3 + 4) + (3 + 4) + (3 + 1);
    let mut frame = Vec::with_capacity(5 + frame_len);
    frame.write_u8(SEND_COMMAND)?;
    frame.write_u32::<BigEndian>(frame_len as u32)?;

    frame.write_u8(ITEM_DEVICE_TOKEN)?;
    frame.write_u16::<BigEndian>(token.len() as u16)?;
    frame.extend_from_slice(token);

    frame.write_u8(ITEM_PAYLOAD)?;
    frame.write_u16::<BigEndian>(payload.len() as u16)?;
    frame.extend_from_slice(payload);

    frame.write_u8(ITEM_NOTIFICATION_ID)?;
    frame.write_u16::<BigEndian>(4)?;
    frame.write_u32::<BigEndian>(id)?;

    frame.write_u8(ITEM_EXPIRY)?;
    frame.write_u16::<BigEndian>(4)?;
    frame.write_u32::<BigEndian>(expiry)?;

    frame.write_u8(ITEM_PRIORITY)?;
    frame.write_u16::<BigEndian>(1)?;
    frame.write_u8(PRIORITY_IMMEDIATE)?;

    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFrame {
    pub status: u8,
    pub id: u32,
}

pub fn decode_error_frame(buf: &[u8; ERROR_FRAME_LEN]) -> Result<ErrorFrame> {
    let mut reader = &buf[..];
    let command = reader.read_u8()?;
    if command != ERROR_COMMAND {
        return Err(PushError::Connection(format!(
            "unexpected command {} in vendor response frame",
            command
        )));
    }
    let status = reader.read_u8()?;
    let id = reader.read_u32::<BigEndian>()?;
    Ok(ErrorFrame { status, id })
}

/// Maps a vendor status code onto the shared vocabulary. `None` means the
/// frame reports no error (clean teardown).
pub fn status_to_error(
    status: u8,
    provider: &PushServiceProvider,
    destination: &DeliveryPoint,
    content: &Notification,
) -> Option<PushError> {
    match status {
        0 => None,
        8 => Some(PushError::Unregistered {
            provider: provider.clone(),
            destination: destination.clone(),
        }),
        7 => Some(PushError::NotificationTooBig { limit: MAX_ITEM_LEN }),
        2 | 5 => Some(PushError::InvalidDeliveryPoint {
            provider: provider.clone(),
            destination: destination.clone(),
            reason: status_description(status).to_string(),
        }),
        3 | 6 => Some(PushError::InvalidProvider {
            provider: provider.clone(),
            reason: status_description(status).to_string(),
        }),
        10 => Some(PushError::Retry {
            provider: provider.clone(),
            destination: destination.clone(),
            content: content.clone(),
            after: None,
        }),
        other => Some(PushError::Connection(format!(
            "apns error status {}: {}",
            other,
            status_description(other)
        ))),
    }
}

pub fn status_description(status: u8) -> &'static str {
    match status {
        0 => "no errors encountered",
        1 => "processing error",
        2 => "missing device token",
        3 => "missing topic",
        4 => "missing payload",
        5 => "invalid token size",
        6 => "invalid topic size",
        7 => "invalid payload size",
        8 => "invalid token",
        10 => "shutdown",
        _ => "unknown",
    }
}

/// Builds the JSON payload: `msg` becomes the alert, `sound` and a numeric
/// `badge` land under `aps`, and every other submitter key is copied through
/// as a top-level custom field.
pub fn notification_payload(content: &Notification) -> Result<Vec<u8>> {
    let mut aps = serde_json::Map::new();
    if let Some(msg) = content.data.get("msg") {
        aps.insert("alert".to_string(), serde_json::Value::from(msg.as_str()));
    }
    if let Some(sound) = content.data.get("sound") {
        aps.insert("sound".to_string(), serde_json::Value::from(sound.as_str()));
    }
    if let Some(badge) = content.data.get("badge") {
        if let Ok(badge) = badge.parse::<i64>() {
            aps.insert("badge".to_string(), serde_json::Value::from(badge));
        }
    }
    let mut root = serde_json::Map::new();
    root.insert("aps".to_string(), serde_json::Value::Object(aps));
    for (k, v) in &content.data {
        match k.as_str() {
            "msg" | "sound" | "badge" | "ttl" | "id" => {}
            custom => {
                root.insert(custom.to_string(), serde_json::Value::from(v.as_str()));
            }
        }
    }
    Ok(serde_json::to_vec(&serde_json::Value::Object(root))?)
}

/// A command-2 frame as parsed back by the test server; the real vendor never
/// echoes sends, so this only exists for tests.
#[cfg(test)]
pub(crate) struct SentNotification {
    pub token: Vec<u8>,
    pub payload: Vec<u8>,
    pub id: u32,
    pub expiry: u32,
    pub priority: u8,
}

#[cfg(test)]
pub(crate) fn read_notification(
    reader: &mut impl std::io::Read,
) -> std::io::Result<SentNotification> {
    use std::io::{Error, ErrorKind};

    let command = reader.read_u8()?;
    if command != SEND_COMMAND {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("unknown command {} in request frame", command),
        ));
    }
    let frame_len = reader.read_u32::<BigEndian>()? as usize;
    let mut remaining = frame_len;
    let mut read_item = |expected_id: u8, expected_len: u16| -> std::io::Result<Vec<u8>> {
        let item_id = reader.read_u8()?;
        if item_id != expected_id {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("expected item id {}, got {}", expected_id, item_id),
            ));
        }
        let item_len = reader.read_u16::<BigEndian>()?;
        if item_len as usize > MAX_ITEM_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("item {} length {} exceeds the cap", item_id, item_len),
            ));
        }
        if expected_len > 0 && item_len != expected_len {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "expected item {} length {}, got {}",
                    item_id, expected_len, item_len
                ),
            ));
        }
        if remaining < 3 + item_len as usize {
            return Err(Error::new(ErrorKind::InvalidData, "frame length overrun"));
        }
        remaining -= 3 + item_len as usize;
        let mut bytes = vec![0u8; item_len as usize];
        reader.read_exact(&mut bytes)?;
        Ok(bytes)
    };

    let token = read_item(ITEM_DEVICE_TOKEN, 0)?;
    let payload = read_item(ITEM_PAYLOAD, 0)?;
    if payload.len() < 2 {
        return Err(Error::new(ErrorKind::InvalidData, "payload is too short"));
    }
    let id_bytes = read_item(ITEM_NOTIFICATION_ID, 4)?;
    let expiry_bytes = read_item(ITEM_EXPIRY, 4)?;
    let priority_bytes = read_item(ITEM_PRIORITY, 1)?;
    Ok(SentNotification {
        token,
        payload,
        id: u32::from_be_bytes(id_bytes.try_into().unwrap()),
        expiry: u32::from_be_bytes(expiry_bytes.try_into().unwrap()),
        priority: priority_bytes[0],
    })
}

#[cfg(test)]
pub(crate) fn encode_error_frame(status: u8, id: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ERROR_FRAME_LEN);
    frame.push(ERROR_COMMAND);
    frame.push(status);
    frame.extend_from_slice(&id.to_be_bytes());
    frame
}
