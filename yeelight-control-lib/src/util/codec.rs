//! Wire formats: the SSDP-style discovery text and the line-delimited JSON
//! command protocol.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use bytes::{Bytes, BytesMut};
use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::control_interface::command::{Command, CommandResult, DeviceError};
use crate::error::{Error, Result};
use crate::util::device::{Device, PowerStatus};

/// Status line every advertisement starts with.
pub const ADVERTISEMENT_STATUS: &str = "HTTP/1.1 200 OK";

/// Scheme of the `Location` header in advertisements.
pub const LOCATION_SCHEME: &str = "yeelight://";

const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Longest line the command socket accepts; longer ones are discarded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// The M-SEARCH probe addressed to the multicast group `target`.
pub fn probe_message(target: SocketAddrV4) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {}\r\nMAN: \"ssdp:discover\"\r\nST: wifi_bulb\r\n",
        target
    )
}

/// Serializes a command to one `\r\n` terminated JSON line.
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(command)?;
    frame.extend_from_slice(LINE_TERMINATOR);
    Ok(frame)
}

/// Any JSON object the device sends on the command socket.
///
/// Responses carry an `id`; property pushes carry `method` and `params`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Vec<Value>>,
    #[serde(default)]
    pub error: Option<DeviceError>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl ResponseFrame {
    /// The correlated part of the frame, if it has an id.
    pub fn command_result(&self) -> Option<CommandResult> {
        self.id.map(|id| CommandResult {
            id,
            result: self.result.clone(),
            error: self.error.clone(),
        })
    }
}

pub fn decode_frame(line: &[u8]) -> Result<ResponseFrame> {
    Ok(serde_json::from_slice(line)?)
}

/// Accumulates socket reads and hands out complete lines.
///
/// A read may hold zero, one or several frames, or end in the middle of one.
/// An unterminated remainder that is already a complete JSON value is
/// released as well, since some peers omit the trailing `\r\n`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_line(&mut self) -> Option<Bytes> {
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline + 1).freeze();
            if newline > MAX_LINE_LENGTH {
                warn!("Dropping {} byte line over the length limit", newline);
                continue;
            }
            let trimmed = line.slice(..trim_end(&line));
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            warn!(
                "Dropping {} unterminated bytes over the length limit",
                self.buffer.len()
            );
            self.buffer.clear();
            return None;
        }

        // Frames are JSON objects.
        let end = trim_end(&self.buffer);
        if end > 0
            && self.buffer[end - 1] == b'}'
            && serde_json::from_slice::<Value>(&self.buffer[..end]).is_ok()
        {
            let line = self.buffer.split().freeze();
            return Some(line.slice(..end));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn trim_end(data: &[u8]) -> usize {
    data.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |last| last + 1)
}

/// Parses a discovery reply into a [`Device`].
///
/// Returns `None` unless the text has both the success status line and a
/// `yeelight://` location, and also when any field fails to parse.
/// Missing numeric fields become 0 and missing strings become empty.
pub fn parse_advertisement(message: &str) -> Option<Device> {
    if !message.contains(ADVERTISEMENT_STATUS) || !message.contains(LOCATION_SCHEME) {
        return None;
    }
    let fields = header_fields(message);
    let text = |key: &str| fields.get(key).copied().unwrap_or("").to_string();

    let location = text("Location");
    let authority = location.strip_prefix(LOCATION_SCHEME)?;
    let authority = authority.split('/').next()?;
    let (host, port) = authority.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;

    Some(Device {
        id: text("id"),
        name: text("name"),
        host: host.to_string(),
        port,
        model: text("model"),
        fw_version: text("fw_ver"),
        capabilities: text("support")
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        power: PowerStatus::parse(&text("power")),
        bright: number(&fields, "bright")?,
        color_mode: number(&fields, "color_mode")?,
        ct: number(&fields, "ct")?,
        rgb: number(&fields, "rgb")?,
        hue: number(&fields, "hue")?,
        sat: number(&fields, "sat")?,
        location,
    })
}

/// `key: value` lines of the message; the first occurrence of a key wins.
fn header_fields(message: &str) -> HashMap<&str, &str> {
    let mut fields = HashMap::new();
    for line in message.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.entry(key.trim()).or_insert_with(|| value.trim());
        }
    }
    fields
}

fn number<T>(fields: &HashMap<&str, &str>, key: &str) -> Option<T>
where
    T: std::str::FromStr + Default,
{
    match fields.get(key) {
        None => Some(T::default()),
        Some(value) if value.is_empty() => Some(T::default()),
        Some(value) => value.parse().ok(),
    }
}

/// Decodes a hex digit string, most significant digit first.
///
/// `"FFFFFF"` is 16777215 and `"1AC3EF"` is 1754095.
pub fn hex_to_number(hex_string: &str) -> Result<u32> {
    let digits = hex_string.trim();
    if digits.is_empty() || digits.len() > 8 {
        return Err(Error::InvalidHex(hex_string.to_string()));
    }
    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };
    let bytes = hex::decode(padded).map_err(|_| Error::InvalidHex(hex_string.to_string()))?;
    Ok(bytes
        .iter()
        .fold(0u32, |value, &byte| (value << 8) | byte as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_interface::command::Method;
    use serde_json::json;

    const ADVERTISEMENT: &str = "HTTP/1.1 200 OK\r\n\
Cache-Control: max-age=3584\r\n\
Date:\r\n\
Ext:\r\n\
Location: yeelight://192.168.0.42:55443\r\n\
Server: POSIX UPnP/1.0 YGLC/1\r\n\
id: 0x000000000af2608f\r\n\
model: color\r\n\
fw_ver: 26\r\n\
support: get_prop set_default set_power toggle set_bright start_cf stop_cf\r\n\
power: on\r\n\
bright: 1\r\n\
color_mode: 1\r\n\
ct: 2234\r\n\
rgb: 65280\r\n\
hue: 240\r\n\
sat: 100\r\n\
name: new_name\r\n";

    #[test]
    fn test_probe_message() {
        let target = "239.255.255.250:1982".parse().unwrap();
        assert_eq!(
            probe_message(target),
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1982\r\nMAN: \"ssdp:discover\"\r\nST: wifi_bulb\r\n"
        );
    }

    #[test]
    fn test_encode_command() {
        let mut command = Command::set_name("bulb1");
        command.id = Some(1);
        let frame = encode_command(&command).unwrap();
        assert!(frame.ends_with(b"\r\n"));
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(
            value,
            json!({"id": 1, "method": "set_name", "params": ["bulb1"]})
        );
    }

    #[test]
    fn test_parse_advertisement() {
        let device = parse_advertisement(ADVERTISEMENT).unwrap();
        assert_eq!(device.id, "0x000000000af2608f");
        assert_eq!(device.host, "192.168.0.42");
        assert_eq!(device.port, 55443);
        assert_eq!(device.location, "yeelight://192.168.0.42:55443");
        assert_eq!(device.model, "color");
        assert_eq!(device.fw_version, "26");
        assert_eq!(device.power, PowerStatus::On);
        assert_eq!(device.bright, 1);
        assert_eq!(device.color_mode, 1);
        assert_eq!(device.ct, 2234);
        assert_eq!(device.rgb, 65280);
        assert_eq!(device.hue, 240);
        assert_eq!(device.sat, 100);
        assert_eq!(device.name, "new_name");
        assert_eq!(device.capabilities.len(), 7);
        assert!(device.supports(Method::StartColorFlow));
    }

    #[test]
    fn test_parse_advertisement_host_and_port() {
        for (host, port) in [("10.0.0.7", 55443u16), ("192.168.1.254", 1), ("bulb.local", 65535)] {
            let message = format!(
                "HTTP/1.1 200 OK\r\nLocation: yeelight://{}:{}\r\nid: 0x1\r\n",
                host, port
            );
            let device = parse_advertisement(&message).unwrap();
            assert_eq!(device.host, host);
            assert_eq!(device.port, port);
        }
    }

    #[test]
    fn test_parse_advertisement_defaults() {
        let device =
            parse_advertisement("HTTP/1.1 200 OK\r\nLocation: yeelight://10.0.0.2:55443\r\n")
                .unwrap();
        assert_eq!(device.id, "");
        assert_eq!(device.model, "");
        assert!(device.capabilities.is_empty());
        assert_eq!(device.bright, 0);
        assert_eq!(device.rgb, 0);
        assert_eq!(device.power, PowerStatus::Unknown);
    }

    #[test]
    fn test_parse_advertisement_requires_markers() {
        let no_status = ADVERTISEMENT.replace("HTTP/1.1 200 OK", "HTTP/1.1 404 Not Found");
        assert!(parse_advertisement(&no_status).is_none());
        let no_scheme = ADVERTISEMENT.replace("yeelight://", "http://");
        assert!(parse_advertisement(&no_scheme).is_none());
        assert!(parse_advertisement("M-SEARCH * HTTP/1.1\r\nST: wifi_bulb\r\n").is_none());
        assert!(parse_advertisement("").is_none());
    }

    #[test]
    fn test_parse_advertisement_rejects_bad_fields() {
        let bad_port = ADVERTISEMENT.replace(":55443", ":notaport");
        assert!(parse_advertisement(&bad_port).is_none());
        let bad_bright = ADVERTISEMENT.replace("bright: 1", "bright: lots");
        assert!(parse_advertisement(&bad_bright).is_none());
        let no_port = ADVERTISEMENT.replace("192.168.0.42:55443", "192.168.0.42");
        assert!(parse_advertisement(&no_port).is_none());
    }

    #[test]
    fn test_decode_response_frames() {
        let ok = decode_frame(br#"{"id":1,"result":["ok"]}"#).unwrap();
        assert_eq!(
            ok.command_result().unwrap(),
            CommandResult {
                id: 1,
                result: Some(vec![json!("ok")]),
                error: None,
            }
        );

        let failed = decode_frame(br#"{"id":2,"error":{"code":-1,"message":"General error"}}"#)
            .unwrap()
            .command_result()
            .unwrap();
        assert_eq!(failed.error.unwrap().code, -1);
        assert!(failed.result.is_none());

        let push = decode_frame(br#"{"method":"props","params":{"power":"on"}}"#).unwrap();
        assert!(push.command_result().is_none());
        assert_eq!(push.method.as_deref(), Some("props"));
        assert_eq!(push.params, Some(json!({"power": "on"})));

        assert!(decode_frame(b"not json").is_err());
    }

    #[test]
    fn test_line_buffer_splits_frames() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"{\"id\":1,\"result\":[\"ok\"]}\r\n\r\n{\"id\":2,\"result\":[\"ok\"]}\r\n{\"id\":3,");
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":1,"result":["ok"]}"#
        );
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":2,"result":["ok"]}"#
        );
        assert!(buffer.next_line().is_none());

        buffer.extend(b"\"result\":[]}\r\n");
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":3,"result":[]}"#
        );
        assert!(buffer.next_line().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_buffer_accepts_unterminated_json() {
        let mut buffer = LineBuffer::new();
        buffer.extend(br#"{"id":1,"result":["ok"]}"#);
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":1,"result":["ok"]}"#
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_buffer_drops_over_long_lines() {
        let mut buffer = LineBuffer::new();
        let long = vec![b'x'; MAX_LINE_LENGTH + 1];
        buffer.extend(&long);
        buffer.extend(b"\r\n{\"id\":1,\"result\":[\"ok\"]}\r\n");
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":1,"result":["ok"]}"#
        );
        assert!(buffer.next_line().is_none());

        buffer.extend(&long);
        assert!(buffer.next_line().is_none());
        assert!(buffer.is_empty());

        buffer.extend(b"{\"id\":2,\"result\":[]}\r\n");
        assert_eq!(
            buffer.next_line().unwrap().as_ref(),
            br#"{"id":2,"result":[]}"#
        );
    }

    #[test]
    fn test_line_buffer_holds_unterminated_non_object() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"12");
        assert!(buffer.next_line().is_none());
        buffer.extend(b"3\n");
        assert_eq!(buffer.next_line().unwrap().as_ref(), b"123");
    }

    #[test]
    fn test_hex_to_number() {
        assert_eq!(hex_to_number("FFFFFF").unwrap(), 16777215);
        assert_eq!(hex_to_number("1AC3EF").unwrap(), 1754095);
        assert_eq!(hex_to_number("1ac3ef").unwrap(), 1754095);
        assert_eq!(hex_to_number("AA").unwrap(), 170);
        assert_eq!(hex_to_number("F").unwrap(), 15);
        assert_eq!(hex_to_number("000000").unwrap(), 0);
    }

    #[test]
    fn test_hex_to_number_round_trips_colors() {
        for value in [0u32, 1, 255, 256, 65535, 1754095, 8421504, 16777215] {
            assert_eq!(hex_to_number(&format!("{:06X}", value)).unwrap(), value);
        }
    }

    #[test]
    fn test_hex_to_number_rejects_garbage() {
        assert!(hex_to_number("").is_err());
        assert!(hex_to_number("XYZ").is_err());
        assert!(hex_to_number("123456789").is_err());
    }
}
