/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Framing used on the pipe between a caller and its namespace worker.
//!
//! The control message is a versioned attribute envelope:
//!
//! ```text
//! "NSJ1" | u32 body length | { u16 attr type | u32 attr length | attr bytes }*
//! ```
//!
//! Payload and result documents travel as length prefixed frames
//! (`u32 length | bytes`). All integers are big endian.

use std::{io::Cursor, os::unix::io::RawFd};

use anyhow::anyhow;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::utils::{read_count, write_all};

pub const MAGIC: &[u8; 4] = b"NSJ1";
pub const NS_PATHS_ATTR: u16 = 1;

const HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    attrs: Vec<(u16, Vec<u8>)>,
}

impl ControlMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ns_paths(ns_paths: &str) -> Self {
        let mut msg = Self::new();
        msg.add_attr(NS_PATHS_ATTR, ns_paths.as_bytes());
        msg
    }

    pub fn add_attr(&mut self, attr_type: u16, value: &[u8]) {
        self.attrs.push((attr_type, value.to_vec()));
    }

    pub fn attr(&self, attr_type: u16) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    /// `(kind, path)` pairs from the comma joined `kind:path` attribute.
    pub fn ns_paths(&self) -> anyhow::Result<Vec<(String, String)>> {
        let raw = match self.attr(NS_PATHS_ATTR) {
            Some(v) => String::from_utf8(v.to_vec())
                .map_err(|e| anyhow!("failed to decode namespace paths, {}", e))?,
            None => return Ok(vec![]),
        };
        let mut pairs = vec![];
        for item in raw.split(',').filter(|s| !s.is_empty()) {
            let (kind, path) = item
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid namespace path {}", item))?;
            pairs.push((kind.to_string(), path.to_string()));
        }
        Ok(pairs)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut body = vec![];
        for (t, v) in &self.attrs {
            body.write_u16::<BigEndian>(*t)?;
            body.write_u32::<BigEndian>(v.len() as u32)?;
            body.extend_from_slice(v);
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<BigEndian>(body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < HEADER_LEN || &buf[0..4] != MAGIC {
            return Err(anyhow!("invalid control message header"));
        }
        let mut cursor = Cursor::new(&buf[4..]);
        let body_len = cursor.read_u32::<BigEndian>()? as usize;
        let body = &buf[HEADER_LEN..];
        if body.len() != body_len {
            return Err(anyhow!(
                "control message truncated, expect {} bytes, got {}",
                body_len,
                body.len()
            ));
        }
        let mut msg = Self::new();
        let mut cursor = Cursor::new(body);
        while (cursor.position() as usize) < body.len() {
            let t = cursor.read_u16::<BigEndian>()?;
            let l = cursor.read_u32::<BigEndian>()? as usize;
            let start = cursor.position() as usize;
            if start + l > body.len() {
                return Err(anyhow!("control message attribute {} truncated", t));
            }
            msg.add_attr(t, &body[start..start + l]);
            cursor.set_position((start + l) as u64);
        }
        Ok(msg)
    }

    pub fn write_to(&self, fd: RawFd) -> anyhow::Result<()> {
        write_all(fd, &self.encode()?)
    }

    pub fn read_from(fd: RawFd) -> anyhow::Result<Self> {
        let header = read_count(fd, HEADER_LEN)?;
        if header.len() != HEADER_LEN || &header[0..4] != MAGIC {
            return Err(anyhow!("invalid control message header"));
        }
        let body_len = Cursor::new(&header[4..]).read_u32::<BigEndian>()?;
        if body_len > MAX_FRAME_LEN {
            return Err(anyhow!("control message too large: {}", body_len));
        }
        let body = read_count(fd, body_len as usize)?;
        let mut buf = header;
        buf.extend_from_slice(&body);
        Self::decode(&buf)
    }
}

pub fn write_frame(fd: RawFd, data: &[u8]) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.write_u32::<BigEndian>(data.len() as u32)?;
    buf.extend_from_slice(data);
    write_all(fd, &buf)
}

/// Reads one frame, `None` when the peer closed before sending anything.
pub fn read_frame(fd: RawFd) -> anyhow::Result<Option<Vec<u8>>> {
    let len = read_count(fd, 4)?;
    if len.is_empty() {
        return Ok(None);
    }
    if len.len() != 4 {
        return Err(anyhow!("frame header truncated"));
    }
    let len = Cursor::new(len).read_u32::<BigEndian>()?;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame too large: {}", len));
    }
    let data = read_count(fd, len as usize)?;
    if data.len() != len as usize {
        return Err(anyhow!(
            "frame truncated, expect {} bytes, got {}",
            len,
            data.len()
        ));
    }
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use nix::{
        sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
        unistd::close,
    };

    use super::{read_frame, write_frame, ControlMessage, NS_PATHS_ATTR};

    #[test]
    fn test_ns_paths_attribute() {
        let msg = ControlMessage::with_ns_paths("ipc:/proc/10/ns/ipc,mnt:/proc/10/ns/mnt");
        let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.ns_paths().unwrap(),
            vec![
                ("ipc".to_string(), "/proc/10/ns/ipc".to_string()),
                ("mnt".to_string(), "/proc/10/ns/mnt".to_string())
            ]
        );
    }

    #[test]
    fn test_unknown_attribute_is_kept_apart() {
        let mut msg = ControlMessage::new();
        msg.add_attr(42, b"future");
        msg.add_attr(NS_PATHS_ATTR, b"mnt:/proc/1/ns/mnt");
        let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.attr(42), Some(&b"future"[..]));
        assert_eq!(decoded.ns_paths().unwrap().len(), 1);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = ControlMessage::with_ns_paths("mnt:/x").encode().unwrap();
        buf[0] = b'X';
        assert!(ControlMessage::decode(&buf).is_err());
        let mut buf = ControlMessage::with_ns_paths("mnt:/x").encode().unwrap();
        buf.truncate(buf.len() - 1);
        assert!(ControlMessage::decode(&buf).is_err());
    }

    #[test]
    fn test_frames_over_socket() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        ControlMessage::with_ns_paths("mnt:/proc/1/ns/mnt")
            .write_to(a)
            .unwrap();
        write_frame(a, br#"{"Key":"k"}"#).unwrap();
        close(a).unwrap();

        let msg = ControlMessage::read_from(b).unwrap();
        assert_eq!(msg.ns_paths().unwrap()[0].0, "mnt");
        assert_eq!(read_frame(b).unwrap().unwrap(), br#"{"Key":"k"}"#.to_vec());
        assert!(read_frame(b).unwrap().is_none());
        close(b).unwrap();
    }
}
