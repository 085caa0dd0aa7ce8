//! Editor access over Neovim's msgpack-RPC API
//!
//! Requests are `[0, msgid, method, params]` and responses
//! `[1, msgid, error, result]`. Neovim may interleave notifications
//! (`[2, method, params]`), which are skipped while waiting for a response.
//!
//! Replies are read as whole msgpack values first, so a buffer holding bytes
//! that aren't UTF-8 comes back lossily decoded instead of leaving half a
//! message on the socket.

use std::io::{BufReader, Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

const REQUEST: u8 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("editor connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode response: {0}")]
    Decode(#[from] rmpv::decode::Error),
    #[error("{0}")]
    Rpc(String),
    #[error("unexpected rpc message: {0}")]
    Protocol(String),
}

/// What the dispatcher needs from an editor
pub trait Editor {
    /// All lines of the current buffer
    fn buffer_lines(&mut self) -> Result<Vec<String>, EditorError>;
    /// (1-based row, 0-based column) of the cursor in the current window
    fn cursor(&mut self) -> Result<(i64, i64), EditorError>;
    /// Run an Ex command
    fn command(&mut self, cmd: &str) -> Result<(), EditorError>;
}

impl<T: Editor + ?Sized> Editor for &mut T {
    fn buffer_lines(&mut self) -> Result<Vec<String>, EditorError> {
        (**self).buffer_lines()
    }

    fn cursor(&mut self) -> Result<(i64, i64), EditorError> {
        (**self).cursor()
    }

    fn command(&mut self, cmd: &str) -> Result<(), EditorError> {
        (**self).command(cmd)
    }
}

pub struct Nvim<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: W,
    next_id: u32,
}

#[cfg(unix)]
impl Nvim<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream> {
    /// Attach to a running `nvim --listen <path>`
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, EditorError> {
        let stream = std::os::unix::net::UnixStream::connect(path.as_ref())?;
        let reader = stream.try_clone()?;
        debug!(socket = %path.as_ref().display(), "connected to nvim");
        Ok(Self::new(reader, stream))
    }
}

impl<R: Read, W: Write> Nvim<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 0,
        }
    }

    /// Call `method` and wait for its result
    pub fn call<P: Serialize>(&mut self, method: &str, params: P) -> Result<Value, EditorError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let payload = rmp_serde::to_vec(&(REQUEST, id, method, params))?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        trace!(id, method, "rpc request");

        loop {
            let message = to_json(rmpv::decode::read_value(&mut self.reader)?);
            let Some(parts) = message.as_array() else {
                return Err(EditorError::Protocol(message.to_string()));
            };
            match parts.first().and_then(Value::as_u64) {
                Some(RESPONSE) if parts.len() == 4 => {
                    if parts[1].as_u64() != Some(u64::from(id)) {
                        warn!(expected = id, got = %parts[1], "dropping stale rpc response");
                        continue;
                    }
                    if !parts[2].is_null() {
                        return Err(EditorError::Rpc(error_message(&parts[2])));
                    }
                    return Ok(parts[3].clone());
                }
                Some(NOTIFICATION) => {
                    let event = parts.get(1).cloned().unwrap_or_default();
                    trace!(event = %event, "skipping notification");
                }
                _ => return Err(EditorError::Protocol(message.to_string())),
            }
        }
    }

    fn call_as<P: Serialize, T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<T, EditorError> {
        let value = self.call(method, params)?;
        serde_json::from_value(value.clone())
            .map_err(|_| EditorError::Protocol(format!("{method} returned {value}")))
    }
}

/// Msgpack to JSON, decoding strings lossily
fn to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => i
            .as_i64()
            .map(Value::from)
            .or_else(|| i.as_u64().map(Value::from))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(f) => Value::from(f64::from(f)),
        rmpv::Value::F64(f) => Value::from(f),
        rmpv::Value::String(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        rmpv::Value::Binary(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        rmpv::Value::Map(pairs) => Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    let key = match to_json(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, to_json(v))
                })
                .collect(),
        ),
        // Buffer/Window/Tabpage handles wrap a msgpack-encoded id
        rmpv::Value::Ext(_, data) => rmpv::decode::read_value(&mut data.as_slice())
            .map(to_json)
            .unwrap_or(Value::Null),
    }
}

/// Neovim errors arrive as `[type, message]`
fn error_message(err: &Value) -> String {
    err.as_array()
        .and_then(|a| a.get(1))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

impl<R: Read, W: Write> Editor for Nvim<R, W> {
    fn buffer_lines(&mut self) -> Result<Vec<String>, EditorError> {
        // buffer 0 is the current buffer
        self.call_as("nvim_buf_get_lines", (0, 0, -1, false))
    }

    fn cursor(&mut self) -> Result<(i64, i64), EditorError> {
        self.call_as("nvim_win_get_cursor", (0,))
    }

    fn command(&mut self, cmd: &str) -> Result<(), EditorError> {
        self.call("nvim_command", (cmd,)).map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    type Reply = Box<dyn FnOnce(&str, u64) -> Vec<Vec<u8>> + Send>;

    fn reply(f: impl FnOnce(&str, u64) -> Vec<Vec<u8>> + Send + 'static) -> Reply {
        Box::new(f)
    }

    /// Answer each request with the next scripted reply
    fn fake_nvim(replies: Vec<Reply>) -> (Nvim<UnixStream, UnixStream>, thread::JoinHandle<Vec<Value>>) {
        let (client, mut server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for reply in replies {
                let req: Value = rmp_serde::from_read(&mut server).unwrap();
                let id = req[1].as_u64().unwrap();
                let method = req[2].as_str().unwrap().to_string();
                for chunk in reply(&method, id) {
                    server.write_all(&chunk).unwrap();
                }
                seen.push(req);
            }
            seen
        });
        let reader = client.try_clone().unwrap();
        (Nvim::new(reader, client), handle)
    }

    #[test]
    fn test_buffer_lines_roundtrip() {
        let (mut nvim, handle) = fake_nvim(vec![reply(|method, id| {
            assert_eq!(method, "nvim_buf_get_lines");
            vec![rmp_serde::to_vec(&(1u8, id, (), vec!["fn main() {", "}"])).unwrap()]
        })]);
        let lines = nvim.buffer_lines().unwrap();
        assert_eq!(lines, vec!["fn main() {", "}"]);

        let seen = handle.join().unwrap();
        assert_eq!(seen[0][0], 0);
        assert_eq!(seen[0][3], serde_json::json!([0, 0, -1, false]));
    }

    #[test]
    fn test_notifications_are_skipped() {
        let (mut nvim, handle) = fake_nvim(vec![reply(|_, id| {
            vec![
                rmp_serde::to_vec(&(2u8, "redraw", vec![1])).unwrap(),
                rmp_serde::to_vec(&(1u8, id, (), (12, 4))).unwrap(),
            ]
        })]);
        assert_eq!(nvim.cursor().unwrap(), (12, 4));
        handle.join().unwrap();
    }

    #[test]
    fn test_rpc_error_surfaces_message() {
        let (mut nvim, handle) = fake_nvim(vec![
            reply(|method, id| {
                assert_eq!(method, "nvim_command");
                vec![
                    rmp_serde::to_vec(&(1u8, id, (0, "Vim:E492: Not an editor command: frob"), ()))
                        .unwrap(),
                ]
            }),
            reply(|_, id| vec![rmp_serde::to_vec(&(1u8, id, (), ())).unwrap()]),
        ]);
        match nvim.command("frob") {
            Err(EditorError::Rpc(msg)) => assert!(msg.contains("E492")),
            other => panic!("expected rpc error, got {other:?}"),
        }
        nvim.command("write").unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(seen[0][3], serde_json::json!(["frob"]));
        // ids increase per call
        assert_eq!(seen[1][1], 1);
    }

    #[test]
    fn test_non_utf8_line_is_decoded_lossily() {
        let (mut nvim, handle) = fake_nvim(vec![
            reply(|_, id| {
                // [1, id, nil, ["caf\xe9"]] with a Latin-1 byte in the string
                vec![vec![
                    0x94, 0x01, id as u8, 0xc0, 0x91, 0xa4, b'c', b'a', b'f', 0xe9,
                ]]
            }),
            reply(|_, id| vec![rmp_serde::to_vec(&(1u8, id, (), (3, 1))).unwrap()]),
        ]);
        assert_eq!(nvim.buffer_lines().unwrap(), vec!["caf\u{FFFD}"]);
        // the whole reply was consumed, so the next call stays in sync
        assert_eq!(nvim.cursor().unwrap(), (3, 1));
        handle.join().unwrap();
    }

    #[test]
    fn test_ext_handles_become_ids() {
        let handle = rmpv::Value::Ext(0, vec![0x05]);
        assert_eq!(to_json(handle), serde_json::json!(5));
        let map = rmpv::Value::Map(vec![(rmpv::Value::from("id"), rmpv::Value::from(7))]);
        assert_eq!(to_json(map), serde_json::json!({"id": 7}));
    }

    #[test]
    fn test_closed_socket_is_decode_error() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let reader = client.try_clone().unwrap();
        let mut nvim = Nvim::new(reader, client);
        assert!(nvim.cursor().is_err());
    }
}
