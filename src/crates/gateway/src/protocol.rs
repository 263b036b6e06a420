//! Gateway wire protocol.
//!
//! Every message is a 4-byte big-endian length followed by a JSON envelope.
//! The engine exposes one entry operation, [`Request::Run`], taking the
//! CLI-style invocation arguments and answering with rows, error strings and
//! an opaque engine output value.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{GatewayError, GatewayResult};

/// Largest frame either side is allowed to send.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub payload: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Invoke the engine's entry operation with CLI-style arguments.
    Run { args: Vec<String> },
    /// Ask an owned engine to exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub payload: Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Completed(RunOutcome),
    Failed { message: String },
    ShuttingDown,
}

/// Raw engine answer to a run request, before column normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    #[serde(default)]
    pub output: Vec<Vec<Value>>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub engine_output: Value,
}

/// Live channel to an engine instance.
///
/// Whether the gateway owns the engine behind it is decided by the gateway,
/// not by the connection.
///
/// A failed exchange can leave part of a frame on the wire, so any transport
/// error marks the connection broken and later calls fail with
/// [`GatewayError::ConnectionClosed`].
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    next_id: u64,
    broken: bool,
}

impl Connection {
    /// Connect to an engine listening at `addr`.
    pub fn connect(addr: impl ToSocketAddrs) -> GatewayResult<Self> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let mut last_error = None;
        for candidate in addrs {
            match TcpStream::connect(candidate) {
                Ok(stream) => return Self::from_stream(stream),
                Err(source) => {
                    last_error = Some(GatewayError::Connect {
                        addr: candidate,
                        source,
                    })
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::ConnectionClosed))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> GatewayResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        debug!(%peer, "engine connection established");
        Ok(Self {
            stream,
            peer,
            next_id: 1,
            broken: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether an earlier transport error made the stream unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Bound every later read and write on the stream; `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> GatewayResult<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Send one request and block until its response arrives.
    pub fn call(&mut self, request: Request) -> GatewayResult<Response> {
        if self.broken {
            return Err(GatewayError::ConnectionClosed);
        }
        let id = self.next_id;
        self.next_id += 1;

        let result = self.exchange(id, request);
        if let Err(err) = &result {
            if breaks_stream(err) {
                debug!(peer = %self.peer, error = %err, "engine connection unusable");
                self.broken = true;
            }
        }
        result
    }

    fn exchange(&mut self, id: u64, request: Request) -> GatewayResult<Response> {
        write_message(&mut self.stream, &RequestEnvelope { id, payload: request })?;
        let envelope: ResponseEnvelope = read_message(&mut self.stream)?;
        if envelope.id != id {
            return Err(GatewayError::unexpected(format!(
                "response id {} does not match request id {id}",
                envelope.id
            )));
        }
        Ok(envelope.payload)
    }

    /// Invoke the entry operation with `args`.
    ///
    /// Engine-side failures come back as [`GatewayError::Engine`] carrying the
    /// engine's message unchanged.
    pub fn run(&mut self, args: Vec<String>) -> GatewayResult<RunOutcome> {
        trace!(peer = %self.peer, ?args, "invoking engine");
        match self.call(Request::Run { args })? {
            Response::Completed(outcome) => Ok(outcome),
            Response::Failed { message } => Err(GatewayError::Engine(message)),
            other => Err(GatewayError::unexpected(format!(
                "run returned unexpected response: {other:?}"
            ))),
        }
    }

    /// Ask the engine to exit.
    pub fn shutdown_engine(&mut self) -> GatewayResult<()> {
        match self.call(Request::Shutdown)? {
            Response::ShuttingDown => Ok(()),
            other => Err(GatewayError::unexpected(format!(
                "shutdown returned unexpected response: {other:?}"
            ))),
        }
    }
}

fn breaks_stream(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Io(_)
            | GatewayError::ConnectionClosed
            | GatewayError::FrameTooLarge(_)
            | GatewayError::UnexpectedResponse(_)
    )
}

/// Serialize `message` and write it as one length-prefixed frame.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> GatewayResult<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(GatewayError::FrameTooLarge(payload.len()));
    }
    let len = u32::try_from(payload.len()).map_err(|_| GatewayError::FrameTooLarge(payload.len()))?;

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&payload);
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it.
///
/// A stream closed before the length prefix maps to
/// [`GatewayError::ConnectionClosed`].
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> GatewayResult<T> {
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf) {
        return Err(match err.kind() {
            std::io::ErrorKind::UnexpectedEof => GatewayError::ConnectionClosed,
            _ => GatewayError::Io(err),
        });
    }

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_LEN {
        return Err(GatewayError::FrameTooLarge(msg_len));
    }
    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf)?;
    Ok(serde_json::from_slice(&msg_buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn run_request_wire_shape() {
        let envelope = RequestEnvelope {
            id: 7,
            payload: Request::Run {
                args: vec!["-r /tmp/root".into(), "--name=smoke".into()],
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "payload": { "type": "run", "args": ["-r /tmp/root", "--name=smoke"] }
            })
        );
    }

    #[test]
    fn completed_response_tolerates_missing_fields() {
        let raw = json!({ "id": 1, "payload": { "type": "completed", "errors": ["bad"] } });
        let envelope: ResponseEnvelope = serde_json::from_value(raw).unwrap();
        match envelope.payload {
            Response::Completed(outcome) => {
                assert!(outcome.output.is_empty());
                assert_eq!(outcome.errors, vec!["bad".to_string()]);
                assert_eq!(outcome.engine_output, Value::Null);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn frames_are_length_prefixed() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Request::Shutdown).unwrap();
        let body = br#"{"type":"shutdown"}"#;
        assert_eq!(&buffer[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buffer[4..], body);

        let decoded: Request = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(decoded, Request::Shutdown);
    }

    #[test]
    fn closed_stream_is_reported_as_closed_connection() {
        let err = read_message::<_, Request>(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let err = read_message::<_, Request>(&mut Cursor::new(len.to_vec())).unwrap_err();
        assert!(matches!(err, GatewayError::FrameTooLarge(_)));
    }

    #[test]
    fn partial_frame_breaks_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: RequestEnvelope = read_message(&mut stream).unwrap();
            // Announce a frame but send only its first bytes.
            stream.write_all(&64u32.to_be_bytes()).unwrap();
            stream.write_all(b"{\"id\":").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let mut connection = Connection::connect(addr).unwrap();
        connection
            .set_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let err = connection.run(vec!["--name=partial".into()]).unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)), "{err:?}");
        assert!(connection.is_broken());

        let err = connection.run(Vec::new()).unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed), "{err:?}");
        peer.join().unwrap();
    }
}
