//! JSON over length-prefixed TCP.
//!
//! Every frame is a 4-byte space-padded decimal length followed by that many
//! bytes of UTF-8 JSON. A [`JsonClient`] can be given a yield label, which
//! makes each request/response round trip a schedulable yield point when the
//! client runs inside a scenario thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use interlace_sched::{yield_point, Pruned};

/// Width of the length prefix.
pub const PREFIX_LEN: usize = 4;

/// Largest payload the prefix can describe.
pub const MAX_PAYLOAD: usize = 9999;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload of {len} bytes exceeds the 9999 byte frame limit")]
    TooLarge { len: usize },

    #[error("malformed length prefix {prefix:?}")]
    BadPrefix { prefix: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pruned(#[from] Pruned),
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize `value` into a complete frame.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::TooLarge { len: payload.len() });
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:4}", payload.len()).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<usize, WireError> {
    let bad = || WireError::BadPrefix { prefix: String::from_utf8_lossy(prefix).into_owned() };
    let text = std::str::from_utf8(prefix).map_err(|_| bad())?;
    text.trim_start().parse().map_err(|_| bad())
}

pub fn write_frame<W: Write, T: Serialize + ?Sized>(w: &mut W, value: &T) -> Result<(), WireError> {
    let frame = encode_frame(value)?;
    w.write_all(&frame)?;
    w.flush()?;
    trace!(len = frame.len() - PREFIX_LEN, "frame sent");
    Ok(())
}

/// Read one frame. A peer that closes cleanly before the prefix yields
/// [`WireError::Closed`].
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, WireError> {
    let mut prefix = [0u8; PREFIX_LEN];
    match r.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = parse_prefix(&prefix)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    trace!(len, "frame received");
    Ok(serde_json::from_slice(&payload)?)
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One side of an established connection.
#[derive(Debug)]
pub struct Endpoint {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Endpoint {
    fn new(stream: TcpStream) -> Result<Self, WireError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WireError> {
        write_frame(&mut self.stream, value)
    }

    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        read_frame(&mut self.stream)
    }

    /// Answer requests with `handler` until the peer hangs up. Returns the
    /// number of requests served.
    pub fn serve(&mut self, mut handler: impl FnMut(Value) -> Value) -> Result<u64, WireError> {
        let mut served = 0;
        loop {
            let request: Value = match self.receive() {
                Ok(v) => v,
                Err(WireError::Closed) => break,
                Err(e) => return Err(e),
            };
            let response = handler(request);
            self.send(&response)?;
            served += 1;
        }
        debug!(peer = %self.peer, served, "peer hung up");
        Ok(served)
    }

    pub fn close(&self) -> Result<(), WireError> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A listening socket handing out one [`Endpoint`] per client.
#[derive(Debug)]
pub struct JsonService {
    listener: TcpListener,
}

impl JsonService {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, "json service listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn accept(&self) -> Result<Endpoint, WireError> {
        let (stream, _) = self.listener.accept()?;
        let endpoint = Endpoint::new(stream)?;
        debug!(peer = %endpoint.peer, "client accepted");
        Ok(endpoint)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct JsonClient {
    endpoint: Endpoint,
    yield_label: Option<String>,
}

impl JsonClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        let endpoint = Endpoint::new(TcpStream::connect(addr)?)?;
        debug!(peer = %endpoint.peer, "connected");
        Ok(Self { endpoint, yield_label: None })
    }

    /// Yield at `label` before every round trip made with [`request`](Self::request).
    #[must_use]
    pub fn with_yield_label(mut self, label: impl Into<String>) -> Self {
        self.yield_label = Some(label.into());
        self
    }

    pub fn yield_label(&self) -> Option<&str> {
        self.yield_label.as_deref()
    }

    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WireError> {
        self.endpoint.send(value)
    }

    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        self.endpoint.receive()
    }

    /// Send `request` and wait for the response.
    pub fn request<Req, Resp>(&mut self, request: &Req) -> Result<Resp, WireError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if let Some(label) = &self.yield_label {
            yield_point(label)?;
        }
        self.send(request)?;
        self.receive()
    }

    pub fn close(&self) -> Result<(), WireError> {
        self.endpoint.close()
    }
}
