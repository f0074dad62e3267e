//! Snapshot transport: one blocking TCP fetch of the gmetad XML dump.
//!
//! gmetad has no framing; it streams the whole document on connect and
//! signals completion by closing the socket, so the fetcher reads until
//! end-of-stream. No connect or read timeout is set; a silent aggregator
//! blocks the probe until the OS gives up.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use thiserror::Error;
use tracing::debug;

/// Size of each read from the socket.
const READ_CHUNK: usize = 64 * 1024;

/// Initial receive buffer size.
const INITIAL_BUFFER: usize = 1024 * 1024;

/// Fixed increment the buffer grows by when the next read would overflow.
const BUFFER_GROWTH: usize = 1024 * 1024;

/// Errors raised while fetching a snapshot from the aggregator.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unable to resolve {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },

    #[error("unable to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("receive failed after {received} bytes: {source}")]
    Receive {
        received: usize,
        #[source]
        source: io::Error,
    },

    #[error("unable to grow receive buffer past {capacity} bytes")]
    Allocation { capacity: usize },
}

/// Fetch one complete XML snapshot from `host:port`.
///
/// Returns exactly the bytes received. The buffer starts at 1 MiB and
/// grows by 1 MiB whenever the next chunk would overflow it; bytes already
/// received are always retained across growth. The connection is closed on
/// both success and failure paths when the stream handle drops.
pub fn fetch(host: &str, port: u16) -> Result<Vec<u8>, FetchError> {
    let endpoint = format!("{host}:{port}");

    let addr = resolve(host, port, &endpoint)?;
    debug!(%addr, "connecting to gmetad");

    let mut stream = TcpStream::connect(addr).map_err(|source| FetchError::Connect {
        endpoint: endpoint.clone(),
        source,
    })?;
    debug!("connected, receiving snapshot");

    let mut buf = vec![0u8; INITIAL_BUFFER];
    let mut received = 0;

    loop {
        if received + READ_CHUNK > buf.len() {
            buf.try_reserve_exact(BUFFER_GROWTH)
                .map_err(|_| FetchError::Allocation {
                    capacity: buf.len() + BUFFER_GROWTH,
                })?;
            buf.resize(buf.len() + BUFFER_GROWTH, 0);
            debug!(capacity = buf.len(), "grew receive buffer");
        }

        match stream.read(&mut buf[received..received + READ_CHUNK]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(FetchError::Receive { received, source }),
        }
    }

    debug!(
        received,
        capacity = buf.len(),
        "snapshot received, end of stream"
    );

    buf.truncate(received);
    Ok(buf)
}

/// Resolve `host:port` to the first usable socket address.
fn resolve(host: &str, port: u16, endpoint: &str) -> Result<SocketAddr, FetchError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| FetchError::Resolve {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| FetchError::Resolve {
        endpoint: endpoint.to_string(),
        reason: "no addresses returned".to_string(),
    })
}
