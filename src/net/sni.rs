//! SNI extraction from a peeked TLS ClientHello.
//!
//! The hostname is read without consuming any bytes, so the stream can still
//! be handed to the TLS acceptor afterwards.

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;
/// Largest TLS plaintext record plus its header.
const MAX_RECORD_LEN: usize = 16_384 + RECORD_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// More bytes are needed to see the whole first record.
    Incomplete,
    /// The stream does not start with a TLS handshake.
    NotTls,
    Hello { sni: Option<String> },
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn vec8(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u8()?);
        self.take(len).map(|data| Reader { data })
    }

    fn vec16(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u16()?);
        self.take(len).map(|data| Reader { data })
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse the first TLS record of a connection.
pub fn parse_client_hello(data: &[u8]) -> ClientHello {
    if data.is_empty() {
        return ClientHello::Incomplete;
    }
    if data[0] != HANDSHAKE_RECORD {
        return ClientHello::NotTls;
    }
    if data.len() < RECORD_HEADER_LEN {
        return ClientHello::Incomplete;
    }
    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    let Some(record) = data.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len) else {
        return ClientHello::Incomplete;
    };
    ClientHello::Hello {
        sni: server_name(record),
    }
}

fn server_name(record: &[u8]) -> Option<String> {
    let mut handshake = Reader { data: record };
    if handshake.u8()? != CLIENT_HELLO {
        return None;
    }
    let hello_len = handshake.u24()?;
    // a hello split across records only exposes what the first one carries
    let available = hello_len.min(handshake.data.len());
    let mut hello = Reader {
        data: handshake.take(available)?,
    };

    hello.take(2 + 32)?; // legacy version + random
    hello.vec8()?; // session id
    hello.vec16()?; // cipher suites
    hello.vec8()?; // compression methods
    let mut extensions = hello.vec16()?;

    while !extensions.is_empty() {
        let extension_type = extensions.u16()?;
        let mut body = extensions.vec16()?;
        if extension_type != SERVER_NAME_EXTENSION {
            continue;
        }
        let mut names = body.vec16()?;
        while !names.is_empty() {
            let name_type = names.u8()?;
            let name = names.vec16()?;
            if name_type == HOST_NAME_TYPE {
                return std::str::from_utf8(name.data).ok().map(str::to_string);
            }
        }
        return None;
    }
    None
}

/// Peek at the stream until the first TLS record is complete.
///
/// Fails with `TimedOut` if the client does not send a full record in time and
/// with `UnexpectedEof` if it disconnects first.
pub async fn peek_sni(stream: &TcpStream, timeout: Duration) -> io::Result<ClientHello> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_RECORD_LEN];
    loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for TLS ClientHello"))??;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        match parse_client_hello(&buf[..n]) {
            ClientHello::Incomplete if n < buf.len() => {
                // peek returns immediately once any bytes are buffered
                tokio::time::sleep_until((Instant::now() + Duration::from_millis(5)).min(deadline)).await;
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "incomplete TLS ClientHello"));
                }
            }
            parsed => return Ok(parsed),
        }
    }
}
