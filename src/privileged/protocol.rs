//! Wire protocol between the unprivileged broker and `localfoundryd`.
//!
//! ## Wire Format
//!
//! ```text
//! client → daemon   HANDSHAKE (8 bytes)
//! daemon → client   HANDSHAKE (8 bytes, echoed)
//! client → daemon   instruction (u8) ‖ payload
//! daemon → client   status (u8)  [+ SCM_RIGHTS descriptor for Bind]
//! ```
//!
//! One connection carries exactly one command. Payloads:
//!
//! | code | command       | payload                                  |
//! |------|---------------|------------------------------------------|
//! | 1    | Uninstall     | none                                     |
//! | 2    | RemoveIpAlias | count (u8) ‖ count × IPv4 (4 octets)     |
//! | 3    | AddIpAlias    | count (u8) ‖ count × IPv4 (4 octets)     |
//! | 6    | Bind          | IPv4 (4 octets) ‖ port (u16 LE)          |
//!
//! Any other instruction decodes to [`Command::Unimplemented`] and is
//! answered with [`STATUS_UNIMPLEMENTED`].

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic exchanged before any instruction byte.
pub const HANDSHAKE: [u8; 8] = *b"LFDEVD\x00\x01";

pub const UNINSTALL: u8 = 1;
pub const REMOVE_IP_ALIAS: u8 = 2;
pub const ADD_IP_ALIAS: u8 = 3;
pub const BIND: u8 = 6;

pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILED: u8 = 1;
pub const STATUS_UNIMPLEMENTED: u8 = 33;

/// Most addresses one alias command can carry.
pub const MAX_ALIASES: usize = u8::MAX as usize;

/// A decoded privileged request. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Uninstall,
    AddIpAlias(Vec<Ipv4Addr>),
    RemoveIpAlias(Vec<Ipv4Addr>),
    Bind(SocketAddrV4),
    Unimplemented(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake i/o: {0}")]
    Io(#[from] io::Error),
    #[error("handshake mismatch")]
    Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read instruction: {0}")]
    Instruction(#[source] io::Error),
    #[error("failed to read {command} payload: {source}")]
    Payload {
        command: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Uninstall => "Uninstall",
            Command::AddIpAlias(_) => "AddIpAlias",
            Command::RemoveIpAlias(_) => "RemoveIpAlias",
            Command::Bind(_) => "Bind",
            Command::Unimplemented(_) => "Unimplemented",
        }
    }

    pub fn instruction(&self) -> u8 {
        match self {
            Command::Uninstall => UNINSTALL,
            Command::AddIpAlias(_) => ADD_IP_ALIAS,
            Command::RemoveIpAlias(_) => REMOVE_IP_ALIAS,
            Command::Bind(_) => BIND,
            Command::Unimplemented(code) => *code,
        }
    }

    /// Serialise instruction and payload. Alias lists must not exceed
    /// [`MAX_ALIASES`]; the count byte cannot express more.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.instruction()];
        match self {
            Command::AddIpAlias(ips) | Command::RemoveIpAlias(ips) => {
                let count = ips.len().min(MAX_ALIASES);
                buf.push(count as u8);
                for ip in &ips[..count] {
                    buf.extend_from_slice(&ip.octets());
                }
            }
            Command::Bind(addr) => {
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_le_bytes());
            }
            Command::Uninstall | Command::Unimplemented(_) => {}
        }
        buf
    }
}

/// Read one command. Unknown instruction codes are not an error; only a
/// failure to read the bytes themselves is.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Command, DecodeError> {
    let instruction = reader.read_u8().await.map_err(DecodeError::Instruction)?;

    let command = match instruction {
        UNINSTALL => Command::Uninstall,
        ADD_IP_ALIAS => Command::AddIpAlias(read_ips(reader, "AddIpAlias").await?),
        REMOVE_IP_ALIAS => Command::RemoveIpAlias(read_ips(reader, "RemoveIpAlias").await?),
        BIND => {
            let payload = |source| DecodeError::Payload { command: "Bind", source };
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await.map_err(payload)?;
            let port = reader.read_u16_le().await.map_err(payload)?;
            Command::Bind(SocketAddrV4::new(Ipv4Addr::from(octets), port))
        }
        other => Command::Unimplemented(other),
    };
    Ok(command)
}

async fn read_ips<R: AsyncRead + Unpin>(
    reader: &mut R,
    command: &'static str,
) -> Result<Vec<Ipv4Addr>, DecodeError> {
    let payload = |source| DecodeError::Payload { command, source };
    let count = reader.read_u8().await.map_err(payload)?;
    let mut ips = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut octets = [0u8; 4];
        reader.read_exact(&mut octets).await.map_err(payload)?;
        ips.push(Ipv4Addr::from(octets));
    }
    Ok(ips)
}

/// Daemon side: read the client's magic and echo it back.
pub async fn accept_handshake<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut magic).await?;
    if magic != HANDSHAKE {
        return Err(HandshakeError::Mismatch);
    }
    stream.write_all(&HANDSHAKE).await?;
    Ok(())
}

/// Client side: send the magic and require the echo.
pub async fn initiate_handshake<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&HANDSHAKE).await?;
    let mut echo = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut echo).await?;
    if echo != HANDSHAKE {
        return Err(HandshakeError::Mismatch);
    }
    Ok(())
}
