//! Control protocol carried inside envelopes.
//!
//! Three message kinds, tagged by the first byte:
//!
//! ```text
//! CONNECT  0x01: ReqID(4) ‖ Network(1) ‖ AddrType(1) ‖ Address ‖ Port(2) ‖ [InitialPayload]
//! DATA     0x02: ReqID(4) ‖ Payload            (peer → server)
//! CLOSE    0x03: ReqID(4)
//! ```
//!
//! Server→peer responses always carry a status byte:
//! `0x02 ‖ ReqID(4) ‖ Status(1) ‖ Payload`.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Message type: open an outbound connection.
pub const TYPE_CONNECT: u8 = 0x01;
/// Message type: stream payload.
pub const TYPE_DATA: u8 = 0x02;
/// Message type: close a stream.
pub const TYPE_CLOSE: u8 = 0x03;

/// Connect succeeded.
pub const STATUS_OK: u8 = 0x00;
/// Connect failed (dial error).
pub const STATUS_DIAL_FAILED: u8 = 0x01;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// Transport requested for the outbound leg of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP target connection
    Tcp,
    /// UDP target connection
    Udp,
}

impl Network {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Network::Tcp),
            0x02 => Ok(Network::Udp),
            _ => Err(Error::malformed(format!("unknown network: 0x{v:02x}"))),
        }
    }

    /// Wire encoding of the network byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Network::Tcp => 0x01,
            Network::Udp => 0x02,
        }
    }
}

/// Target address of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 address
    Ipv4(Ipv4Addr),
    /// Literal IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name to be resolved at dial time
    Domain(String),
}

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Open an outbound connection and bind it to a request id.
    Connect {
        /// Peer-minted stream identifier
        req_id: u32,
        /// Requested outbound transport
        network: Network,
        /// Where to connect
        addr: TargetAddr,
        /// Target port
        port: u16,
        /// Bytes to write to the target immediately after dialing
        initial: Vec<u8>,
    },
    /// Payload for an established stream.
    Data {
        /// Stream identifier
        req_id: u32,
        /// Raw bytes for the target
        payload: Vec<u8>,
    },
    /// Tear down a stream.
    Close {
        /// Stream identifier
        req_id: u32,
    },
}

impl ControlMessage {
    /// Parse a control message from a decrypted envelope body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::malformed(format!(
                "control message too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let msg_type = buf.get_u8();
        let req_id = buf.get_u32();

        match msg_type {
            TYPE_CONNECT => parse_connect(req_id, buf),
            TYPE_DATA => Ok(ControlMessage::Data {
                req_id,
                payload: buf.to_vec(),
            }),
            TYPE_CLOSE => Ok(ControlMessage::Close { req_id }),
            other => Err(Error::malformed(format!(
                "unknown message type: 0x{other:02x}"
            ))),
        }
    }

    /// The request id this message addresses.
    pub fn req_id(&self) -> u32 {
        match self {
            ControlMessage::Connect { req_id, .. }
            | ControlMessage::Data { req_id, .. }
            | ControlMessage::Close { req_id } => *req_id,
        }
    }
}

fn parse_connect(req_id: u32, mut buf: &[u8]) -> Result<ControlMessage> {
    if buf.len() < 4 {
        return Err(Error::malformed("connect request truncated"));
    }

    let network = Network::from_wire(buf.get_u8())?;
    let addr_type = buf.get_u8();

    let addr = match addr_type {
        ADDR_IPV4 => {
            if buf.len() < 4 + 2 {
                return Err(Error::malformed("ipv4 address truncated"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_IPV6 => {
            if buf.len() < 16 + 2 {
                return Err(Error::malformed("ipv6 address truncated"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        ADDR_DOMAIN => {
            if buf.is_empty() {
                return Err(Error::malformed("domain length missing"));
            }
            let len = buf.get_u8() as usize;
            if len == 0 {
                return Err(Error::malformed("empty domain name"));
            }
            if buf.len() < len + 2 {
                return Err(Error::malformed("domain name truncated"));
            }
            let name = String::from_utf8_lossy(&buf[..len]).into_owned();
            buf.advance(len);
            TargetAddr::Domain(name)
        }
        other => {
            return Err(Error::malformed(format!(
                "unknown address type: 0x{other:02x}"
            )))
        }
    };

    let port = buf.get_u16();
    Ok(ControlMessage::Connect {
        req_id,
        network,
        addr,
        port,
        initial: buf.to_vec(),
    })
}

/// Render the dialable `host:port` string; IPv6 hosts are bracket-wrapped.
pub fn target_of(addr: &TargetAddr, port: u16) -> String {
    match addr {
        TargetAddr::Ipv4(ip) => format!("{ip}:{port}"),
        TargetAddr::Ipv6(ip) => format!("[{ip}]:{port}"),
        TargetAddr::Domain(name) => format!("{name}:{port}"),
    }
}

/// Build a server→peer DATA response: `0x02 ‖ ReqID ‖ Status ‖ Payload`.
pub fn build_data_response(req_id: u32, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.put_u8(TYPE_DATA);
    out.put_u32(req_id);
    out.put_u8(status);
    out.put_slice(payload);
    out
}

/// Build a CLOSE message: `0x03 ‖ ReqID`.
pub fn build_close(req_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.put_u8(TYPE_CLOSE);
    out.put_u32(req_id);
    out
}
