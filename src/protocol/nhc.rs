use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{
    datagram::{read_bytes, ExtHeader, NextHeader},
    DecodingError,
};

pub const NHC_EXT_DISPATCH: u8 = 0xe0;
pub const NHC_UDP_DISPATCH: u8 = 0xf0;
const NHC_EXT_MASK: u8 = 0xf0;
const NHC_UDP_MASK: u8 = 0xf8;
const NHC_NEXT_COMPRESSED: u8 = 0x01;
const UDP_CHECKSUM_ELIDED: u8 = 0x04;
const UDP_PORTS_MASK: u8 = 0x03;

const UDP_SHORT_PORT_PREFIX: u16 = 0xf0b0;
const UDP_BYTE_PORT_PREFIX: u16 = 0xf000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum ExtId {
    HopByHop = 0,
    Routing = 1,
    Fragment = 2,
    DestinationOptions = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum UdpPorts {
    Inline = 0,
    DstByte = 1,
    SrcByte = 2,
    Nibbles = 3,
}

/// What follows an NHC-encoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NhcNext {
    /// Another NHC header.
    Compressed,
    /// An uncompressed header of this type.
    Inline(NextHeader),
    /// Transport header; the payload follows.
    End,
}

/// Appends the NHC form of `hdr`.
///
/// `next` is the type of the following header; it is written inline unless
/// `next_compressed`. Transport headers ignore both.
pub fn encode(hdr: &ExtHeader, next: NextHeader, next_compressed: bool, out: &mut Vec<u8>) {
    let ext = |id: ExtId, out: &mut Vec<u8>| {
        let mut nhc = NHC_EXT_DISPATCH | (u8::from(id) << 1);
        if next_compressed {
            nhc |= NHC_NEXT_COMPRESSED;
            out.push(nhc);
        } else {
            out.push(nhc);
            out.push(next.into());
        }
    };
    match hdr {
        ExtHeader::HopByHop { options } | ExtHeader::DestinationOptions { options } => {
            let id = if matches!(hdr, ExtHeader::HopByHop { .. }) {
                ExtId::HopByHop
            } else {
                ExtId::DestinationOptions
            };
            ext(id, out);
            out.push(options.len() as u8);
            out.extend_from_slice(options);
        }
        ExtHeader::Routing {
            routing_type,
            segments_left,
            data,
        } => {
            ext(ExtId::Routing, out);
            out.push((data.len() + 2) as u8);
            out.push(*routing_type);
            out.push(*segments_left);
            out.extend_from_slice(data);
        }
        ExtHeader::Fragment {
            offset,
            more,
            identification,
        } => {
            ext(ExtId::Fragment, out);
            out.push(0);
            out.extend_from_slice(&((offset << 3) | *more as u16).to_be_bytes());
            out.extend_from_slice(&identification.to_be_bytes());
        }
        ExtHeader::Udp {
            src_port,
            dst_port,
            checksum,
        } => {
            let (src, dst) = (*src_port, *dst_port);
            let ports = if src & 0xfff0 == UDP_SHORT_PORT_PREFIX
                && dst & 0xfff0 == UDP_SHORT_PORT_PREFIX
            {
                UdpPorts::Nibbles
            } else if src & 0xff00 == UDP_BYTE_PORT_PREFIX {
                UdpPorts::SrcByte
            } else if dst & 0xff00 == UDP_BYTE_PORT_PREFIX {
                UdpPorts::DstByte
            } else {
                UdpPorts::Inline
            };
            let mut nhc = NHC_UDP_DISPATCH | u8::from(ports);
            if checksum.is_none() {
                nhc |= UDP_CHECKSUM_ELIDED;
            }
            out.push(nhc);
            match ports {
                UdpPorts::Nibbles => out.push((((src & 0xf) << 4) | (dst & 0xf)) as u8),
                UdpPorts::SrcByte => {
                    out.push(src as u8);
                    out.extend_from_slice(&dst.to_be_bytes());
                }
                UdpPorts::DstByte => {
                    out.extend_from_slice(&src.to_be_bytes());
                    out.push(dst as u8);
                }
                UdpPorts::Inline => {
                    out.extend_from_slice(&src.to_be_bytes());
                    out.extend_from_slice(&dst.to_be_bytes());
                }
            }
            if let Some(checksum) = checksum {
                out.extend_from_slice(&checksum.to_be_bytes());
            }
        }
        ExtHeader::Icmpv6 { .. } => unreachable!("ICMPv6 has no NHC form"),
    }
}

/// Reads one NHC-encoded header.
pub fn decode(rdr: &mut Cursor<&[u8]>) -> Result<(ExtHeader, NhcNext), DecodingError> {
    let nhc = rdr
        .read_u8()
        .map_err(|_e| DecodingError::Decoding { field: "nhc" })?;

    if nhc & NHC_UDP_MASK == NHC_UDP_DISPATCH {
        let ports = UdpPorts::try_from(nhc & UDP_PORTS_MASK)
            .map_err(|_e| DecodingError::Decoding { field: "nhc" })?;
        let (src_port, dst_port) = match ports {
            UdpPorts::Nibbles => {
                let b = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "ports" })?;
                (
                    UDP_SHORT_PORT_PREFIX | (b >> 4) as u16,
                    UDP_SHORT_PORT_PREFIX | (b & 0xf) as u16,
                )
            }
            UdpPorts::SrcByte => {
                let src = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "src_port" })?;
                let dst = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "dst_port" })?;
                (UDP_BYTE_PORT_PREFIX | src as u16, dst)
            }
            UdpPorts::DstByte => {
                let src = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "src_port" })?;
                let dst = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "dst_port" })?;
                (src, UDP_BYTE_PORT_PREFIX | dst as u16)
            }
            UdpPorts::Inline => {
                let src = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "src_port" })?;
                let dst = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "dst_port" })?;
                (src, dst)
            }
        };
        let checksum = if nhc & UDP_CHECKSUM_ELIDED != 0 {
            None
        } else {
            Some(
                rdr.read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "checksum" })?,
            )
        };
        let hdr = ExtHeader::Udp {
            src_port,
            dst_port,
            checksum,
        };
        return Ok((hdr, NhcNext::End));
    }

    if nhc & NHC_EXT_MASK != NHC_EXT_DISPATCH {
        return Err(DecodingError::Decoding { field: "nhc" });
    }
    let id = ExtId::try_from((nhc >> 1) & 0x07)
        .map_err(|_e| DecodingError::Decoding { field: "nhc_eid" })?;
    let next = if nhc & NHC_NEXT_COMPRESSED != 0 {
        NhcNext::Compressed
    } else {
        let next = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "next_header" })?;
        NhcNext::Inline(NextHeader::from_u8(next)?)
    };
    let hdr = match id {
        ExtId::HopByHop | ExtId::DestinationOptions => {
            let len = rdr
                .read_u8()
                .map_err(|_e| DecodingError::Decoding { field: "ext_len" })?;
            let options = read_bytes(rdr, len as usize, "options")?;
            if id == ExtId::HopByHop {
                ExtHeader::HopByHop { options }
            } else {
                ExtHeader::DestinationOptions { options }
            }
        }
        ExtId::Routing => {
            let len = rdr
                .read_u8()
                .map_err(|_e| DecodingError::Decoding { field: "ext_len" })?;
            if len < 2 {
                return Err(DecodingError::Decoding { field: "ext_len" });
            }
            let routing_type = rdr
                .read_u8()
                .map_err(|_e| DecodingError::Decoding { field: "routing_type" })?;
            let segments_left = rdr
                .read_u8()
                .map_err(|_e| DecodingError::Decoding { field: "segments_left" })?;
            let data = read_bytes(rdr, len as usize - 2, "routing_data")?;
            ExtHeader::Routing {
                routing_type,
                segments_left,
                data,
            }
        }
        ExtId::Fragment => {
            let _reserved = rdr
                .read_u8()
                .map_err(|_e| DecodingError::Decoding { field: "reserved" })?;
            let offset = rdr
                .read_u16::<BigEndian>()
                .map_err(|_e| DecodingError::Decoding { field: "frag_offset" })?;
            let identification = rdr
                .read_u32::<BigEndian>()
                .map_err(|_e| DecodingError::Decoding { field: "identification" })?;
            ExtHeader::Fragment {
                offset: offset >> 3,
                more: offset & 1 == 1,
                identification,
            }
        }
    };
    Ok((hdr, next))
}
