use std::{io::Cursor, net::Ipv6Addr};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::DecodingError;

pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;
pub const ICMPV6_HDR_LEN: usize = 4;
const FRAGMENT_HDR_LEN: usize = 8;
const MAX_FLOW_LABEL: u32 = 0xf_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NextHeader {
    HopByHop = 0,
    Udp = 17,
    Routing = 43,
    Fragment = 44,
    Icmpv6 = 58,
    NoNext = 59,
    DestinationOptions = 60,
}

impl NextHeader {
    pub fn from_u8(x: u8) -> Result<Self, DecodingError> {
        Self::try_from(x).map_err(|_e| DecodingError::Decoding {
            field: "next_header",
        })
    }
}

/// One entry of the header chain following the IPv6 base header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtHeader {
    HopByHop {
        options: Vec<u8>,
    },
    Routing {
        routing_type: u8,
        segments_left: u8,
        data: Vec<u8>,
    },
    Fragment {
        /// In 8-byte units
        offset: u16,
        more: bool,
        identification: u32,
    },
    DestinationOptions {
        options: Vec<u8>,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
        checksum: Option<u16>,
    },
    Icmpv6 {
        icmp_type: u8,
        code: u8,
        checksum: u16,
    },
}

#[inline]
fn align8(x: usize) -> usize {
    (x + 7) & !7
}

/// Pads option bytes with `Pad1` so that `fixed + options` fills whole octets.
fn padded(mut bytes: Vec<u8>, fixed: usize) -> Vec<u8> {
    let len = align8(fixed + bytes.len()) - fixed;
    bytes.resize(len, 0);
    bytes
}

impl ExtHeader {
    #[must_use]
    pub fn hop_by_hop(options: Vec<u8>) -> Self {
        ExtHeader::HopByHop {
            options: padded(options, 2),
        }
    }

    #[must_use]
    pub fn destination_options(options: Vec<u8>) -> Self {
        ExtHeader::DestinationOptions {
            options: padded(options, 2),
        }
    }

    #[must_use]
    pub fn routing(routing_type: u8, segments_left: u8, data: Vec<u8>) -> Self {
        ExtHeader::Routing {
            routing_type,
            segments_left,
            data: padded(data, 4),
        }
    }

    #[must_use]
    pub fn kind(&self) -> NextHeader {
        match self {
            ExtHeader::HopByHop { .. } => NextHeader::HopByHop,
            ExtHeader::Routing { .. } => NextHeader::Routing,
            ExtHeader::Fragment { .. } => NextHeader::Fragment,
            ExtHeader::DestinationOptions { .. } => NextHeader::DestinationOptions,
            ExtHeader::Udp { .. } => NextHeader::Udp,
            ExtHeader::Icmpv6 { .. } => NextHeader::Icmpv6,
        }
    }

    /// Uncompressed size on the wire.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ExtHeader::HopByHop { options } | ExtHeader::DestinationOptions { options } => {
                align8(2 + options.len())
            }
            ExtHeader::Routing { data, .. } => align8(4 + data.len()),
            ExtHeader::Fragment { .. } => FRAGMENT_HDR_LEN,
            ExtHeader::Udp { .. } => UDP_HDR_LEN,
            ExtHeader::Icmpv6 { .. } => ICMPV6_HDR_LEN,
        }
    }

    /// Transport headers end the chain.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtHeader::Udp { .. } | ExtHeader::Icmpv6 { .. })
    }

    /// Whether an NHC encoding exists for this kind.
    #[must_use]
    pub fn is_compressible(&self) -> bool {
        !matches!(self, ExtHeader::Icmpv6 { .. })
    }

    /// `payload_len` is the upper-layer payload following the whole chain.
    pub fn write_to(&self, next: NextHeader, payload_len: usize, out: &mut Vec<u8>) {
        let start = out.len();
        let len = self.len();
        match self {
            ExtHeader::HopByHop { options } | ExtHeader::DestinationOptions { options } => {
                out.push(next.into());
                out.push((len / 8 - 1) as u8);
                out.extend_from_slice(options);
            }
            ExtHeader::Routing {
                routing_type,
                segments_left,
                data,
            } => {
                out.push(next.into());
                out.push((len / 8 - 1) as u8);
                out.push(*routing_type);
                out.push(*segments_left);
                out.extend_from_slice(data);
            }
            ExtHeader::Fragment {
                offset,
                more,
                identification,
            } => {
                let mut hdr = [0; FRAGMENT_HDR_LEN];
                hdr[0] = next.into();
                BigEndian::write_u16(&mut hdr[2..4], (offset << 3) | *more as u16);
                BigEndian::write_u32(&mut hdr[4..8], *identification);
                out.extend_from_slice(&hdr);
            }
            ExtHeader::Udp {
                src_port,
                dst_port,
                checksum,
            } => {
                let mut hdr = [0; UDP_HDR_LEN];
                BigEndian::write_u16(&mut hdr[0..2], *src_port);
                BigEndian::write_u16(&mut hdr[2..4], *dst_port);
                BigEndian::write_u16(&mut hdr[4..6], (UDP_HDR_LEN + payload_len) as u16);
                BigEndian::write_u16(&mut hdr[6..8], checksum.unwrap_or(0));
                out.extend_from_slice(&hdr);
            }
            ExtHeader::Icmpv6 {
                icmp_type,
                code,
                checksum,
            } => {
                out.push(*icmp_type);
                out.push(*code);
                out.extend_from_slice(&checksum.to_be_bytes());
            }
        }
        // option padding
        out.resize(start + len, 0);
    }

    /// Reads one uncompressed header of type `kind`.
    ///
    /// Returns the header and, unless it ends the chain, the type of the
    /// header after it.
    pub fn read_from(
        kind: NextHeader,
        rdr: &mut Cursor<&[u8]>,
    ) -> Result<(Self, Option<NextHeader>), DecodingError> {
        let hdr = match kind {
            NextHeader::HopByHop | NextHeader::DestinationOptions | NextHeader::Routing => {
                let next = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "next_header" })?;
                let next = NextHeader::from_u8(next)?;
                let ext_len = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "ext_len" })?;
                let len = (ext_len as usize + 1) * 8;
                let hdr = match kind {
                    NextHeader::Routing => {
                        let routing_type = rdr
                            .read_u8()
                            .map_err(|_e| DecodingError::Decoding { field: "routing_type" })?;
                        let segments_left = rdr
                            .read_u8()
                            .map_err(|_e| DecodingError::Decoding { field: "segments_left" })?;
                        let data = read_bytes(rdr, len - 4, "routing_data")?;
                        ExtHeader::Routing {
                            routing_type,
                            segments_left,
                            data,
                        }
                    }
                    NextHeader::HopByHop => ExtHeader::HopByHop {
                        options: read_bytes(rdr, len - 2, "options")?,
                    },
                    _ => ExtHeader::DestinationOptions {
                        options: read_bytes(rdr, len - 2, "options")?,
                    },
                };
                return Ok((hdr, Some(next)));
            }
            NextHeader::Fragment => {
                let next = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "next_header" })?;
                let next = NextHeader::from_u8(next)?;
                let _reserved = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "reserved" })?;
                let offset = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "frag_offset" })?;
                let identification = rdr
                    .read_u32::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "identification" })?;
                let hdr = ExtHeader::Fragment {
                    offset: offset >> 3,
                    more: offset & 1 == 1,
                    identification,
                };
                return Ok((hdr, Some(next)));
            }
            NextHeader::Udp => {
                let src_port = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "src_port" })?;
                let dst_port = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "dst_port" })?;
                let _len = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "udp_len" })?;
                let checksum = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "checksum" })?;
                ExtHeader::Udp {
                    src_port,
                    dst_port,
                    checksum: if checksum == 0 { None } else { Some(checksum) },
                }
            }
            NextHeader::Icmpv6 => {
                let icmp_type = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "icmp_type" })?;
                let code = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "icmp_code" })?;
                let checksum = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "checksum" })?;
                ExtHeader::Icmpv6 {
                    icmp_type,
                    code,
                    checksum,
                }
            }
            NextHeader::NoNext => {
                return Err(DecodingError::Decoding {
                    field: "next_header",
                })
            }
        };
        Ok((hdr, None))
    }
}

pub(crate) fn read_bytes(
    rdr: &mut Cursor<&[u8]>,
    len: usize,
    field: &'static str,
) -> Result<Vec<u8>, DecodingError> {
    let start = rdr.position() as usize;
    let data = *rdr.get_ref();
    if data.len() < start + len {
        return Err(DecodingError::Decoding { field });
    }
    rdr.set_position((start + len) as u64);
    Ok(data[start..start + len].to_vec())
}

/// Parses uncompressed headers starting with a header of type `first`.
///
/// Returns the headers and the number of bytes they took.
pub fn parse_chain(
    first: NextHeader,
    bytes: &[u8],
) -> Result<(Vec<ExtHeader>, usize), DecodingError> {
    let mut rdr = Cursor::new(bytes);
    let mut headers = Vec::new();
    let mut next = Some(first);
    while let Some(kind) = next {
        if kind == NextHeader::NoNext {
            break;
        }
        let (hdr, following) = ExtHeader::read_from(kind, &mut rdr)?;
        headers.push(hdr);
        next = following;
    }
    Ok((headers, rdr.position() as usize))
}

/// IPv6 datagram without its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    src: Ipv6Addr,
    dst: Ipv6Addr,
    traffic_class: u8,
    flow_label: u32,
    hop_limit: u8,
    headers: Vec<ExtHeader>,
    payload_len: usize,
}

pub struct DatagramBuilder {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub headers: Vec<ExtHeader>,
    pub payload_len: usize,
}

impl DatagramBuilder {
    pub fn build(self) -> Result<Datagram, Error> {
        if self.flow_label > MAX_FLOW_LABEL {
            return Err(Error::FlowLabel);
        }
        if let Some(i) = self.headers.iter().position(|h| h.is_terminal()) {
            if i + 1 != self.headers.len() {
                return Err(Error::TerminalNotLast);
            }
        }
        let this = Datagram {
            src: self.src,
            dst: self.dst,
            traffic_class: self.traffic_class,
            flow_label: self.flow_label,
            hop_limit: self.hop_limit,
            headers: self.headers,
            payload_len: self.payload_len,
        };
        this.check_rep();
        Ok(this)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    FlowLabel,
    TerminalNotLast,
}

impl Datagram {
    #[inline]
    fn check_rep(&self) {
        assert!(self.flow_label <= MAX_FLOW_LABEL);
    }

    #[must_use]
    #[inline]
    pub fn src(&self) -> &Ipv6Addr {
        &self.src
    }

    #[must_use]
    #[inline]
    pub fn dst(&self) -> &Ipv6Addr {
        &self.dst
    }

    #[must_use]
    #[inline]
    pub fn traffic_class(&self) -> u8 {
        self.traffic_class
    }

    #[must_use]
    #[inline]
    pub fn flow_label(&self) -> u32 {
        self.flow_label
    }

    #[must_use]
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    #[must_use]
    #[inline]
    pub fn headers(&self) -> &[ExtHeader] {
        &self.headers
    }

    #[must_use]
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub(crate) fn set_payload_len(&mut self, len: usize) {
        self.payload_len = len;
    }

    pub(crate) fn push_headers(&mut self, headers: Vec<ExtHeader>) {
        self.headers.extend(headers);
    }

    /// Uncompressed size of `headers[from..]`.
    #[must_use]
    pub fn headers_len_from(&self, from: usize) -> usize {
        self.headers.iter().skip(from).map(|h| h.len()).sum()
    }

    /// Uncompressed size of the whole datagram.
    #[must_use]
    pub fn len(&self) -> usize {
        IPV6_HDR_LEN + self.headers_len_from(0) + self.payload_len
    }

    /// Type of `headers[i]`, or "no next header" past the end.
    #[must_use]
    pub fn next_header_at(&self, i: usize) -> NextHeader {
        self.headers
            .get(i)
            .map_or(NextHeader::NoNext, |h| h.kind())
    }

    pub fn write_headers_from(&self, from: usize, out: &mut Vec<u8>) {
        for (i, hdr) in self.headers.iter().enumerate().skip(from) {
            hdr.write_to(self.next_header_at(i + 1), self.payload_len, out);
        }
    }

    pub fn write_ipv6_header(&self, out: &mut Vec<u8>) {
        let mut hdr = [0; IPV6_HDR_LEN];
        let word = (6 << 28) | ((self.traffic_class as u32) << 20) | self.flow_label;
        BigEndian::write_u32(&mut hdr[0..4], word);
        BigEndian::write_u16(&mut hdr[4..6], (self.len() - IPV6_HDR_LEN) as u16);
        hdr[6] = self.next_header_at(0).into();
        hdr[7] = self.hop_limit;
        hdr[8..24].copy_from_slice(&self.src.octets());
        hdr[24..40].copy_from_slice(&self.dst.octets());
        out.extend_from_slice(&hdr);
    }

    /// Plain IPv6 encoding of the datagram followed by `payload`.
    #[must_use]
    pub fn to_bytes(&self, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload.len(), self.payload_len);
        let mut out = Vec::with_capacity(self.len());
        self.write_ipv6_header(&mut out);
        self.write_headers_from(0, &mut out);
        out.extend_from_slice(payload);
        out
    }

    /// Reads the 40-byte base header.
    ///
    /// Returns a datagram without headers plus the type of the first header.
    pub fn read_ipv6_header(
        rdr: &mut Cursor<&[u8]>,
    ) -> Result<(Datagram, NextHeader), DecodingError> {
        let word = rdr
            .read_u32::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "version" })?;
        if word >> 28 != 6 {
            return Err(DecodingError::Decoding { field: "version" });
        }
        let _payload_len = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "payload_len" })?;
        let next = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "next_header" })?;
        let next = NextHeader::from_u8(next)?;
        let hop_limit = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "hop_limit" })?;
        let src = read_addr(rdr, "src")?;
        let dst = read_addr(rdr, "dst")?;
        let this = Datagram {
            src,
            dst,
            traffic_class: ((word >> 20) & 0xff) as u8,
            flow_label: word & MAX_FLOW_LABEL,
            hop_limit,
            headers: Vec::new(),
            payload_len: 0,
        };
        this.check_rep();
        Ok((this, next))
    }
}

pub(crate) fn read_addr(
    rdr: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Ipv6Addr, DecodingError> {
    let bytes = read_bytes(rdr, 16, field)?;
    let mut octets = [0; 16];
    octets.copy_from_slice(&bytes);
    Ok(Ipv6Addr::from(octets))
}
