use std::{io::Cursor, net::Ipv6Addr};

use byteorder::ReadBytesExt;
use log::trace;

use super::{
    addr::{is_link_local, is_short_iid, iid_of, with_prefix, ContextTable, LinkAddr},
    datagram::{
        parse_chain, read_addr, read_bytes, Datagram, DatagramBuilder, NextHeader, IPV6_HDR_LEN,
    },
    nhc::{self, NhcNext},
    DecodingError,
};

pub const IPHC_DISPATCH: u8 = 0x60;
pub const IPHC_DISPATCH_MASK: u8 = 0xe0;
pub const IPV6_DISPATCH: u8 = 0x41;

// first byte
const TF_MASK: u8 = 0x18;
const TF_INLINE: u8 = 0x00;
const TF_DSCP_ELIDED: u8 = 0x08;
const TF_FL_ELIDED: u8 = 0x10;
const TF_ALL_ELIDED: u8 = 0x18;
const NH_COMPRESSED: u8 = 0x04;
const HLIM_MASK: u8 = 0x03;

// second byte
const CID: u8 = 0x80;
const SAC: u8 = 0x40;
const SAM_SHIFT: u8 = 4;
const MULTICAST: u8 = 0x08;
const DAC: u8 = 0x04;
const AM_MASK: u8 = 0x03;

// address modes, unicast
const AM_INLINE: u8 = 0;
const AM_IID: u8 = 1;
const AM_SHORT: u8 = 2;
const AM_ELIDED: u8 = 3;

// address modes, multicast
const AM_M_48: u8 = 1;
const AM_M_32: u8 = 2;
const AM_M_8: u8 = 3;

const LINK_LOCAL_PREFIX: [u8; 8] = [0xfe, 0x80, 0, 0, 0, 0, 0, 0];
const SHORT_IID_PREFIX: [u8; 6] = [0, 0, 0, 0xff, 0xfe, 0];

/// Compressed header bytes of one datagram.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    bytes: Vec<u8>,
    first_uncompressed: usize,
    inline_headers_len: usize,
    covered_len: usize,
}

impl CompressionResult {
    #[inline]
    fn check_rep(&self) {
        assert!(self.bytes.len() <= self.covered_len);
        assert_eq!(self.covered_len % 8, 0);
    }

    #[must_use]
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Index of the first header carried uncompressed.
    #[must_use]
    #[inline]
    pub fn first_uncompressed(&self) -> usize {
        self.first_uncompressed
    }

    /// Bytes of headers still carried uncompressed.
    #[must_use]
    #[inline]
    pub fn inline_headers_len(&self) -> usize {
        self.inline_headers_len
    }

    /// Uncompressed size of everything the compressed bytes stand for.
    #[must_use]
    #[inline]
    pub fn covered_len(&self) -> usize {
        self.covered_len
    }

    /// Bytes saved by compression.
    #[must_use]
    #[inline]
    pub fn savings(&self) -> usize {
        self.covered_len - self.bytes.len()
    }
}

fn compress_unicast(addr: &Ipv6Addr, link: &LinkAddr) -> (u8, Vec<u8>) {
    if is_link_local(addr) {
        let iid = iid_of(addr);
        if iid == link.iid() {
            (AM_ELIDED, Vec::new())
        } else if is_short_iid(&iid) {
            (AM_SHORT, iid[6..].to_vec())
        } else {
            (AM_IID, iid.to_vec())
        }
    } else {
        (AM_INLINE, addr.octets().to_vec())
    }
}

fn compress_multicast(addr: &Ipv6Addr) -> (u8, Vec<u8>) {
    let o = addr.octets();
    let zero = |range: std::ops::Range<usize>| o[range].iter().all(|&b| b == 0);
    if o[1] == 0x02 && zero(2..15) {
        // ff02::00XX
        (AM_M_8, vec![o[15]])
    } else if zero(2..13) {
        // ffXX::00XX:XXXX
        (AM_M_32, vec![o[1], o[13], o[14], o[15]])
    } else if zero(2..11) {
        // ffXX::00XX:XXXX:XXXX
        (AM_M_48, vec![o[1], o[11], o[12], o[13], o[14], o[15]])
    } else {
        (AM_INLINE, o.to_vec())
    }
}

/// Compresses the IPv6 header and as many following headers as `budget` allows.
///
/// A header gets its NHC form only if all headers before it did and the
/// uncompressed size of it, the headers after it and the payload still fits
/// below what is left of `budget`. Whatever is not compressed is carried
/// inline by the caller.
#[must_use]
pub fn compress(
    dg: &Datagram,
    src_link: &LinkAddr,
    dst_link: &LinkAddr,
    budget: usize,
) -> CompressionResult {
    let mut iphc = [IPHC_DISPATCH, 0];

    // traffic class and flow label
    let tc = dg.traffic_class();
    let fl = dg.flow_label();
    let fl_bytes = [(fl >> 16) as u8 & 0x0f, (fl >> 8) as u8, fl as u8];
    let tf: Vec<u8> = if fl == 0 && tc == 0 {
        iphc[0] |= TF_ALL_ELIDED;
        vec![]
    } else if fl == 0 {
        iphc[0] |= TF_FL_ELIDED;
        vec![tc]
    } else if tc & 0x3f == 0 {
        iphc[0] |= TF_DSCP_ELIDED;
        vec![(tc & 0xc0) | fl_bytes[0], fl_bytes[1], fl_bytes[2]]
    } else {
        iphc[0] |= TF_INLINE;
        vec![tc, fl_bytes[0], fl_bytes[1], fl_bytes[2]]
    };

    let hlim: Vec<u8> = match dg.hop_limit() {
        1 => {
            iphc[0] |= 1;
            vec![]
        }
        64 => {
            iphc[0] |= 2;
            vec![]
        }
        255 => {
            iphc[0] |= 3;
            vec![]
        }
        x => vec![x],
    };

    let src: Vec<u8> = if dg.src().is_unspecified() {
        iphc[1] |= SAC;
        vec![]
    } else {
        let (mode, bytes) = compress_unicast(dg.src(), src_link);
        iphc[1] |= mode << SAM_SHIFT;
        bytes
    };
    let dst: Vec<u8> = if dg.dst().is_multicast() {
        let (mode, bytes) = compress_multicast(dg.dst());
        iphc[1] |= MULTICAST | mode;
        bytes
    } else {
        let (mode, bytes) = compress_unicast(dg.dst(), dst_link);
        iphc[1] |= mode;
        bytes
    };

    let headers = dg.headers();
    let fits = |i: usize, pos: usize| -> bool {
        headers[i].is_compressible()
            && pos + dg.headers_len_from(i) + dg.payload_len() < budget
    };

    let base_len = iphc.len() + tf.len() + hlim.len() + src.len() + dst.len();
    let compress_first = !headers.is_empty() && fits(0, base_len);
    if compress_first {
        iphc[0] |= NH_COMPRESSED;
    }

    let mut out = Vec::with_capacity(base_len + 1);
    out.extend_from_slice(&iphc);
    out.extend_from_slice(&tf);
    if !compress_first {
        out.push(dg.next_header_at(0).into());
    }
    out.extend_from_slice(&hlim);
    out.extend_from_slice(&src);
    out.extend_from_slice(&dst);

    let mut i = 0;
    let mut compress_this = compress_first;
    while compress_this {
        let hdr = &headers[i];
        let next = dg.next_header_at(i + 1);
        // worst case: next header type inline
        let mut probe = Vec::new();
        nhc::encode(hdr, next, false, &mut probe);
        let compress_next =
            !hdr.is_terminal() && i + 1 < headers.len() && fits(i + 1, out.len() + probe.len());
        nhc::encode(hdr, next, compress_next, &mut out);
        i += 1;
        compress_this = compress_next;
    }

    let inline_headers_len = dg.headers_len_from(i);
    let result = CompressionResult {
        bytes: out,
        first_uncompressed: i,
        inline_headers_len,
        covered_len: IPV6_HDR_LEN + dg.headers_len_from(0) - inline_headers_len,
    };
    result.check_rep();
    trace!(
        "compressed {} header bytes into {}; {} of {} headers compressed",
        result.covered_len,
        result.bytes.len(),
        i,
        headers.len()
    );
    result
}

/// Headers recovered from the compressed part of a datagram.
///
/// Headers carried inline are parsed later by [`Decompressed::finish`], once
/// every byte of the datagram is available.
#[derive(Debug, Clone)]
pub struct Decompressed {
    datagram: Datagram,
    consumed: usize,
    resume: Option<NextHeader>,
    covered_len: usize,
}

impl Decompressed {
    #[must_use]
    #[inline]
    pub fn datagram(&self) -> &Datagram {
        &self.datagram
    }

    /// Wire bytes taken, dispatch byte included.
    #[must_use]
    #[inline]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Type of the first inline header, if the compressed part did not end
    /// the chain.
    #[must_use]
    #[inline]
    pub fn resume(&self) -> Option<NextHeader> {
        self.resume
    }

    /// Uncompressed size of everything the compressed bytes stood for.
    #[must_use]
    #[inline]
    pub fn covered_len(&self) -> usize {
        self.covered_len
    }

    /// Completes the datagram from the bytes following the compressed part.
    ///
    /// Returns the datagram and how many of `raw` were headers; the rest is
    /// payload.
    pub fn finish(self, raw: &[u8]) -> Result<(Datagram, usize), DecodingError> {
        let mut datagram = self.datagram;
        let consumed = match self.resume {
            Some(first) => {
                let (headers, consumed) = parse_chain(first, raw)?;
                datagram.push_headers(headers);
                consumed
            }
            None => 0,
        };
        datagram.set_payload_len(raw.len() - consumed);
        Ok((datagram, consumed))
    }
}

fn read_u8(rdr: &mut Cursor<&[u8]>, field: &'static str) -> Result<u8, DecodingError> {
    rdr.read_u8()
        .map_err(|_e| DecodingError::Decoding { field })
}

fn decode_iid(
    mode: u8,
    prefix: [u8; 8],
    link: &LinkAddr,
    rdr: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Ipv6Addr, DecodingError> {
    let mut iid = [0; 8];
    match mode {
        AM_IID => iid.copy_from_slice(&read_bytes(rdr, 8, field)?),
        AM_SHORT => {
            iid[..6].copy_from_slice(&SHORT_IID_PREFIX);
            iid[6..].copy_from_slice(&read_bytes(rdr, 2, field)?);
        }
        AM_ELIDED => iid = link.iid(),
        _ => return Err(DecodingError::Decoding { field }),
    }
    Ok(with_prefix(prefix, iid))
}

fn decode_multicast(mode: u8, rdr: &mut Cursor<&[u8]>) -> Result<Ipv6Addr, DecodingError> {
    let mut o = [0; 16];
    o[0] = 0xff;
    match mode {
        AM_M_8 => {
            o[1] = 0x02;
            o[15] = read_u8(rdr, "dst")?;
        }
        AM_M_32 => {
            let b = read_bytes(rdr, 4, "dst")?;
            o[1] = b[0];
            o[13..].copy_from_slice(&b[1..]);
        }
        AM_M_48 => {
            let b = read_bytes(rdr, 6, "dst")?;
            o[1] = b[0];
            o[11..].copy_from_slice(&b[1..]);
        }
        _ => return read_addr(rdr, "dst"),
    }
    Ok(Ipv6Addr::from(o))
}

/// Recovers the IPv6 header and compressed headers from the start of a frame.
///
/// `bytes` starts at the dispatch byte, which must be IPHC or uncompressed
/// IPv6. `src_link`/`dst_link` are the link addresses of the frame.
pub fn decompress(
    bytes: &[u8],
    src_link: &LinkAddr,
    dst_link: &LinkAddr,
    src_contexts: &ContextTable,
    dst_contexts: &ContextTable,
) -> Result<Decompressed, DecodingError> {
    let mut rdr = Cursor::new(bytes);
    let b0 = read_u8(&mut rdr, "dispatch")?;

    if b0 == IPV6_DISPATCH {
        let (datagram, next) = Datagram::read_ipv6_header(&mut rdr)?;
        return Ok(Decompressed {
            datagram,
            consumed: rdr.position() as usize,
            resume: Some(next),
            covered_len: IPV6_HDR_LEN,
        });
    }
    if b0 & IPHC_DISPATCH_MASK != IPHC_DISPATCH {
        return Err(DecodingError::Decoding { field: "dispatch" });
    }
    let b1 = read_u8(&mut rdr, "iphc")?;

    let (sci, dci) = if b1 & CID != 0 {
        let ctx = read_u8(&mut rdr, "context_id")?;
        (ctx >> 4, ctx & 0x0f)
    } else {
        (0, 0)
    };

    let (traffic_class, flow_label) = match b0 & TF_MASK {
        TF_INLINE => {
            let b = read_bytes(&mut rdr, 4, "traffic_class")?;
            let fl = ((b[1] as u32 & 0x0f) << 16) | ((b[2] as u32) << 8) | b[3] as u32;
            (b[0], fl)
        }
        TF_DSCP_ELIDED => {
            let b = read_bytes(&mut rdr, 3, "flow_label")?;
            let fl = ((b[0] as u32 & 0x0f) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
            (b[0] & 0xc0, fl)
        }
        TF_FL_ELIDED => (read_u8(&mut rdr, "traffic_class")?, 0),
        _ => (0, 0),
    };

    let inline_next = if b0 & NH_COMPRESSED == 0 {
        Some(NextHeader::from_u8(read_u8(&mut rdr, "next_header")?)?)
    } else {
        None
    };

    let hop_limit = match b0 & HLIM_MASK {
        1 => 1,
        2 => 64,
        3 => 255,
        _ => read_u8(&mut rdr, "hop_limit")?,
    };

    let sam = (b1 >> SAM_SHIFT) & AM_MASK;
    let src = if b1 & SAC != 0 {
        if sam == AM_INLINE {
            Ipv6Addr::UNSPECIFIED
        } else {
            let prefix = src_contexts
                .get(sci)
                .ok_or(DecodingError::Decoding {
                    field: "src_context",
                })?;
            decode_iid(sam, prefix, src_link, &mut rdr, "src")?
        }
    } else if sam == AM_INLINE {
        read_addr(&mut rdr, "src")?
    } else {
        decode_iid(sam, LINK_LOCAL_PREFIX, src_link, &mut rdr, "src")?
    };

    let dam = b1 & AM_MASK;
    let dst = match (b1 & MULTICAST != 0, b1 & DAC != 0) {
        (true, true) => return Err(DecodingError::Decoding { field: "dst_mode" }),
        (true, false) => decode_multicast(dam, &mut rdr)?,
        (false, true) => {
            let prefix = dst_contexts
                .get(dci)
                .ok_or(DecodingError::Decoding {
                    field: "dst_context",
                })?;
            decode_iid(dam, prefix, dst_link, &mut rdr, "dst")?
        }
        (false, false) if dam == AM_INLINE => read_addr(&mut rdr, "dst")?,
        (false, false) => decode_iid(dam, LINK_LOCAL_PREFIX, dst_link, &mut rdr, "dst")?,
    };

    let mut headers = Vec::new();
    let resume = match inline_next {
        Some(next) => Some(next),
        None => loop {
            let (hdr, next) = nhc::decode(&mut rdr)?;
            headers.push(hdr);
            match next {
                NhcNext::Compressed => continue,
                NhcNext::Inline(next) => break Some(next),
                NhcNext::End => break None,
            }
        },
    };

    let covered_len = IPV6_HDR_LEN + headers.iter().map(|h| h.len()).sum::<usize>();
    let datagram = DatagramBuilder {
        src,
        dst,
        traffic_class,
        flow_label,
        hop_limit,
        headers,
        payload_len: 0,
    }
    .build()
    .map_err(|_e| DecodingError::Decoding { field: "headers" })?;

    Ok(Decompressed {
        datagram,
        consumed: rdr.position() as usize,
        resume,
        covered_len,
    })
}
