//! # Dispatch (first byte of every frame)
//!
//! ```text
//! 011xxxxx  IPHC compressed IPv6 header
//! 01000001  uncompressed IPv6 header
//! 11000xxx  FRAG1 (first fragment)
//! 11100xxx  FRAGN (subsequent fragment)
//! 1110100a  RFRAG (recoverable fragment, a = ack request)
//! 1110101e  RFRAG-ACK (e = congestion echo)
//! ```
//!
//! # FRAG1 / FRAGN
//!
//! ```text
//! 0   5          16              32        40 (BIT)
//! +---+-----------+---------------+
//! |disp| dg size  |    dg tag     |           FRAG1
//! +---+-----------+---------------+---------+
//! |disp| dg size  |    dg tag     | offset  | FRAGN
//! +---+-----------+---------------+---------+
//! ```
//!
//! # RFRAG
//!
//! ```text
//! 0        8        16              32    37          48 (BIT)
//! +--------+--------+---------------+-----+-----------+
//! |  disp  | offset |    dg tag     | seq |  dg size  |
//! +--------+--------+---------------+-----+-----------+
//! ```
//!
//! # RFRAG-ACK
//!
//! ```text
//! 0        8               24                              56 (BIT)
//! +--------+---------------+-------------------------------+
//! |  disp  |    dg tag     |  ack bitmap (seq 0 = MSB)     |
//! +--------+---------------+-------------------------------+
//! ```
//!
//! # IPHC
//!
//! ```text
//! 0   3  5  6  8  9  10  12 13 14 16 (BIT)
//! +---+--+--+--+--+--+---+--+--+--+
//! |011|TF|NH|HL|CI|SC|SAM|M |DC|DAM|
//! +---+--+--+--+--+--+---+--+--+--+
//! [context id] [TF fields] [next header] [hop limit] [src] [dst] [NHC]*
//! ```
//!
//! # Invariants
//!
//! - Fragment offsets are in 8-byte units of the uncompressed datagram
//! - Datagram size fits 11 bits
//! - Sequence numbers fit 5 bits

pub mod ack_hdr;
pub mod addr;
pub mod datagram;
pub mod frag_hdr;
pub mod iphc;
pub mod nhc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodingError {
    Decoding { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    NotEnoughSpace,
}
