//! 6LoWPAN adaptation layer: carries IPv6 datagrams over small radio frames.
//!
//! - [`utils`]: byte arena, ack bitmaps, RTT estimation, timers
//! - [`protocol`]: datagram model, IPHC/NHC codec, fragment headers
//! - [`layer`]: fragmentation, retransmission, reassembly and the [`layer::Lowpan`] facade

pub mod layer;
pub mod protocol;
pub mod utils;
