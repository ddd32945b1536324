use std::{collections::VecDeque, time::Instant};

use log::{debug, trace, warn};

use crate::{
    protocol::{
        ack_hdr::{AckHeader, AckHeaderBuilder},
        addr::{ContextTable, LinkAddr},
        datagram::Datagram,
        frag_hdr::{classify, Dispatch, FragVariant, FragmentDescriptor, MAX_DATAGRAM_LEN},
        iphc, DecodingError,
    },
    utils::{AckBitmap, AcquireError, BufferArena, RttEstimator, TimerQueue},
};

use super::{
    FragmentError, FragmentStatus, Layout, LayoutError, OutboundDatagram,
    OutboundDatagramBuilder, ReassemblyError, ReassemblyKey, ReassemblyTable,
};

pub type Tag = u16;

/// Final outcome of one outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    LinkFailure,
    RetriesExhausted,
    /// The receiver abandoned the datagram.
    Aborted,
    /// A frame of the datagram could not be built.
    LocalFailure,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub id: u64,
    pub datagram: Datagram,
    pub src_link: LinkAddr,
    pub dst_link: LinkAddr,
}

/// Names the fragment a frame carries, for [`Lowpan::link_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentTicket {
    slot: usize,
    tag: u16,
    seq: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub dst_link: LinkAddr,
    pub bytes: Vec<u8>,
    /// `None` for control frames
    pub ticket: Option<FragmentTicket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    pub src_link: LinkAddr,
    pub dst_link: LinkAddr,
    pub datagram: Datagram,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Response { id: u64, code: ResponseCode },
    Received(ReceivedDatagram),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    TooLarge,
    TooManyFragments,
    FrameTooSmall,
    TableFull,
    OutOfMemory,
    OutOfHandles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    Decoding(DecodingError),
    Reassembly(ReassemblyError),
}

/// 6LoWPAN adaptation layer between an IPv6 stack and an 802.15.4 link.
///
/// Nothing here blocks or owns a clock: the caller pushes frames, link
/// outcomes and instants in, and polls frames and events out.
pub struct Lowpan {
    arena: BufferArena,
    outbound: Vec<Option<OutboundDatagram>>,
    reassembly: ReassemblyTable,
    // completed datagrams, so late retransmissions still get an ack
    recent: VecDeque<Completion>,
    timers: TimerQueue<usize>,
    control: VecDeque<OutgoingFrame>,
    events: VecDeque<Event>,
    src_contexts: ContextTable,
    dst_contexts: ContextTable,
    next_tag: u16,

    // const
    variant: FragVariant,
    max_frame_len: usize,
    max_rounds: u32,
    estimator: RttEstimator,

    stat: LocalStat,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    key: ReassemblyKey,
    bitmap: AckBitmap,
    ttl: u32,
}

pub struct LowpanBuilder {
    pub arena: BufferArena,
    pub outbound_entries: usize,
    pub reassembly: ReassemblyTable,
    pub variant: FragVariant,
    pub max_frame_len: usize,
    pub max_rounds: u32,
    pub estimator: RttEstimator,
}

impl LowpanBuilder {
    #[must_use]
    pub fn build(self) -> Lowpan {
        let mut outbound = Vec::with_capacity(self.outbound_entries);
        outbound.resize_with(self.outbound_entries, || None);
        let this = Lowpan {
            arena: self.arena,
            outbound,
            recent: VecDeque::with_capacity(self.reassembly.capacity()),
            reassembly: self.reassembly,
            timers: TimerQueue::new(),
            control: VecDeque::new(),
            events: VecDeque::new(),
            src_contexts: ContextTable::new(),
            dst_contexts: ContextTable::new(),
            next_tag: 0,
            variant: self.variant,
            max_frame_len: self.max_frame_len,
            max_rounds: self.max_rounds,
            estimator: self.estimator,
            stat: LocalStat::default(),
        };
        this.check_rep();
        this
    }
}

impl Lowpan {
    #[inline]
    fn check_rep(&self) {
        assert!(self.timers.len() <= self.outbound.len());
        assert!(self.recent.len() <= usize::max(self.reassembly.capacity(), 1));
    }

    #[must_use]
    pub fn stat(&self) -> Stat {
        Stat {
            datagrams_sent: self.stat.datagrams_sent,
            fragments_sent: self.stat.fragments_sent,
            retransmissions: self.stat.retransmissions,
            timeouts: self.stat.timeouts,
            acks_sent: self.stat.acks_sent,
            datagrams_received: self.stat.datagrams_received,
            fragments_received: self.stat.fragments_received,
            acks_received: self.stat.acks_received,
            decoding_errors: self.stat.decoding_errors,
            duplicates: self.stat.duplicates,
            table_full: self.stat.table_full,
            out_of_memory: self.stat.out_of_memory,
            out_of_handles: self.stat.out_of_handles,
            unknown_fragments: self.stat.unknown_fragments,
            malformed: self.stat.malformed,
            overlaps: self.stat.overlaps,
            arena_used: self.arena.used_len(),
            arena_handles: self.arena.handles_in_use(),
        }
    }

    pub fn src_contexts_mut(&mut self) -> &mut ContextTable {
        &mut self.src_contexts
    }

    pub fn dst_contexts_mut(&mut self) -> &mut ContextTable {
        &mut self.dst_contexts
    }

    /// Earliest pending retransmission deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    #[must_use]
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Accepts one datagram for transmission.
    ///
    /// Exactly one [`Event::Response`] with `request.id` follows an `Ok`.
    pub fn send(&mut self, request: OutboundRequest, payload: &[u8]) -> Result<Tag, SendError> {
        let OutboundRequest {
            id,
            mut datagram,
            src_link,
            dst_link,
        } = request;
        datagram.set_payload_len(payload.len());
        let size = datagram.len();
        if size > MAX_DATAGRAM_LEN {
            warn!("datagram too large; id: {}, size: {}", id, size);
            return Err(SendError::TooLarge);
        }
        let slot = match self.outbound.iter().position(|o| o.is_none()) {
            Some(x) => x,
            None => {
                warn!("outbound table full; id: {}", id);
                return Err(SendError::TableFull);
            }
        };

        let budget = self
            .max_frame_len
            .saturating_sub(self.variant.first_hdr_len());
        let compression = iphc::compress(&datagram, &src_link, &dst_link, budget);
        let mut head = compression.bytes().to_vec();
        datagram.write_headers_from(compression.first_uncompressed(), &mut head);
        let layout = Layout::new(
            head.len() + payload.len(),
            compression.bytes().len(),
            self.variant,
            self.max_frame_len,
        )
        .map_err(|e| match e {
            LayoutError::FrameTooSmall => SendError::FrameTooSmall,
            LayoutError::TooManyFragments => SendError::TooManyFragments,
        })?;

        let handle = self.arena.acquire(payload.len()).map_err(|e| {
            warn!("no buffer for datagram; id: {}, {:?}", id, e);
            match e {
                AcquireError::OutOfMemory => SendError::OutOfMemory,
                AcquireError::OutOfHandles => SendError::OutOfHandles,
            }
        })?;
        if self.arena.copy_in(&handle, 0, payload).is_err() {
            self.arena.release(handle);
            return Err(SendError::OutOfMemory);
        }

        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let dg = OutboundDatagramBuilder {
            id,
            tag,
            variant: self.variant,
            dst_link,
            size: size as u16,
            head,
            savings: compression.savings(),
            payload: handle,
            layout,
            max_rounds: self.max_rounds,
            estimator: self.estimator.clone(),
        }
        .build();
        debug!(
            "armed; id: {}, tag: {}, size: {}, fragments: {}",
            id,
            tag,
            size,
            dg.layout().fragments()
        );
        self.outbound[slot] = Some(dg);
        self.stat.datagrams_sent += 1;
        self.check_rep();
        Ok(tag)
    }

    /// Next frame for the link: control frames first, then fragments in slot
    /// order.
    pub fn poll_frame(&mut self, now: Instant) -> Result<Option<OutgoingFrame>, FragmentError> {
        if let Some(frame) = self.control.pop_front() {
            return Ok(Some(frame));
        }
        for slot in 0..self.outbound.len() {
            let dg = match self.outbound[slot].as_mut() {
                Some(x) => x,
                None => continue,
            };
            let frag = match dg.next_fragment(&mut self.arena, self.max_frame_len) {
                Ok(Some(x)) => x,
                Ok(None) => continue,
                Err(e) => {
                    warn!("fragment not built; slot: {}, {:?}", slot, e);
                    self.finish(slot, ResponseCode::LocalFailure);
                    return Err(e);
                }
            };
            if frag.round_complete {
                if let Some(deadline) = dg.start_round(now) {
                    self.timers.schedule(slot, deadline);
                }
            }
            self.stat.fragments_sent += 1;
            if frag.retransmission {
                self.stat.retransmissions += 1;
            }
            let frame = OutgoingFrame {
                dst_link: dg.dst_link(),
                bytes: frag.bytes,
                ticket: Some(FragmentTicket {
                    slot,
                    tag: dg.tag(),
                    seq: frag.seq,
                }),
            };
            self.check_rep();
            return Ok(Some(frame));
        }
        Ok(None)
    }

    /// Link-layer outcome of a frame returned by [`Lowpan::poll_frame`].
    pub fn link_response(&mut self, ticket: FragmentTicket, success: bool) {
        let dg = match self
            .outbound
            .get_mut(ticket.slot)
            .and_then(|o| o.as_mut())
        {
            Some(x) => x,
            None => return,
        };
        if dg.tag() != ticket.tag {
            trace!("stale ticket; tag: {}", ticket.tag);
            return;
        }
        if let Some(code) = dg.response(ticket.seq, success) {
            self.finish(ticket.slot, code);
        }
    }

    /// Fires every retransmission timer due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        for slot in self.timers.expired(now) {
            let code = match self.outbound[slot].as_mut() {
                Some(dg) => {
                    self.stat.timeouts += 1;
                    dg.on_timeout()
                }
                None => continue,
            };
            if let Some(code) = code {
                self.finish(slot, code);
            }
        }
        self.check_rep();
    }

    /// Ages reassembly records and remembered completions; returns how many
    /// records expired.
    pub fn tick(&mut self) -> usize {
        let freed = self.reassembly.tick(&mut self.arena);
        if freed > 0 {
            debug!("reassembly records expired: {}", freed);
        }
        for completion in self.recent.iter_mut() {
            completion.ttl = completion.ttl.saturating_sub(1);
        }
        self.recent.retain(|c| c.ttl > 0);
        self.check_rep();
        freed
    }

    pub fn input_frame(
        &mut self,
        now: Instant,
        src_link: LinkAddr,
        dst_link: LinkAddr,
        bytes: &[u8],
    ) -> Result<(), InputError> {
        let result = match bytes.first().map(|&b| classify(b)) {
            Some(Dispatch::Iphc) | Some(Dispatch::Ipv6) => {
                self.input_datagram(src_link, dst_link, bytes)
            }
            Some(Dispatch::Frag1) | Some(Dispatch::FragN) | Some(Dispatch::RFrag) => {
                self.input_fragment(src_link, dst_link, bytes)
            }
            Some(Dispatch::RFragAck) => self.input_ack(now, src_link, bytes),
            Some(Dispatch::Unsupported) | None => {
                Err(InputError::Decoding(DecodingError::Decoding { field: "dispatch" }))
            }
        };
        if let Err(InputError::Decoding(e)) = &result {
            warn!("frame dropped; {:?}", e);
            self.stat.decoding_errors += 1;
        }
        self.check_rep();
        result
    }

    fn input_datagram(
        &mut self,
        src_link: LinkAddr,
        dst_link: LinkAddr,
        bytes: &[u8],
    ) -> Result<(), InputError> {
        let skeleton = iphc::decompress(
            bytes,
            &src_link,
            &dst_link,
            &self.src_contexts,
            &self.dst_contexts,
        )
        .map_err(InputError::Decoding)?;
        let raw = &bytes[skeleton.consumed()..];
        let (datagram, inline_len) = skeleton.finish(raw).map_err(InputError::Decoding)?;
        self.deliver(ReceivedDatagram {
            src_link,
            dst_link,
            datagram,
            payload: raw[inline_len..].to_vec(),
        });
        Ok(())
    }

    fn input_fragment(
        &mut self,
        src_link: LinkAddr,
        dst_link: LinkAddr,
        bytes: &[u8],
    ) -> Result<(), InputError> {
        let hdr = FragmentDescriptor::from_bytes(bytes).map_err(InputError::Decoding)?;
        let body = &bytes[hdr.hdr_len()..];
        let key = ReassemblyKey {
            src: src_link,
            tag: hdr.tag(),
            size: hdr.size(),
        };
        let acked = hdr.variant() == FragVariant::SelectiveAck;
        self.stat.fragments_received += 1;

        if acked {
            if hdr.is_first() {
                // the sender reuses the key for a new datagram
                self.recent.retain(|c| c.key != key);
            } else if let Some(completion) = self.recent.iter().find(|c| c.key == key) {
                let bitmap = completion.bitmap;
                self.stat.duplicates += 1;
                if hdr.ack_request() {
                    self.queue_ack(src_link, hdr.tag(), bitmap);
                }
                return Ok(());
            }
        }

        let result = if hdr.is_first() {
            self.reassembly.add_first_fragment(
                &mut self.arena,
                key,
                dst_link,
                hdr.seq(),
                body,
                &self.src_contexts,
                &self.dst_contexts,
            )
        } else {
            // fragments may overtake the first one
            match self.reassembly.ensure_record(&mut self.arena, key, dst_link) {
                Ok(()) => self.reassembly.add_fragment(
                    &mut self.arena,
                    key,
                    hdr.seq(),
                    hdr.offset(),
                    body,
                ),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(FragmentStatus::Accepted) => (),
            Ok(FragmentStatus::Duplicate) => self.stat.duplicates += 1,
            Err(e) => {
                self.reject(src_link, &hdr, e, hdr.is_first());
                return Err(InputError::Reassembly(e));
            }
        }

        let completed = match self.reassembly.take_completed(&mut self.arena, &key) {
            Ok(x) => x,
            Err(e) => {
                // the record is gone
                self.reject(src_link, &hdr, e, true);
                return Err(InputError::Reassembly(e));
            }
        };
        match completed {
            Some(done) => {
                if acked {
                    self.queue_ack(src_link, hdr.tag(), done.received);
                    if self.recent.len() >= self.reassembly.capacity() {
                        self.recent.pop_front();
                    }
                    self.recent.push_back(Completion {
                        key,
                        bitmap: done.received,
                        ttl: self.reassembly.ticks(),
                    });
                }
                self.deliver(ReceivedDatagram {
                    src_link,
                    dst_link: done.dst_link,
                    datagram: done.datagram,
                    payload: done.payload,
                });
            }
            None => {
                if acked && hdr.ack_request() {
                    if let Some(bitmap) = self.reassembly.received(&key) {
                        self.queue_ack(src_link, hdr.tag(), bitmap);
                    }
                }
            }
        }
        Ok(())
    }

    fn reject(
        &mut self,
        src_link: LinkAddr,
        hdr: &FragmentDescriptor,
        e: ReassemblyError,
        fatal: bool,
    ) {
        warn!(
            "fragment dropped; tag: {}, seq: {}, offset: {}, {:?}",
            hdr.tag(),
            hdr.seq(),
            hdr.offset(),
            e
        );
        match e {
            ReassemblyError::TableFull => self.stat.table_full += 1,
            ReassemblyError::OutOfMemory => self.stat.out_of_memory += 1,
            ReassemblyError::OutOfHandles => self.stat.out_of_handles += 1,
            ReassemblyError::UnknownFragment => self.stat.unknown_fragments += 1,
            ReassemblyError::Malformed => self.stat.malformed += 1,
            ReassemblyError::Overlap => self.stat.overlaps += 1,
        }
        let unrecoverable = matches!(
            e,
            ReassemblyError::TableFull
                | ReassemblyError::OutOfMemory
                | ReassemblyError::OutOfHandles
                | ReassemblyError::Malformed
        );
        if fatal && unrecoverable && hdr.variant() == FragVariant::SelectiveAck {
            self.queue_ack(src_link, hdr.tag(), AckBitmap::new());
        }
    }

    fn input_ack(
        &mut self,
        now: Instant,
        src_link: LinkAddr,
        bytes: &[u8],
    ) -> Result<(), InputError> {
        let ack = AckHeader::from_bytes(bytes).map_err(InputError::Decoding)?;
        self.stat.acks_received += 1;
        let slot = self.outbound.iter().position(|o| match o {
            Some(dg) => dg.is_tracked() && dg.tag() == ack.tag() && dg.dst_link() == src_link,
            None => false,
        });
        let slot = match slot {
            Some(x) => x,
            None => {
                trace!("ack for no datagram; tag: {}", ack.tag());
                return Ok(());
            }
        };
        if ack.ecn() {
            debug!("congestion echoed; tag: {}", ack.tag());
        }
        let dg = match self.outbound[slot].as_mut() {
            Some(x) => x,
            None => return Ok(()),
        };
        match dg.on_ack(ack.bitmap(), now) {
            Some(code) => self.finish(slot, code),
            None => {
                // a new round is pending; its last fragment restarts the timer
                if !dg.pending().is_empty() {
                    self.timers.cancel(&slot);
                }
            }
        }
        self.check_rep();
        Ok(())
    }

    fn queue_ack(&mut self, dst_link: LinkAddr, tag: u16, bitmap: AckBitmap) {
        let hdr = AckHeaderBuilder {
            tag,
            bitmap,
            ecn: false,
        }
        .build();
        trace!("ack queued; tag: {}, bitmap: {:#010x}", tag, bitmap.bits());
        self.control.push_back(OutgoingFrame {
            dst_link,
            bytes: hdr.to_bytes().to_vec(),
            ticket: None,
        });
        self.stat.acks_sent += 1;
    }

    fn deliver(&mut self, received: ReceivedDatagram) {
        self.stat.datagrams_received += 1;
        self.events.push_back(Event::Received(received));
    }

    fn finish(&mut self, slot: usize, code: ResponseCode) {
        let dg = match self.outbound[slot].take() {
            Some(x) => x,
            None => return,
        };
        self.timers.cancel(&slot);
        let id = dg.id();
        debug!("finished; id: {}, tag: {}, {:?}", id, dg.tag(), code);
        self.arena.release(dg.into_payload());
        self.events.push_back(Event::Response { id, code });
        self.check_rep();
    }
}

#[derive(Default)]
struct LocalStat {
    datagrams_sent: u64,
    fragments_sent: u64,
    retransmissions: u64,
    timeouts: u64,
    acks_sent: u64,
    datagrams_received: u64,
    fragments_received: u64,
    acks_received: u64,
    decoding_errors: u64,
    duplicates: u64,
    table_full: u64,
    out_of_memory: u64,
    out_of_handles: u64,
    unknown_fragments: u64,
    malformed: u64,
    overlaps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub datagrams_sent: u64,
    pub fragments_sent: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub acks_sent: u64,
    pub datagrams_received: u64,
    pub fragments_received: u64,
    pub acks_received: u64,
    pub decoding_errors: u64,
    pub duplicates: u64,
    pub table_full: u64,
    pub out_of_memory: u64,
    pub out_of_handles: u64,
    pub unknown_fragments: u64,
    pub malformed: u64,
    pub overlaps: u64,
    pub arena_used: usize,
    pub arena_handles: usize,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use crate::{
        layer::LayerBuilder,
        protocol::datagram::{DatagramBuilder, ExtHeader},
    };

    use super::*;

    #[test]
    fn test_unbuildable_fragment() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let datagram = DatagramBuilder {
            src: "1::1".parse::<Ipv6Addr>().unwrap(),
            dst: "1::2".parse::<Ipv6Addr>().unwrap(),
            traffic_class: 0,
            flow_label: 0,
            hop_limit: 64,
            headers: vec![ExtHeader::Udp {
                src_port: 0xf012,
                dst_port: 0xf034,
                checksum: None,
            }],
            payload_len: 200,
        }
        .build()
        .unwrap();
        a.send(
            OutboundRequest {
                id: 9,
                datagram,
                src_link: LinkAddr::from_u64(1),
                dst_link: LinkAddr::from_u64(2),
            },
            &[7; 200],
        )
        .unwrap();

        // the layout was fixed for 80-byte frames
        a.max_frame_len = 20;
        assert!(matches!(
            a.poll_frame(now),
            Err(FragmentError::FrameTooSmall)
        ));
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 9,
                code: ResponseCode::LocalFailure
            })
        );
        assert_eq!(a.poll_frame(now).unwrap(), None);
        assert_eq!(a.stat().arena_handles, 0);
    }
}
