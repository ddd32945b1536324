mod adaptation;
mod fragmenter;
mod reassembly;
mod retransmit;

pub use adaptation::*;
pub use fragmenter::*;
pub use reassembly::*;
pub use retransmit::*;

use crate::{
    protocol::frag_hdr::FragVariant,
    utils::{ArenaBuilder, EstimatorError, RttEstimatorBuilder},
};

pub struct LayerBuilder {
    pub arena_len: usize,
    pub arena_handles: usize,
    pub outbound_entries: usize,
    pub reassembly_entries: usize,
    /// Liveness ticks after which an idle reassembly record is freed
    pub reassembly_ticks: u32,
    pub max_rounds: u32,
    pub max_frame_len: usize,
    pub variant: FragVariant,
    pub rtt: RttEstimatorBuilder,
}

impl LayerBuilder {
    pub fn build(self) -> Result<Lowpan, BuildError> {
        if self.outbound_entries == 0 || self.reassembly_entries == 0 {
            return Err(BuildError::EmptyTable);
        }
        if self.reassembly_ticks == 0 {
            return Err(BuildError::ReassemblyTicks);
        }
        // one range per outbound datagram and per reassembly record
        if self.arena_handles < self.outbound_entries + self.reassembly_entries {
            return Err(BuildError::ArenaHandles);
        }
        if self.max_frame_len < self.variant.subsequent_hdr_len() + 8 {
            return Err(BuildError::FrameTooSmall);
        }
        let estimator = self.rtt.build().map_err(|e| BuildError::Rtt(e))?;
        let arena = ArenaBuilder {
            len: self.arena_len,
            handles: self.arena_handles,
        }
        .build();
        let lowpan = LowpanBuilder {
            arena,
            outbound_entries: self.outbound_entries,
            reassembly: ReassemblyTable::new(self.reassembly_entries, self.reassembly_ticks),
            variant: self.variant,
            max_frame_len: self.max_frame_len,
            max_rounds: self.max_rounds,
            estimator,
        }
        .build();
        Ok(lowpan)
    }

    pub fn default() -> Self {
        LayerBuilder {
            arena_len: 2000,
            arena_handles: 23,
            outbound_entries: 4,
            reassembly_entries: 10,
            reassembly_ticks: 2,
            max_rounds: 15,
            max_frame_len: 80,
            variant: FragVariant::SelectiveAck,
            rtt: RttEstimatorBuilder::default(),
        }
    }
}

#[derive(Debug)]
pub enum BuildError {
    EmptyTable,
    ReassemblyTicks,
    ArenaHandles,
    FrameTooSmall,
    Rtt(EstimatorError),
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv6Addr,
        time::{Duration, Instant},
    };

    use crate::protocol::{
        addr::{link_local, LinkAddr},
        datagram::{Datagram, DatagramBuilder, ExtHeader},
        frag_hdr::FragmentDescriptor,
    };

    use super::*;

    const A_LINK: LinkAddr = LinkAddr([0x02, 0, 0, 0, 0, 0, 0, 0x0a]);
    const B_LINK: LinkAddr = LinkAddr([0x02, 0, 0, 0, 0, 0, 0, 0x0b]);

    fn scenario_datagram() -> (Datagram, Vec<u8>) {
        let dg = DatagramBuilder {
            src: "1::1".parse::<Ipv6Addr>().unwrap(),
            dst: "1::2".parse::<Ipv6Addr>().unwrap(),
            traffic_class: 0x12,
            flow_label: 0x12345,
            hop_limit: 1,
            headers: vec![ExtHeader::Udp {
                src_port: 0xf012,
                dst_port: 0xf034,
                checksum: None,
            }],
            payload_len: 300,
        }
        .build()
        .unwrap();
        let payload = (0..300).map(|i: usize| (i % 256) as u8).collect();
        (dg, payload)
    }

    fn request(id: u64, datagram: Datagram) -> OutboundRequest {
        OutboundRequest {
            id,
            datagram,
            src_link: A_LINK,
            dst_link: B_LINK,
        }
    }

    /// Polls every frame, reporting link success for each.
    fn drain(now: Instant, layer: &mut Lowpan) -> Vec<OutgoingFrame> {
        let mut frames = vec![];
        while let Some(frame) = layer.poll_frame(now).unwrap() {
            if let Some(ticket) = frame.ticket {
                layer.link_response(ticket, true);
            }
            frames.push(frame);
        }
        frames
    }

    fn expect_received(layer: &mut Lowpan) -> ReceivedDatagram {
        match layer.poll_event() {
            Some(Event::Received(received)) => received,
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_scenario_a() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        let tag = a.send(request(1, dg.clone()), &payload).unwrap();
        let frames = drain(now, &mut a);
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.bytes.len() <= 80 && f.dst_link == B_LINK));

        for frame in &frames {
            b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
        }
        let received = expect_received(&mut b);
        assert_eq!(received.datagram, dg);
        assert_eq!(received.payload, payload);
        assert_eq!(received.src_link, A_LINK);
        assert_eq!(b.stat().arena_handles, 0);

        let acks = drain(now, &mut b);
        assert_eq!(acks.len(), 1);
        assert_eq!(
            acks[0].bytes,
            vec![
                0xea, // dispatch
                (tag >> 8) as u8, tag as u8, // tag
                0xf8, 0, 0, 0, // bitmap
            ]
        );
        a.input_frame(now + Duration::from_millis(100), B_LINK, A_LINK, &acks[0].bytes)
            .unwrap();
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Success
            })
        );
        assert_eq!(a.poll_event(), None);
        let stat = a.stat();
        assert_eq!(stat.fragments_sent, 5);
        assert_eq!(stat.retransmissions, 0);
        assert_eq!(stat.arena_used, 0);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn test_scenario_b() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg.clone()), &payload).unwrap();
        let frames = drain(now, &mut a);
        for (i, frame) in frames.iter().rev().enumerate() {
            assert_eq!(b.poll_event(), None);
            b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
            assert_eq!(b.stat().datagrams_received, (i == frames.len() - 1) as u64);
        }
        let received = expect_received(&mut b);
        assert_eq!(received.datagram, dg);
        assert_eq!(received.payload, payload);

        // one ack for the early ack request, one on completion
        let acks = drain(now, &mut b);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].bytes[3..], [0x08, 0, 0, 0]);
        for ack in &acks {
            a.input_frame(now, B_LINK, A_LINK, &ack.bytes).unwrap();
        }
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Success
            })
        );
    }

    #[test]
    fn test_scenario_e() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg), &payload).unwrap();
        for frame in drain(now, &mut a) {
            b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
        }
        let deadline = a.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(3000));
        // held back until after the timeout
        let delayed = drain(now, &mut b);
        assert_eq!(delayed.len(), 1);

        a.on_timer(deadline);
        assert_eq!(a.stat().timeouts, 1);
        let retx = drain(deadline, &mut a);
        assert_eq!(retx.len(), 1);
        let hdr = FragmentDescriptor::from_bytes(&retx[0].bytes).unwrap();
        assert_eq!(hdr.seq(), 4);
        assert!(hdr.ack_request());
        assert_eq!(a.stat().retransmissions, 1);
        // no sample was taken, the timeout keeps its initial value
        assert_eq!(
            a.next_deadline(),
            Some(deadline + Duration::from_millis(3000))
        );

        // the receiver already delivered and answers again
        b.input_frame(deadline, A_LINK, B_LINK, &retx[0].bytes).unwrap();
        assert_eq!(b.stat().duplicates, 1);
        assert_eq!(drain(deadline, &mut b).len(), 1);

        a.input_frame(
            deadline + Duration::from_millis(100),
            B_LINK,
            A_LINK,
            &delayed[0].bytes,
        )
        .unwrap();
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Success
            })
        );
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn test_partial_ack_after_timeout() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg.clone()), &payload).unwrap();
        let frames = drain(now, &mut a);
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            if i != 2 {
                b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
            }
        }
        // held back until after the timeout
        let delayed = drain(now, &mut b);
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].bytes[3..], [0xd8, 0, 0, 0]);

        let deadline = a.next_deadline().unwrap();
        a.on_timer(deadline);
        let later = deadline + Duration::from_millis(100);
        a.input_frame(later, B_LINK, A_LINK, &delayed[0].bytes)
            .unwrap();
        assert_eq!(a.poll_event(), None);

        // the ack replaces the planned resend of seq 4
        let retx = drain(later, &mut a);
        assert_eq!(retx.len(), 1);
        let hdr = FragmentDescriptor::from_bytes(&retx[0].bytes).unwrap();
        assert_eq!(hdr.seq(), 2);
        assert!(hdr.ack_request());
        assert_eq!(
            a.next_deadline(),
            Some(later + Duration::from_millis(3000))
        );

        b.input_frame(later, A_LINK, B_LINK, &retx[0].bytes).unwrap();
        let received = expect_received(&mut b);
        assert_eq!(received.datagram, dg);
        assert_eq!(received.payload, payload);
        for ack in drain(later, &mut b) {
            a.input_frame(later, B_LINK, A_LINK, &ack.bytes).unwrap();
        }
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Success
            })
        );
        assert_eq!(a.next_deadline(), None);
        assert_eq!(a.stat().arena_handles, 0);
    }

    #[test]
    fn test_completed_key_reuse() {
        let now = Instant::now();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        // every sender starts its tags at 0, as after a reboot
        let exchange = |b: &mut Lowpan, payload: &[u8], reverse: bool| {
            let mut a = LayerBuilder::default().build().unwrap();
            a.send(request(1, dg.clone()), payload).unwrap();
            let mut frames = drain(now, &mut a);
            if reverse {
                frames.reverse();
            }
            for frame in &frames {
                b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
            }
            for ack in drain(now, b) {
                a.input_frame(now, B_LINK, A_LINK, &ack.bytes).unwrap();
            }
            assert_eq!(
                a.poll_event(),
                Some(Event::Response {
                    id: 1,
                    code: ResponseCode::Success
                })
            );
        };

        exchange(&mut b, &payload, false);
        assert_eq!(expect_received(&mut b).payload, payload);

        // a new first fragment under the same key starts over
        let second: Vec<u8> = payload.iter().rev().copied().collect();
        exchange(&mut b, &second, false);
        assert_eq!(expect_received(&mut b).payload, second);

        // the remembered completion expires like a record
        assert_eq!(b.tick(), 0);
        assert_eq!(b.tick(), 0);
        let third = vec![0x5a; 300];
        exchange(&mut b, &third, true);
        assert_eq!(expect_received(&mut b).payload, third);
        assert_eq!(b.poll_event(), None);
        assert_eq!(b.stat().arena_handles, 0);
    }

    #[test]
    fn test_single_frame() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let dg = DatagramBuilder {
            src: link_local(A_LINK.iid()),
            dst: link_local(B_LINK.iid()),
            traffic_class: 0,
            flow_label: 0,
            hop_limit: 64,
            headers: vec![ExtHeader::Udp {
                src_port: 0xf0b1,
                dst_port: 0xf0b2,
                checksum: None,
            }],
            payload_len: 10,
        }
        .build()
        .unwrap();
        let payload = vec![9; 10];

        a.send(request(3, dg.clone()), &payload).unwrap();
        let frames = drain(now, &mut a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes[0] & 0xe0, 0x60);
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 3,
                code: ResponseCode::Success
            })
        );

        b.input_frame(now, A_LINK, B_LINK, &frames[0].bytes).unwrap();
        let received = expect_received(&mut b);
        assert_eq!(received.datagram, dg);
        assert_eq!(received.payload, payload);
        assert!(drain(now, &mut b).is_empty());
    }

    #[test]
    fn test_retries_exhausted() {
        let mut now = Instant::now();
        let mut a = LayerBuilder {
            max_rounds: 2,
            ..LayerBuilder::default()
        }
        .build()
        .unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg), &payload).unwrap();
        assert_eq!(drain(now, &mut a).len(), 5);
        for _ in 0..2 {
            now = a.next_deadline().unwrap();
            a.on_timer(now);
            assert_eq!(drain(now, &mut a).len(), 1);
            assert_eq!(a.poll_event(), None);
        }
        now = a.next_deadline().unwrap();
        a.on_timer(now);
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::RetriesExhausted
            })
        );
        assert_eq!(a.stat().arena_handles, 0);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn test_receiver_abort() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder {
            arena_len: 100,
            ..LayerBuilder::default()
        }
        .build()
        .unwrap();
        let (dg, payload) = scenario_datagram();

        let tag = a.send(request(1, dg), &payload).unwrap();
        let frames = drain(now, &mut a);
        assert_eq!(
            b.input_frame(now, A_LINK, B_LINK, &frames[0].bytes),
            Err(InputError::Reassembly(ReassemblyError::OutOfMemory))
        );
        let acks = drain(now, &mut b);
        assert_eq!(
            acks[0].bytes,
            vec![
                0xea, // dispatch
                (tag >> 8) as u8, tag as u8, // tag
                0, 0, 0, 0, // bitmap
            ]
        );
        a.input_frame(now, B_LINK, A_LINK, &acks[0].bytes).unwrap();
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Aborted
            })
        );
        assert_eq!(a.stat().arena_used, 0);
    }

    #[test]
    fn test_first_fragment_link_failure() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(5, dg), &payload).unwrap();
        let first = a.poll_frame(now).unwrap().unwrap();
        let second = a.poll_frame(now).unwrap().unwrap();
        a.link_response(second.ticket.unwrap(), false);
        assert_eq!(a.poll_event(), None);
        a.link_response(first.ticket.unwrap(), false);
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 5,
                code: ResponseCode::LinkFailure
            })
        );
        assert_eq!(a.poll_frame(now).unwrap(), None);
        assert_eq!(a.stat().arena_handles, 0);
    }

    #[test]
    fn test_rfc4944() {
        let now = Instant::now();
        let builder = || LayerBuilder {
            variant: FragVariant::Rfc4944,
            ..LayerBuilder::default()
        };
        let mut a = builder().build().unwrap();
        let mut b = builder().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg.clone()), &payload).unwrap();
        let frames = drain(now, &mut a);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].bytes[0], 0xc1);
        assert!(frames[1..].iter().all(|f| f.bytes[0] == 0xe1));
        assert_eq!(
            a.poll_event(),
            Some(Event::Response {
                id: 1,
                code: ResponseCode::Success
            })
        );

        for frame in frames.iter().rev() {
            b.input_frame(now, A_LINK, B_LINK, &frame.bytes).unwrap();
        }
        let received = expect_received(&mut b);
        assert_eq!(received.datagram, dg);
        assert_eq!(received.payload, payload);
        assert!(drain(now, &mut b).is_empty());
    }

    #[test]
    fn test_admission() {
        let mut a = LayerBuilder {
            outbound_entries: 1,
            ..LayerBuilder::default()
        }
        .build()
        .unwrap();
        let (dg, payload) = scenario_datagram();

        assert_eq!(
            a.send(request(1, dg.clone()), &[0; 2100]),
            Err(SendError::TooLarge)
        );
        a.send(request(2, dg.clone()), &payload).unwrap();
        assert_eq!(
            a.send(request(3, dg), &payload),
            Err(SendError::TableFull)
        );
        assert_eq!(a.poll_event(), None);
    }

    #[test]
    fn test_reassembly_expiry() {
        let now = Instant::now();
        let mut a = LayerBuilder::default().build().unwrap();
        let mut b = LayerBuilder::default().build().unwrap();
        let (dg, payload) = scenario_datagram();

        a.send(request(1, dg), &payload).unwrap();
        let frames = drain(now, &mut a);
        b.input_frame(now, A_LINK, B_LINK, &frames[0].bytes).unwrap();
        assert_eq!(b.stat().arena_handles, 1);
        assert_eq!(b.tick(), 0);
        assert_eq!(b.tick(), 1);
        assert_eq!(b.stat().arena_handles, 0);
        assert_eq!(b.poll_event(), None);
    }

    #[test]
    fn test_unsupported_dispatch() {
        let now = Instant::now();
        let mut b = LayerBuilder::default().build().unwrap();
        assert_eq!(
            b.input_frame(now, A_LINK, B_LINK, &[0x80, 1, 2]),
            Err(InputError::Decoding(
                crate::protocol::DecodingError::Decoding { field: "dispatch" }
            ))
        );
        assert!(b.input_frame(now, A_LINK, B_LINK, &[]).is_err());
        assert_eq!(b.stat().decoding_errors, 2);
    }

    #[test]
    fn test_builder_validation() {
        let result = LayerBuilder {
            outbound_entries: 0,
            ..LayerBuilder::default()
        }
        .build();
        assert!(matches!(result, Err(BuildError::EmptyTable)));
        let result = LayerBuilder {
            arena_handles: 5,
            ..LayerBuilder::default()
        }
        .build();
        assert!(matches!(result, Err(BuildError::ArenaHandles)));
        let result = LayerBuilder {
            max_frame_len: 12,
            ..LayerBuilder::default()
        }
        .build();
        assert!(matches!(result, Err(BuildError::FrameTooSmall)));
    }
}
