use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use weft_core::sequence::SequenceNumber;
use weft_core::types::{NodeName, SublinkId};
use weft_router::wire::{Envelope, HandleType, Message, RouterDescriptor};

fn accept_parcel_envelope(payload_len: usize) -> Envelope {
    Envelope {
        transmit_sequence: 42,
        message: Message::AcceptParcel {
            sublink: SublinkId(12),
            sequence_number: SequenceNumber(7),
            data: vec![0xAB; payload_len],
            handle_types: vec![HandleType::Portal],
            new_routers: vec![RouterDescriptor {
                new_sublink: SublinkId(99),
                next_outgoing_sequence_number: SequenceNumber(3),
                next_incoming_sequence_number: SequenceNumber(4),
                peer_closed: false,
                closed_peer_sequence_length: SequenceNumber(0),
            }],
            num_driver_objects: 0,
        },
    }
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    for (label, payload_len) in [("64B", 64usize), ("4KB", 4096)] {
        let envelope = accept_parcel_envelope(payload_len);
        let encoded = envelope.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encode_accept_parcel", label),
            &envelope,
            |b, envelope| {
                b.iter(|| envelope.encode());
            },
        );
        group.bench_with_input(
            BenchmarkId::new("decode_accept_parcel", label),
            &encoded,
            |b, encoded| {
                b.iter(|| Envelope::decode(encoded).unwrap());
            },
        );
    }

    let control = Envelope {
        transmit_sequence: 1,
        message: Message::BypassPeer {
            sublink: SublinkId(3),
            bypass_target_node: NodeName::new([0x5A; 16]),
            bypass_target_sublink: SublinkId(21),
        },
    };
    let control_encoded = control.encode();
    group.bench_function("encode_bypass_peer", |b| {
        b.iter(|| control.encode());
    });
    group.bench_function("decode_bypass_peer", |b| {
        b.iter(|| Envelope::decode(&control_encoded).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_wire);
criterion_main!(benches);
