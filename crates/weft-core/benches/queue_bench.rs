use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use weft_core::link_state::RouterLinkState;
use weft_core::queue::{Sequenced, SequencedQueue};
use weft_core::sequence::SequenceNumber;
use weft_core::types::LinkSide;

struct Payload(#[allow(dead_code)] Vec<u8>);

impl Sequenced for Payload {
    fn size_in_bytes(&self) -> usize {
        self.0.len()
    }
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequenced_queue");

    for count in [64u64, 1024] {
        group.bench_with_input(
            BenchmarkId::new("push_pop_in_order", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    let mut q: SequencedQueue<Payload> = SequencedQueue::new();
                    for n in 0..count {
                        q.push(SequenceNumber(n), Payload(vec![0u8; 32]));
                    }
                    while q.pop().is_some() {}
                    q
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("push_reverse_then_drain", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    let mut q: SequencedQueue<Payload> = SequencedQueue::new();
                    for n in (0..count).rev() {
                        q.push(SequenceNumber(n), Payload(vec![0u8; 32]));
                    }
                    while q.pop().is_some() {}
                    q
                });
            },
        );
    }

    group.bench_function("maybe_skip_fast_path", |b| {
        b.iter(|| {
            let mut q: SequencedQueue<Payload> = SequencedQueue::new();
            for n in 0..1024 {
                q.maybe_skip(SequenceNumber(n));
            }
            q
        });
    });

    group.finish();
}

fn bench_link_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_link_state");

    let state = RouterLinkState::new();
    state.set_side_stable(LinkSide::A);
    state.set_side_stable(LinkSide::B);

    group.bench_function("lock_unlock", |b| {
        b.iter(|| {
            state.try_lock(LinkSide::A);
            state.unlock(LinkSide::A);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_queue, bench_link_state);
criterion_main!(benches);
