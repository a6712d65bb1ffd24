use criterion::{criterion_group, criterion_main, Criterion};

use emberlink::{classify, wrap, unwrap, CbcState, EventType};

const KEY: [u8; 16] = [0x42; 16];
const IV: [u8; 16] = [0x24; 16];

fn bench_wrap_unwrap(c: &mut Criterion) {
    c.bench_function("wrap_unwrap_hello", |b| {
        let mut buf = [0u8; 64];
        b.iter(|| {
            let mut tx = CbcState::new(&KEY, &IV);
            let mut rx = CbcState::new(&KEY, &IV);
            let msglen = emberlink::wire::hello(&mut buf[2..], 0x1234, 1, 2, false);
            let total = wrap(&mut buf, msglen, &mut tx).unwrap();
            unwrap(&mut buf[2..total], &mut rx).unwrap();
            buf[2]
        });
    });
}

fn bench_classify(c: &mut Criterion) {
    let mut buf = [0u8; 128];
    let len = emberlink::wire::event(
        &mut buf,
        0x0001,
        "bench/event/name",
        Some(b"payload"),
        60,
        EventType::Public,
    )
    .unwrap();

    c.bench_function("classify_event", |b| b.iter(|| classify(&buf[..len])));
}

criterion_group!(benches, bench_wrap_unwrap, bench_classify);
criterion_main!(benches);
