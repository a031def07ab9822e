use criterion::criterion_main;


criterion_main!(decode::benches, encode::benches);
