use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fourgram::bitmap::Bitmap;
use fourgram::filter::NgramFilter;
fn bench_bitmap(c: &mut Criterion) {
    let data: Vec<u8> = (0u8..=255).cycle().take(1024 * 1024).collect();
    c.bench_function("apply_stream_1mb", |b| {
        b.iter(|| {
            let mut bm = Bitmap::new();
            bm.apply_stream(black_box(&data[..])).unwrap();
            bm
        })
    });
    let mut bm = Bitmap::new();
    bm.apply_stream(&data[..]).unwrap();
    let filter = NgramFilter::any_of(&[b"connection reset".as_ref()]);
    c.bench_function("filter_match_1mb_bitmap", |b| b.iter(|| filter.matches(black_box(&bm))));
}
criterion_group!(benches, bench_bitmap);
criterion_main!(benches);
