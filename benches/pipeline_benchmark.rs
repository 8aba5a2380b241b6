use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{Rgba, RgbaImage};
use slate::{
    EdgeBoxFinder, Frame, Normalizer, NormalizeConfig, QuadDetector, Rectifier, RoiSource,
};

fn synthetic_frame(width: u32, height: u32) -> Frame {
    let (x0, y0) = (width / 5, height / 5);
    let (x1, y1) = (width - x0, height - y0);
    let img = RgbaImage::from_fn(width, height, |x, y| {
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            Rgba([235, 230, 220, 255])
        } else {
            Rgba([((x * 7 + y * 3) % 40) as u8, 30, 35, 255])
        }
    });
    Frame::new(img).expect("Failed to build frame")
}

fn benchmark_edge_box(c: &mut Criterion) {
    let mut group = c.benchmark_group("edge_box");
    let finder = EdgeBoxFinder::new(Default::default());

    for (w, h) in [(640u32, 360u32), (1280, 720)] {
        let frame = synthetic_frame(w, h);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{w}x{h}")),
            &frame,
            |b, frame| b.iter(|| finder.find(black_box(frame))),
        );
    }

    group.finish();
}

fn benchmark_quad(c: &mut Criterion) {
    let mut group = c.benchmark_group("quad");
    group.sample_size(20);

    let frame = synthetic_frame(640, 480);
    let detector = QuadDetector::new(Default::default());
    let rectifier = Rectifier::new(Default::default());

    group.bench_function("detect_640x480", |b| {
        b.iter(|| detector.detect(black_box(&frame)))
    });

    let quads = detector.detect(&frame);
    if let Some(quad) = quads.first() {
        group.bench_function("rectify_256", |b| {
            b.iter(|| rectifier.rectify(black_box(&frame), quad).expect("rectify failed"))
        });
    }

    group.finish();
}

fn benchmark_normalize(c: &mut Criterion) {
    let frame = synthetic_frame(1280, 720);
    let normalizer = Normalizer::new(NormalizeConfig::default());

    c.bench_function("normalize_224", |b| {
        b.iter(|| normalizer.run(black_box(&frame), RoiSource::None))
    });
}

criterion_group!(benches, benchmark_edge_box, benchmark_quad, benchmark_normalize);
criterion_main!(benches);
