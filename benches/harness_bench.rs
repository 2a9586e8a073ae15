use std::hint::black_box;
use std::time::Duration;

use anicet::{
    CodecFamily, CodecOutput, CodecSetup, ExperimentConfig, FrameProbe, ResourceScope,
    parse_parameter_string, run_experiment,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn probe_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("probes");
    group.bench_function("frame_probe", |b| {
        b.iter(|| black_box(FrameProbe::start()).finish());
    });
    group.bench_function("resource_scope", |b| {
        b.iter(|| black_box(ResourceScope::start()).finish());
    });
    group.finish();
}

fn parameter_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("parameters");
    for (family, raw) in [
        (CodecFamily::X265, "optimization=opt:preset=ultrafast:rate-control=cqp:qp=30"),
        (CodecFamily::Webp, "quality=90,method=6"),
    ] {
        group.bench_with_input(BenchmarkId::new("parse", family.name()), &raw, |b, raw| {
            b.iter(|| {
                let mut setup = CodecSetup::new(1);
                parse_parameter_string(family.name(), raw, family.descriptors(), &mut setup)
                    .expect("benchmark parameters are valid");
                setup
            });
        });
    }
    group.finish();
}

fn encode_benchmark(c: &mut Criterion) {
    let frame = vec![128u8; 64 * 64 * 3 / 2];
    let mut group = c.benchmark_group("encode_64x64");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Bytes(frame.len() as u64));

    for tag in ["webp", "libjpegturbo", "jpegli"] {
        let config = ExperimentConfig::new(&frame, 64, 64, tag);
        let mut output = CodecOutput::new(false);
        if run_experiment(&config, &mut output).map_or(true, |errors| errors > 0) {
            eprintln!("skipping {tag}: backend not available");
            continue;
        }
        group.bench_function(tag, |b| {
            b.iter(|| {
                let mut output = CodecOutput::new(false);
                run_experiment(&config, &mut output).expect("encode should succeed in benchmark")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, probe_benchmark, parameter_benchmark, encode_benchmark);
criterion_main!(benches);
