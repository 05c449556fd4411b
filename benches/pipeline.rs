//! Integration benchmark for the broadcast processing pipeline.
//!
//! Benchmarks the full application loop using the same patterns as the
//! tests in app.rs: a scripted advertisement source feeding a broadcast scale
//! through run_with_io.

use clap::Parser;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use openscale_ble::app::{LinkProvider, Options, run_with_io};
use openscale_ble::factory::first_match;
use openscale_ble::link::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementSource, Backend, LinkFuture, Links, ScanFilter, Unavailable,
};
use openscale_ble::transport::broadcast::content_hash;
use openscale_ble::{MacAddress, ScannedDeviceInfo};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Stable Yoda1 reading of 72.3 kg.
fn yoda_advert() -> ScannedDeviceInfo {
    let mut info = ScannedDeviceInfo::new(TEST_MAC).with_name("Yoda1");
    info.manufacturer_data
        .insert(0x0A0B, vec![0x02, 0xD3, 0, 0, 0, 0, 0x0D]);
    info
}

/// Replays the same packets on every scan.
struct ScriptedSource {
    packets: Vec<ScannedDeviceInfo>,
}

impl AdvertisementSource for ScriptedSource {
    fn scan(&self, _filter: ScanFilter) -> LinkFuture<'_, mpsc::Receiver<ScannedDeviceInfo>> {
        let packets = self.packets.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            tokio::spawn(async move {
                for packet in packets {
                    if tx.send(packet).await.is_err() {
                        return;
                    }
                }
                tx.closed().await;
            });
            Ok(rx)
        })
    }
}

struct ScriptedLinks(Links);

impl LinkProvider for ScriptedLinks {
    fn open(&self, _backend: Backend) -> LinkFuture<'_, Links> {
        let links = self.0.clone();
        Box::pin(async move { Ok(links) })
    }
}

fn scripted_links(packets: Vec<ScannedDeviceInfo>) -> ScriptedLinks {
    let unavailable = Arc::new(Unavailable("bench"));
    ScriptedLinks(Links {
        advertisements: Arc::new(ScriptedSource { packets }),
        gatt: unavailable.clone(),
        spp: unavailable,
    })
}

fn options(format: &str) -> Options {
    Options::try_parse_from(["openscale-ble", "AA:BB:CC:DD:EE:FF", "--format", format])
        .unwrap_or_else(|e| panic!("bench options: {e}"))
}

/// Benchmark the full application pipeline: scan -> match -> filter -> decode -> write
fn bench_app_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("app_pipeline");
    let rt = Runtime::new().unwrap();

    group.throughput(Throughput::Elements(1));
    for format in ["text", "json"] {
        group.bench_with_input(BenchmarkId::new("yoda_final_reading", format), &format, |b, &format| {
            b.iter(|| {
                let links = scripted_links(vec![yoda_advert()]);
                let mut out = Vec::<u8>::with_capacity(256);
                let mut err = Vec::<u8>::new();

                rt.block_on(async {
                    run_with_io(options(format), &links, &mut out, &mut err)
                        .await
                        .unwrap();
                });

                black_box(out)
            })
        });
    }

    group.finish();
}

/// Benchmark handler lookup for a few advertised names
fn bench_handler_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("handler_match");

    for name in ["Yoda1", "MIBCS", "QN-Scale", "Toothbrush"] {
        let device = ScannedDeviceInfo::new(TEST_MAC).with_name(name);
        group.bench_with_input(BenchmarkId::from_parameter(name), &device, |b, device| {
            b.iter(|| black_box(first_match(black_box(device)).map(|(handler, _)| handler.name())))
        });
    }

    group.finish();
}

/// Benchmark the duplicate-packet hash over growing payloads
fn bench_content_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");

    for size in [8usize, 31, 255] {
        let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(content_hash(black_box(payload), -60)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_app_pipeline, bench_handler_match, bench_content_hash);
criterion_main!(benches);
