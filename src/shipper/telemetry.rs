//! Shipper telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use std::sync::OnceLock;

struct ShipperInstruments {
    dir_syncs: Counter<u64>,
    dir_sync_failures: Counter<u64>,
    uploads: Counter<u64>,
    upload_failures: Counter<u64>,
}

fn instruments() -> &'static ShipperInstruments {
    static INSTRUMENTS: OnceLock<ShipperInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("tenantstore.shipper");
        ShipperInstruments {
            dir_syncs: meter
                .u64_counter("tenantstore.shipper.dir_syncs")
                .with_description("Total number of dir syncs")
                .init(),
            dir_sync_failures: meter
                .u64_counter("tenantstore.shipper.dir_sync_failures")
                .with_description("Total number of failed dir syncs")
                .init(),
            uploads: meter
                .u64_counter("tenantstore.shipper.uploads")
                .with_description("Total number of uploaded blocks")
                .init(),
            upload_failures: meter
                .u64_counter("tenantstore.shipper.upload_failures")
                .with_description("Total number of block upload failures")
                .init(),
        }
    })
}

pub fn record_dir_sync() {
    instruments().dir_syncs.add(1, &[]);
}

pub fn record_dir_sync_failure() {
    instruments().dir_sync_failures.add(1, &[]);
}

pub fn record_upload() {
    instruments().uploads.add(1, &[]);
}

pub fn record_upload_failures(count: u64) {
    instruments().upload_failures.add(count, &[]);
}
