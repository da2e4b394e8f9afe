//! Tenant lifecycle telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct TenantInstruments {
    close_checks: Counter<u64>,
    append_rejections: Counter<u64>,
    forced_compactions: Counter<u64>,
    forced_compaction_failures: Counter<u64>,
    deleted_blocks: Counter<u64>,
}

fn instruments() -> &'static TenantInstruments {
    static INSTRUMENTS: OnceLock<TenantInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("tenantstore.tenant");
        TenantInstruments {
            close_checks: meter
                .u64_counter("tenantstore.tenant.close_checks")
                .with_description("Idle close checks by result")
                .init(),
            append_rejections: meter
                .u64_counter("tenantstore.tenant.append_rejections")
                .with_description("Appends rejected by the tenant state")
                .init(),
            forced_compactions: meter
                .u64_counter("tenantstore.tenant.forced_compactions")
                .with_description("Total number of forced head compactions")
                .init(),
            forced_compaction_failures: meter
                .u64_counter("tenantstore.tenant.forced_compaction_failures")
                .with_description("Total number of failed forced head compactions")
                .init(),
            deleted_blocks: meter
                .u64_counter("tenantstore.tenant.deleted_blocks")
                .with_description("Local blocks deleted after shipping")
                .init(),
        }
    })
}

pub fn record_close_check(result: &'static str) {
    instruments()
        .close_checks
        .add(1, &[KeyValue::new("result", result)]);
}

pub fn record_append_rejection(reason: &'static str) {
    instruments()
        .append_rejections
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_forced_compaction(success: bool) {
    instruments().forced_compactions.add(1, &[]);
    if !success {
        instruments().forced_compaction_failures.add(1, &[]);
    }
}

pub fn record_deleted_blocks(count: u64) {
    instruments().deleted_blocks.add(count, &[]);
}
