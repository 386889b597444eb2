use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

struct FlowMetrics {
    runs: Counter<u64>,
    duration_ms: Histogram<f64>,
    rejected_reports: Counter<u64>,
}

static METRICS: OnceCell<FlowMetrics> = OnceCell::new();

fn handles() -> &'static FlowMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("linkedin_content.flow");
        FlowMetrics {
            runs: meter
                .u64_counter("flow_runs_total")
                .with_description("Total flow runs by status")
                .init(),
            duration_ms: meter
                .f64_histogram("flow_duration_ms")
                .with_description("Flow runtime in milliseconds")
                .init(),
            rejected_reports: meter
                .u64_counter("research_reports_rejected_total")
                .with_description("Research answers that failed report validation")
                .init(),
        }
    })
}

/// Record OTEL metrics for one flow run (no-op if no provider installed).
pub fn record_flow_metrics(status: &str, duration_ms: u64, report_rejected: bool) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.to_string())];

    metrics.runs.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);

    if report_rejected {
        metrics.rejected_reports.add(1, &attrs);
    }
}
