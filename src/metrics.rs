use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Proxied requests by cache outcome");
    let vec = IntCounterVec::new(opts, &["cache"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Request latency by cache outcome",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["cache"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache store lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_ORIGIN_FETCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_origin_fetch_total",
        "Shared origin fetches by outcome",
    );
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_origin_fetch_total");
    vec
});

static CACHE_PASSTHROUGH_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_passthrough_total",
        "Entries demoted to passthrough after exceeding the entry size cap",
    )
    .expect("create cache_passthrough_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_passthrough_total");
    counter
});

static CACHE_READER_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_reader_failures_total",
        "Cache readers that stopped before the end of the response",
    );
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_reader_failures_total");
    vec
});

static CACHE_SWEEP_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_sweep_runs_total", "Cache sweeps that ran")
        .expect("create cache_sweep_runs_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_runs_total");
    counter
});

static CACHE_SWEEP_REMOVED_ENTRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_removed_entries_total",
        "Entries evicted by the sweeper",
    )
    .expect("create cache_sweep_removed_entries_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_removed_entries_total");
    counter
});

static CACHE_SWEEP_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_bytes_reclaimed_total",
        "Resident bytes released by the sweeper",
    )
    .expect("create cache_sweep_bytes_reclaimed_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_bytes_reclaimed_total");
    counter
});

static CACHE_RESIDENT_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_resident_bytes", "Response bytes held in memory")
        .expect("create cache_resident_bytes");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_resident_bytes");
    gauge
});

static INFLIGHT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("inflight_connections", "Client connections being served")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_connections");
    gauge
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Upstream errors by kind"),
        &["kind"],
    )
    .expect("create upstream_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn inc_inflight() {
    INFLIGHT_CONNECTIONS.inc();
}

pub fn dec_inflight() {
    INFLIGHT_CONNECTIONS.dec();
}

pub fn record_request(cache: &str, method: &str, status: Option<StatusCode>, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[cache]).inc();
    let class = status.map_or("none", |status| status_class(status.as_u16()));
    REQUEST_STATUS_TOTAL.with_label_values(&[class]).inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[cache])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_origin_fetch(outcome: &str) {
    CACHE_ORIGIN_FETCH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_cache_passthrough() {
    CACHE_PASSTHROUGH_TOTAL.inc();
}

pub fn record_reader_failure(reason: &str) {
    CACHE_READER_FAILURES_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn record_cache_sweep_run() {
    CACHE_SWEEP_RUNS_TOTAL.inc();
}

pub fn record_cache_sweep_removed(entries: u64, bytes: u64) {
    if entries > 0 {
        CACHE_SWEEP_REMOVED_ENTRIES_TOTAL.inc_by(entries);
    }
    if bytes > 0 {
        CACHE_SWEEP_BYTES_RECLAIMED_TOTAL.inc_by(bytes);
    }
}

pub fn set_cache_resident_bytes(bytes: u64) {
    CACHE_RESIDENT_BYTES.set(i64::try_from(bytes).unwrap_or(i64::MAX));
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the registry as plain text on `GET {path}`.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    tracing::info!(address = %addr, path = %path, "metrics endpoint started");
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(
                stream,
                &path,
                METRICS_READ_TIMEOUT,
                METRICS_MAX_REQUEST_BYTES,
            )
            .await
            {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(
    stream: S,
    path: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut budget = max_bytes;
    let request_line = read_limited_line(&mut reader, read_timeout, &mut budget).await?;
    if request_line.is_empty() {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    loop {
        let line = read_limited_line(&mut reader, read_timeout, &mut budget).await?;
        if line.is_empty() || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && target == path {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    let stream = reader.get_mut();
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

/// Reads one line, charging it against the request-wide byte budget.
async fn read_limited_line<R>(
    reader: &mut BufReader<R>,
    read_timeout: Duration,
    budget: &mut usize,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    loop {
        let available = timeout(read_timeout, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out reading metrics request"))??;
        if available.is_empty() {
            if collected.is_empty() {
                break;
            }
            bail!("connection closed inside metrics request");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map_or(available.len(), |idx| idx + 1);
        *budget = budget
            .checked_sub(consume)
            .ok_or_else(|| anyhow!("metrics request exceeded allowed size"))?;
        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        if newline_pos.is_some() {
            break;
        }
    }

    String::from_utf8(collected).map_err(|_| anyhow!("metrics request contained invalid bytes"))
}
