use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total client requests by cache lookup result");
    let vec = IntCounterVec::new(opts, &["cache_lookup"]).expect("create counter vec");
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

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Time from accept until the client was detached",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["cache_lookup"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static BYTES_OUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("client_bytes_out_total", "Bytes delivered to clients")
        .expect("create client_bytes_out_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register client_bytes_out_total");
    counter
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache registry lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_evictions_total",
        "Failed cache entries removed from the registry",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_entries", "Entries currently held by the registry")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

static UPSTREAM_FETCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("upstream_fetches_total", "Upstream fetches started")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register upstream_fetches_total");
    counter
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

static OPEN_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let vec = IntGaugeVec::new(
        Opts::new("open_connections", "Connections monitored by workers"),
        &["role"],
    )
    .expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register open_connections");
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

pub fn record_request(cache_lookup: &str, status: u16, bytes_out: u64, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[cache_lookup]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status)])
        .inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[cache_lookup])
        .observe(elapsed.as_secs_f64());
    if bytes_out > 0 {
        BYTES_OUT_TOTAL.inc_by(bytes_out);
    }
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

pub fn set_cache_entries(count: usize) {
    CACHE_ENTRIES.set(count as i64);
}

pub fn record_upstream_fetch() {
    UPSTREAM_FETCHES_TOTAL.inc();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn connection_opened(role: &str) {
    OPEN_CONNECTIONS.with_label_values(&[role]).inc();
}

pub fn connection_closed(role: &str) {
    OPEN_CONNECTIONS.with_label_values(&[role]).dec();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

/// Bind the scrape endpoint and serve it from a dedicated thread.
pub fn spawn_server(addr: SocketAddr, path: String) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(addr);
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || serve(listener, &path))
        .context("failed to spawn metrics thread")?;
    Ok(local_addr)
}

fn serve(listener: TcpListener, path: &str) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(error = %err, "metrics accept failed");
                continue;
            }
        };
        if let Err(err) = handle_connection(stream, path) {
            tracing::debug!(error = %err, "metrics handler error");
        }
    }
}

fn handle_connection(stream: TcpStream, path: &str) -> Result<()> {
    stream.set_read_timeout(Some(METRICS_READ_TIMEOUT))?;
    handle_stream_with_limits(stream, path, METRICS_MAX_REQUEST_BYTES)
}

fn handle_stream_with_limits<S>(stream: S, path: &str, max_bytes: usize) -> Result<()>
where
    S: Read + Write,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;
    let bytes = read_line_with_limits(
        &mut reader,
        &mut request_line,
        max_bytes,
        &mut total_bytes,
        "reading metrics request line",
    )?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();

    // Consume and ignore headers until empty line.
    loop {
        let mut line = String::new();
        let n = read_line_with_limits(
            &mut reader,
            &mut line,
            max_bytes,
            &mut total_bytes,
            "reading metrics request headers",
        )?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        let body = gather();
        build_response(200, TextEncoder::new().format_type(), body)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    let stream = reader.get_mut();
    stream.write_all(&response)?;
    stream.flush()?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

fn read_line_with_limits<R>(
    reader: &mut BufReader<R>,
    buf: &mut String,
    max_bytes: usize,
    total: &mut usize,
    context: &str,
) -> Result<usize>
where
    R: Read,
{
    if max_bytes == 0 {
        anyhow::bail!("max_bytes must be greater than zero");
    }
    buf.clear();
    let mut collected = Vec::new();
    loop {
        let available = reader
            .fill_buf()
            .with_context(|| format!("failed while {context}"))?;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            anyhow::bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        let remaining = max_bytes
            .checked_sub(*total)
            .ok_or_else(|| anyhow!("metrics request exceeded allowed size"))?;
        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("metrics request length overflow"))?
            > remaining
        {
            anyhow::bail!("metrics request exceeded allowed size");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("metrics request contained invalid bytes"))?;
    let bytes = string.len();
    *total = total
        .checked_add(bytes)
        .ok_or_else(|| anyhow!("metrics request length overflow"))?;
    ensure!(*total <= max_bytes, "metrics request exceeded allowed size");
    *buf = string;
    Ok(bytes)
}
