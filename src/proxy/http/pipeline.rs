use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Error, Result, anyhow};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::cache::{Lookup, Reader, Receiver, build_key, is_cacheable};
use crate::proxy::forward_error::{classify_forward_error, log_forward_error};
use crate::proxy::request::{ParsedRequest, parse_http1_request};

use super::codec::{Http1RequestHead, read_http1_request_head, serialize_request};
use super::forward::{DirectTimeouts, RelayProgress, forward_direct};
use super::respond::{respond_with_access_log, shutdown_stream};

const BAD_GATEWAY_BODY: &[u8] = b"Bad Gateway\n";

/// How a request was served, as reported in the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Attached to an entry that already existed.
    Hit,
    /// Created the entry and started its origin fetch.
    Miss,
    /// Not eligible for the cache.
    Bypass,
    /// The entry had given up caching, so the request went to the origin directly.
    Pass,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
            CacheOutcome::Pass => "pass",
        }
    }
}

enum Route {
    Cached(Reader, CacheOutcome),
    Direct(CacheOutcome),
}

struct RequestLog {
    peer: SocketAddr,
    start: Instant,
    bytes_in: u64,
    client_timeout: Duration,
}

/// Serves one request on a client connection and closes it.
pub async fn handle_http<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = app.settings.clone();
    let mut ctx = RequestLog {
        peer,
        start: Instant::now(),
        bytes_in: 0,
        client_timeout: settings.client_timeout(),
    };
    let mut reader = BufReader::new(stream);

    let head = match read_http1_request_head(
        &mut reader,
        peer,
        settings.client_timeout(),
        settings.client_timeout(),
        settings.max_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => {
            debug!(peer = %peer, "client closed connection without a request");
            return Ok(());
        }
        Err(err) => {
            return reject(reader.get_mut(), &ctx, AccessLogBuilder::new(peer), err).await;
        }
    };
    ctx.bytes_in = head.total_bytes();

    let log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.clone());
    if head.headers.is_chunked() {
        let err = anyhow!("chunked request bodies are not supported");
        return reject(reader.get_mut(), &ctx, log, err).await;
    }
    let request =
        match parse_http1_request(head.method.clone(), &head.target, head.headers.host()) {
            Ok(request) => request,
            Err(err) => return reject(reader.get_mut(), &ctx, log, err).await,
        };
    let log = request.access_log_builder(peer);

    match route(&app, &head, &request, peer) {
        Route::Cached(mut cache_reader, outcome) => {
            let log = log.cache(outcome.as_str());
            let streamed = cache_reader
                .stream_to(
                    reader.get_mut(),
                    settings.io_chunk_size,
                    settings.client_timeout(),
                )
                .await;
            drop(cache_reader);
            match streamed {
                Ok(summary) => {
                    let log = match summary.status {
                        Some(status) => log.status(status),
                        None => log,
                    };
                    log.bytes(ctx.bytes_in, summary.bytes)
                        .elapsed(ctx.start.elapsed())
                        .log();
                    shutdown_stream(reader.get_mut(), ctx.client_timeout).await
                }
                Err(err) => {
                    let sent = err.bytes_sent();
                    fail(reader.get_mut(), &ctx, &request, log, err.into(), sent).await
                }
            }
        }
        Route::Direct(outcome) => {
            let log = log.cache(outcome.as_str());
            let timeouts = DirectTimeouts {
                connect: settings.upstream_connect_timeout(),
                upstream_io: settings.upstream_timeout(),
                client_io: settings.client_timeout(),
            };
            let mut progress = RelayProgress::default();
            let relayed = forward_direct(
                &mut reader,
                &head,
                &request,
                settings.io_chunk_size,
                settings.max_header_size,
                timeouts,
                &mut progress,
            )
            .await;
            ctx.bytes_in += progress.request_body_bytes;
            let log = match progress.upstream_addr {
                Some(addr) => log.upstream_addr(addr.to_string()),
                None => log,
            };
            let log = match progress.status {
                Some(status) => log.status(status),
                None => log,
            };
            match relayed {
                Ok(()) => {
                    log.bytes(ctx.bytes_in, progress.bytes_out)
                        .elapsed(ctx.start.elapsed())
                        .log();
                    shutdown_stream(reader.get_mut(), ctx.client_timeout).await
                }
                Err(err) => {
                    let kind = classify_forward_error(&err);
                    if !kind.is_client_side() {
                        crate::metrics::record_upstream_error(kind.label());
                    }
                    fail(reader.get_mut(), &ctx, &request, log, err, progress.bytes_out).await
                }
            }
        }
    }
}

/// Picks the cached or the direct path. A new entry gets its origin fetch started here.
fn route(
    app: &AppContext,
    head: &Http1RequestHead,
    request: &ParsedRequest,
    peer: SocketAddr,
) -> Route {
    let Some(store) = app.cache.as_ref() else {
        return Route::Direct(CacheOutcome::Bypass);
    };
    if !is_cacheable(&head.method, head.headers.has_body()) {
        return Route::Direct(CacheOutcome::Bypass);
    }
    let key = build_key(&request.host, request.port, &request.path);
    if store.is_full() && !store.contains(&key) {
        debug!(
            key = %key,
            resident = store.total_size(),
            capacity = store.capacity(),
            "cache full; bypassing"
        );
        return Route::Direct(CacheOutcome::Bypass);
    }

    match store.get_or_create(&key, Some(peer)) {
        Lookup::Created(reader) => {
            Receiver::new(
                reader.entry().clone(),
                request.host.clone(),
                request.port,
                serialize_request(head, request),
                app.settings.fetch_limits(),
            )
            .spawn();
            Route::Cached(reader, CacheOutcome::Miss)
        }
        Lookup::Existing(entry) => match entry.attach_reader(Some(peer)) {
            Ok(reader) => Route::Cached(reader, CacheOutcome::Hit),
            Err(err) => {
                debug!(key = %key, error = %err, "fetching directly");
                Route::Direct(CacheOutcome::Pass)
            }
        },
    }
}

/// Answers a request that never reached the origin or the cache.
async fn reject<S>(
    stream: &mut S,
    ctx: &RequestLog,
    log: AccessLogBuilder,
    err: Error,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!(peer = %ctx.peer, error = format!("{err:#}"), "rejecting request");
    respond_with_access_log(
        stream,
        StatusCode::BAD_GATEWAY,
        BAD_GATEWAY_BODY,
        ctx.client_timeout,
        ctx.bytes_in,
        ctx.start.elapsed(),
        log.error_reason("bad_request").error_detail(format!("{err:#}")),
    )
    .await
}

/// Reports a failed exchange. The client gets a `502` only while nothing else has been sent;
/// otherwise the connection is dropped mid-response.
async fn fail<S>(
    stream: &mut S,
    ctx: &RequestLog,
    request: &ParsedRequest,
    log: AccessLogBuilder,
    err: Error,
    bytes_out: u64,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let kind = classify_forward_error(&err);
    log_forward_error(&kind, ctx.peer, &request.host, &err);
    let log = log
        .error_reason(kind.label())
        .error_detail(format!("{err:#}"));
    if kind.wants_gateway_response(bytes_out) {
        return respond_with_access_log(
            stream,
            StatusCode::BAD_GATEWAY,
            BAD_GATEWAY_BODY,
            ctx.client_timeout,
            ctx.bytes_in,
            ctx.start.elapsed(),
            log,
        )
        .await;
    }
    log.bytes(ctx.bytes_in, bytes_out)
        .elapsed(ctx.start.elapsed())
        .log();
    Ok(())
}
