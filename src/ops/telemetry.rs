use crate::audit;
use crate::runtime::RuntimeHandle;
use crate::time::Clock;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Start a minimal HTTP endpoint serving metrics, health, loglevel and admission controls.
pub async fn start_http<C: Clock>(
    bind: &str,
    runtime: RuntimeHandle<C>,
    log_handle: Option<LogHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind telemetry endpoint on {bind}"))?;
    let local = listener
        .local_addr()
        .context("telemetry endpoint has no local address")?;
    tracing::info!("telemetry endpoint listening on {local}");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((mut socket, _addr)) => {
                        let runtime = runtime.clone();
                        let log_handle = log_handle.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_conn(&mut socket, &runtime, log_handle).await {
                                tracing::warn!("telemetry handler error: {err:?}");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!("telemetry accept error: {err:?}");
                    }
                }
            }
        }
    });
    Ok(local)
}

async fn handle_conn<C: Clock>(
    socket: &mut tokio::net::TcpStream,
    runtime: &RuntimeHandle<C>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (status, body, content_type) = match route {
        "/metrics" => (200, collect_metrics(runtime).await, "text/plain"),
        "/readyz" => readyz(runtime).await,
        "/livez" => livez(runtime),
        "/v1/loglevel" => {
            let mut applied = false;
            if let (Some(handle), Some(level)) = (log_handle, param(query, "level")) {
                if let Ok(filter) = EnvFilter::try_new(level) {
                    applied = handle.modify(|f| *f = filter).is_ok();
                }
            }
            let status = if applied { "ok" } else { "unchanged" };
            (
                200,
                format!("{{\"status\":\"{status}\"}}"),
                "application/json",
            )
        }
        "/v1/admission/block" => admission_block(runtime, query).await,
        "/v1/admission/unblock" => admission_unblock(runtime, query).await,
        "/v1/admission/throttle" => admission_throttle(runtime, query, true).await,
        "/v1/admission/unthrottle" => admission_throttle(runtime, query, false).await,
        "/v1/admission/stats" => admission_stats(runtime, query).await,
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}

fn json_error(status: u16, message: &str) -> (u16, String, &'static str) {
    (
        status,
        serde_json::json!({ "error": message }).to_string(),
        "application/json",
    )
}

async fn collect_metrics<C: Clock>(runtime: &RuntimeHandle<C>) -> String {
    let mut body = runtime.metrics().render();
    let _ = writeln!(
        body,
        "imcore_connections_local {}",
        runtime.registry().len()
    );
    match runtime.retry().pending().await {
        Ok(pending) => {
            let _ = writeln!(body, "imcore_retry_pending {pending}");
        }
        Err(err) => tracing::debug!("retry backlog unavailable for metrics: {err}"),
    }
    for pool in runtime.pools() {
        let name = pool.name();
        let _ = write!(
            body,
            "imcore_pool_pending{{pool=\"{name}\"}} {}\nimcore_pool_completed_total{{pool=\"{name}\"}} {}\nimcore_pool_dropped_total{{pool=\"{name}\"}} {}\n",
            pool.pending(),
            pool.completed(),
            pool.dropped(),
        );
    }
    let _ = write!(
        body,
        "imcore_audit_events {}\nimcore_audit_evicted_total {}\n",
        audit::sink_len(),
        audit::evicted()
    );
    body
}

/// Ready while accepting connections with a reachable shared store.
pub async fn readyz<C: Clock>(runtime: &RuntimeHandle<C>) -> (u16, String, &'static str) {
    let accepting = runtime.accepting();
    let store_ok = match tokio::time::timeout(Duration::from_secs(1), runtime.retry().pending()).await
    {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            tracing::debug!("readiness store probe failed: {err}");
            false
        }
        Err(_) => false,
    };
    let ready = accepting && store_ok;
    let code = if ready { 200 } else { 503 };
    let body = serde_json::json!({
        "ready": ready,
        "accepting": accepting,
        "store": store_ok,
        "server": runtime.server(),
    });
    (code, body.to_string(), "application/json")
}

pub fn livez<C: Clock>(runtime: &RuntimeHandle<C>) -> (u16, String, &'static str) {
    let body = serde_json::json!({
        "live": true,
        "connections": runtime.registry().len(),
        "dispatch_pending": runtime.dispatcher().pool().pending(),
    });
    (200, body.to_string(), "application/json")
}

async fn admission_block<C: Clock>(
    runtime: &RuntimeHandle<C>,
    query: &str,
) -> (u16, String, &'static str) {
    let Some(ip) = param(query, "ip") else {
        return json_error(400, "ip is required");
    };
    let duration = match param(query, "seconds").map(str::parse::<u64>) {
        None => None,
        Some(Ok(seconds)) if seconds > 0 => Some(Duration::from_secs(seconds)),
        Some(_) => return json_error(400, "seconds must be a positive integer"),
    };
    match runtime.limiter().block_ip(ip, duration).await {
        Ok(()) => {
            let body = serde_json::json!({
                "blocked": ip,
                "seconds": duration.map(|d| d.as_secs()),
            });
            (200, body.to_string(), "application/json")
        }
        Err(err) => json_error(503, &err.to_string()),
    }
}

async fn admission_unblock<C: Clock>(
    runtime: &RuntimeHandle<C>,
    query: &str,
) -> (u16, String, &'static str) {
    let Some(ip) = param(query, "ip") else {
        return json_error(400, "ip is required");
    };
    match runtime.limiter().unblock_ip(ip).await {
        Ok(removed) => {
            let body = serde_json::json!({ "ip": ip, "unblocked": removed });
            (200, body.to_string(), "application/json")
        }
        Err(err) => json_error(503, &err.to_string()),
    }
}

async fn admission_throttle<C: Clock>(
    runtime: &RuntimeHandle<C>,
    query: &str,
    throttle: bool,
) -> (u16, String, &'static str) {
    let Some(ip) = param(query, "ip") else {
        return json_error(400, "ip is required");
    };
    let result = if throttle {
        runtime.flow().throttle_ip(ip).await.map(|()| true)
    } else {
        runtime.flow().unthrottle_ip(ip).await
    };
    match result {
        Ok(changed) => {
            let body = serde_json::json!({ "ip": ip, "throttled": throttle, "changed": changed });
            (200, body.to_string(), "application/json")
        }
        Err(err) => json_error(503, &err.to_string()),
    }
}

async fn admission_stats<C: Clock>(
    runtime: &RuntimeHandle<C>,
    query: &str,
) -> (u16, String, &'static str) {
    let ip = param(query, "ip");
    let connections = match runtime.limiter().connection_stats(ip).await {
        Ok(stats) => stats,
        Err(err) => return json_error(503, &err.to_string()),
    };
    let flow = match ip {
        Some(ip) => match runtime.flow().flow_stats(ip).await {
            Ok(stats) => Some(stats),
            Err(err) => return json_error(503, &err.to_string()),
        },
        None => None,
    };
    let body = serde_json::json!({ "connections": connections, "flow": flow });
    (200, body.to_string(), "application/json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_are_matched_by_name() {
        let query = "ip=10.0.0.1&seconds=30&empty=";
        assert_eq!(param(query, "ip"), Some("10.0.0.1"));
        assert_eq!(param(query, "seconds"), Some("30"));
        assert_eq!(param(query, "empty"), None);
        assert_eq!(param(query, "missing"), None);
        assert_eq!(param("", "ip"), None);
    }
}
