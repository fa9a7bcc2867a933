//! Action handlers behind `/api?action=<name>`

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::state::AppState;
use crate::cluster::{self, PlanRequest};
use crate::discovery::PeersResponse;
use crate::envelope::{now_secs, Envelope};
use crate::error::{ApiError, ApiResult};
use crate::hosts::{Host, HostFilter};
use crate::rates::{Currency, RateSource};
use crate::sales::NewSale;

/// Every action the router answers; anything else is counted as `unknown`
pub const ACTIONS: &[&str] = &[
    "info",
    "hosts",
    "host",
    "peers",
    "announce",
    "refresh",
    "rates",
    "quote",
    "create_sale",
    "confirm_payment",
    "sale",
    "issue_license",
    "license",
    "commissions",
    "cluster_plan",
    "cluster_extend",
    "metrics",
];

#[derive(Debug, Deserialize)]
struct ConfirmPaymentRequest {
    sale_id: String,
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct IssueLicenseRequest {
    sale_id: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<Envelope<Value>> {
    let metrics = state.metrics.lock().await.snapshot(now_secs());
    Json(Envelope::ok(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_sec": metrics.uptime_sec,
        "requests_total": metrics.requests_total,
        "success_rate": metrics.success_rate(),
        "memory_bytes": metrics.memory_bytes,
    })))
}

/// Single entry point for every action, GET or POST
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let action = params
        .get("action")
        .map(|a| a.trim().to_string())
        .unwrap_or_default();
    let client = client_key(&headers, connect.map(|c| c.0));

    let result = if action.is_empty() {
        Err(ApiError::BadRequest("missing action parameter".to_string()))
    } else {
        debug!(action = %action, method = %method, client = %client, "api request");
        route(&state, &action, &method, &params, &body, &client).await
    };

    let label = if ACTIONS.contains(&action.as_str()) {
        action.as_str()
    } else {
        "unknown"
    };
    state.metrics.lock().await.record(label, result.is_ok());

    match result {
        Ok(data) => Json(Envelope::ok(data)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn route(
    state: &AppState,
    action: &str,
    method: &Method,
    params: &HashMap<String, String>,
    body: &Bytes,
    client: &str,
) -> ApiResult<Value> {
    match action {
        "info" => to_value(state.node.info().await),
        "hosts" => hosts(state, params).await,
        "host" => host(state, params).await,
        "peers" => peers(state).await,
        "announce" => {
            require_post(method, action)?;
            announce(state, body, client).await
        }
        "refresh" => {
            require_post(method, action)?;
            to_value(state.discovery.refresh().await)
        }
        "rates" => to_value(state.rates.get_rates(flag(params, "refresh")).await),
        "quote" => quote(state, params).await,
        "create_sale" => {
            require_post(method, action)?;
            let req: NewSale = json_body(body)?;
            to_value(state.sales.create(req).await?)
        }
        "confirm_payment" => {
            require_post(method, action)?;
            let req: ConfirmPaymentRequest = json_body(body)?;
            to_value(state.sales.confirm_payment(&req.sale_id, &req.tx_hash).await?)
        }
        "sale" => {
            let id = required(params, "id")?;
            to_value(state.sales.get(id).await?)
        }
        "issue_license" => {
            require_post(method, action)?;
            let req: IssueLicenseRequest = json_body(body)?;
            to_value(state.licenses.issue(&req.sale_id).await?)
        }
        "license" => {
            let id = required(params, "id")?;
            let license = state
                .licenses
                .get(id)
                .await
                .ok_or_else(|| ApiError::NotFound(format!("license {}", id)))?;
            to_value(license)
        }
        "commissions" => to_value(state.sales.commissions().await),
        "cluster_plan" => {
            require_post(method, action)?;
            let req: PlanRequest = json_body(body)?;
            to_value(cluster_plan(state, req).await?)
        }
        "cluster_extend" => {
            require_post(method, action)?;
            cluster_extend(state, body).await
        }
        "metrics" => metrics(state).await,
        other => Err(ApiError::NotFound(format!("unknown action: {}", other))),
    }
}

async fn hosts(state: &AppState, params: &HashMap<String, String>) -> ApiResult<Value> {
    let limit = match params.get("limit").map(|l| l.trim()).filter(|l| !l.is_empty()) {
        Some(l) => Some(
            l.parse::<usize>()
                .map_err(|_| ApiError::BadRequest(format!("invalid limit: {}", l)))?,
        ),
        None => None,
    };
    let filter = HostFilter {
        location: params.get("location").cloned(),
        available_only: flag(params, "available_only"),
        enhanced_only: flag(params, "enhanced_only"),
        limit,
    };

    let hosts = state.discovery.hosts(&filter).await;
    Ok(json!({ "count": hosts.len(), "hosts": hosts }))
}

async fn host(state: &AppState, params: &HashMap<String, String>) -> ApiResult<Value> {
    let address = optional(params, "address");
    let domain = optional(params, "domain");
    if address.is_none() && domain.is_none() {
        return Err(ApiError::BadRequest(
            "address or domain parameter required".to_string(),
        ));
    }

    let host = state
        .discovery
        .find(address, domain)
        .await
        .ok_or_else(|| {
            ApiError::NotFound(format!("host {}", address.or(domain).unwrap_or_default()))
        })?;
    to_value(host)
}

async fn peers(state: &AppState) -> ApiResult<Value> {
    to_value(PeersResponse {
        node: state.node.info().await,
        peers: state.discovery.enhanced_peers().await,
    })
}

async fn announce(state: &AppState, body: &Bytes, client: &str) -> ApiResult<Value> {
    if !state.announce_limiter.try_acquire(client).await {
        warn!(client = %client, "announce rate limit exceeded");
        return Err(ApiError::RateLimited(format!(
            "at most {} announcements per {}s",
            state.config.discovery.announce_rate_limit, state.config.discovery.announce_window_secs
        )));
    }
    let host: Host = json_body(body)?;
    to_value(state.discovery.announce(host).await?)
}

async fn quote(state: &AppState, params: &HashMap<String, String>) -> ApiResult<Value> {
    let currency: Currency = required(params, "currency")?
        .parse()
        .map_err(ApiError::BadRequest)?;
    let usd = match optional(params, "usd") {
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid usd amount: {}", raw)))?,
        None => state.rates.license_price_usd(),
    };

    let (amount, rate) = state
        .rates
        .quote(currency, usd)
        .await
        .ok_or_else(|| ApiError::Unavailable(format!("no rate for {}", currency)))?;
    Ok(json!({
        "currency": currency,
        "usd": usd,
        "amount": amount,
        "rate": rate.rate,
        "source": rate.source,
    }))
}

async fn cluster_plan(state: &AppState, req: PlanRequest) -> ApiResult<cluster::ExtensionPlan> {
    let plan = cluster::plan(&req.instances, req.target, state.config.cluster.moment_secs)?;
    let evr = state.rates.get_rates(false).await.rates.remove(&Currency::Evr);
    if let Some(rate) = evr.as_ref().filter(|r| r.source == RateSource::Fallback) {
        debug!(rate = rate.rate, "pricing cluster plan with fallback EVR rate");
    }
    Ok(plan.with_usd(evr.map(|r| r.rate)))
}

async fn cluster_extend(state: &AppState, body: &Bytes) -> ApiResult<Value> {
    let template = &state.config.cluster.extend_command;
    if template.is_empty() {
        return Err(ApiError::Unavailable(
            "lease extension is not configured".to_string(),
        ));
    }
    let req: PlanRequest = json_body(body)?;
    let plan = cluster_plan(state, req).await?;
    let results = cluster::execute(state.runner.as_ref(), template, &plan).await;
    let failed = results.iter().filter(|r| !r.success).count();
    Ok(json!({ "plan": plan, "results": results, "failed": failed }))
}

async fn metrics(state: &AppState) -> ApiResult<Value> {
    let client = state
        .prometheus
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("prometheus is not configured".to_string()))?;
    to_value(client.query_all(&state.config.monitoring.queries).await)
}

/// Rate-limit key: first forwarded address, then the socket peer
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

fn require_post(method: &Method, action: &str) -> ApiResult<()> {
    if method == Method::POST {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("action {} requires POST", action)))
    }
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params
        .get(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn optional<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> ApiResult<&'a str> {
    optional(params, name).ok_or_else(|| ApiError::BadRequest(format!("{} parameter required", name)))
}

fn json_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("JSON body required".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn to_value<T: Serialize>(data: T) -> ApiResult<Value> {
    serde_json::to_value(data).map_err(|e| ApiError::Internal(e.to_string()))
}
