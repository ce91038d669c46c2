/*!
Test harness for the HTTP API.

Builds the real router over a `Config` with scripted telemetry and policy,
a recording transport and a fixed set of broadcast addresses, then drives
it with `tower::ServiceExt::oneshot`.
*/

use crate::stubs::{RecordingTransport, ScriptedPolicy, ScriptedTelemetry, StaticResolver};
use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tower::ServiceExt;
use upswake_kernel::config::Config;
use upswake_kernel::evaluator::Evaluator;
use upswake_kernel::http::{build_router, AppState};
use upswake_kernel::service::WakeService;
use upswake_kernel::state::SharedConfig;
use upswake_kernel::wol::WakeDispatcher;

pub struct TestHarness {
    pub config: SharedConfig,
    pub telemetry: Arc<ScriptedTelemetry>,
    pub policy: Arc<ScriptedPolicy>,
    pub transport: Arc<RecordingTransport>,
    pub service: WakeService,
    router: Router,
}

impl TestHarness {
    /// Every source answers empty telemetry, `always_true`/`always_false` exist,
    /// one interface with broadcast 10.0.0.255.
    pub fn new(config: Config) -> Self {
        Self::with_interfaces(config, vec![Ipv4Addr::new(10, 0, 0, 255)])
    }

    pub fn with_interfaces(config: Config, broadcasts: Vec<Ipv4Addr>) -> Self {
        init_tracing();

        let telemetry = ScriptedTelemetry::new();
        for src in &config.nut_servers {
            telemetry.reply(&src.name, r#"{"ups":[]}"#);
        }
        let policy = ScriptedPolicy::constant();
        let transport = RecordingTransport::new();

        let service = WakeService::new(
            Evaluator::new(telemetry.clone(), policy.clone()),
            WakeDispatcher::new(transport.clone(), Arc::new(StaticResolver(broadcasts))),
        );
        let config = SharedConfig::new(config);
        let router = build_router(AppState {
            config: config.clone(),
            service: service.clone(),
        });

        Self {
            config,
            telemetry,
            policy,
            transport,
            service,
            router,
        }
    }

    pub async fn get(&self, uri: &str) -> Result<(StatusCode, Value)> {
        self.send(Request::get(uri).body(Body::empty())?).await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Result<(StatusCode, Value)> {
        let req = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?;
        self.send(req).await
    }

    pub async fn upswake(&self, mac: &str) -> Result<(StatusCode, Value)> {
        self.post_json("/api/upswake", &serde_json::json!({ "mac": mac })).await
    }

    async fn send(&self, req: Request<Body>) -> Result<(StatusCode, Value)> {
        let resp = self.router.clone().oneshot(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, json))
    }
}

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
