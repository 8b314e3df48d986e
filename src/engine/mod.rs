use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use crate::config::{self, Options};
use crate::stats::Metrics;

pub mod executor;
pub mod http_client;
pub mod pool;
pub mod vu;

use http_client::HttpClient;
use pool::UserPool;

/// Orchestrates a whole test run: one options pre-pass, one metrics
/// aggregator, one HTTP client, one user pool sized for the busiest stage,
/// then the stages in order.
pub struct Engine {
    options: Options,
    pool: UserPool,
    metrics: Arc<Metrics>,
    // Drives all HTTP I/O; workers block on its handle. Declared last so the
    // pool's scripting contexts drop before the reactor.
    _runtime: tokio::runtime::Runtime,
}

impl Engine {
    pub fn from_script(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("error reading script file {}", path.display()))?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &str) -> Result<Self> {
        let options = config::load_options(source)?;
        info!(
            stages = options.stages.len(),
            max_target = options.max_target(),
            "options loaded"
        );

        let _ = rustls::crypto::ring::default_provider().install_default();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build I/O runtime")?;

        let metrics = Arc::new(Metrics::new(options.thresholds.clone()));
        let client = {
            let _guard = runtime.enter();
            Arc::new(HttpClient::with_capacity(metrics.clone(), options.max_target())?)
        };

        let pool = UserPool::build(
            options.max_target(),
            source,
            client,
            runtime.handle().clone(),
        )?;

        Ok(Self {
            options,
            pool,
            metrics,
            _runtime: runtime,
        })
    }

    /// Run every stage, then print the summary and threshold verdicts.
    /// Returns whether every evaluated threshold passed.
    pub fn run(&self, progress: bool) -> Result<bool> {
        let mut carry = 0usize;
        for (i, stage) in self.options.stages.iter().enumerate() {
            let timing = stage.timing()?;
            info!(
                stage = i + 1,
                target = stage.target,
                duration = %stage.duration,
                "starting stage"
            );
            carry = executor::run_stage(stage.target, timing, carry, &self.pool, progress);
            info!(stage = i + 1, "stage completed");
        }

        info!("load test completed, checking thresholds");
        Ok(self.metrics.report())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serve every connection with the given status; alternates between the
    /// provided statuses when more than one is passed.
    fn fixture(rt: &tokio::runtime::Runtime, statuses: &'static [u16]) -> SocketAddr {
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let hits = hits.clone();
                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(move |_req| {
                            let hits = hits.clone();
                            async move {
                                let i = hits.fetch_add(1, Ordering::Relaxed);
                                let status = statuses[i % statuses.len()];
                                let response = http::Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from_static(b"ok")))
                                    .unwrap();
                                Ok::<_, std::convert::Infallible>(response)
                            }
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            });
            addr
        })
    }

    #[test]
    fn single_stage_run_passes_its_thresholds() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = fixture(&rt, &[200]);

        let script = format!(
            r#"
            exports.options = {{
                stages: [{{ target: 3, duration: "2s" }}],
                thresholds: {{ http_req_failed: ["rate<0.01"] }}
            }};
            exports.loadTest = function (client) {{
                var res = client.fetch({{ url: "http://{addr}/" }});
                if (res.statusCode !== 200) {{
                    throw new Error("unexpected status " + res.statusCode);
                }}
            }};
            "#
        );

        let engine = Engine::from_source(&script).unwrap();
        let passed = engine.run(false).unwrap();
        assert!(passed);

        let rollup = engine.metrics().rollup();
        assert!(rollup.total >= 1, "at least one dispatch tick fired");
        assert!(rollup.total <= 9, "dispatch is bounded by ticks per worker");
        assert_eq!(rollup.failed, 0);
    }

    #[test]
    fn failing_threshold_is_reported_as_failed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = fixture(&rt, &[500]);

        let script = format!(
            r#"
            exports.options = {{
                stages: [{{ target: 2, duration: "2s" }}],
                thresholds: {{ http_req_failed: ["rate<0.1"] }}
            }};
            exports.loadTest = function (client) {{
                client.fetch({{ url: "http://{addr}/" }});
            }};
            "#
        );

        let engine = Engine::from_source(&script).unwrap();
        let passed = engine.run(false).unwrap();
        assert!(!passed);

        let rollup = engine.metrics().rollup();
        assert!(rollup.total >= 1);
        assert_eq!(rollup.failed, rollup.total);
        assert_eq!(rollup.status_codes.get(&500), Some(&rollup.total));
    }

    #[test]
    fn status_distribution_covers_alternating_codes() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = fixture(&rt, &[200, 500]);

        let script = format!(
            r#"
            exports.options = {{ stages: [{{ target: 2, duration: "3s" }}] }};
            exports.loadTest = function (client) {{
                client.fetch({{ url: "http://{addr}/" }});
            }};
            "#
        );

        let engine = Engine::from_source(&script).unwrap();
        engine.run(false).unwrap();

        let rollup = engine.metrics().rollup();
        let counted: usize = rollup.status_codes.values().sum();
        assert_eq!(counted, rollup.total);
    }

    #[test]
    fn consecutive_stages_share_the_pool_and_accumulate_metrics() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = fixture(&rt, &[200]);

        let script = format!(
            r#"
            exports.options = {{
                stages: [
                    {{ target: 2, duration: "2s" }},
                    {{ target: 3, duration: "2s", rampUp: "1s" }}
                ]
            }};
            exports.loadTest = function (client) {{
                client.fetch({{ url: "http://{addr}/" }});
            }};
            "#
        );

        let engine = Engine::from_source(&script).unwrap();
        let passed = engine.run(false).unwrap();
        // No thresholds configured: nothing to fail.
        assert!(passed);

        let rollup = engine.metrics().rollup();
        assert!(rollup.total >= 2, "both stages dispatched work");
        assert_eq!(rollup.failed, 0);
    }

    #[test]
    fn invalid_script_fails_before_any_stage() {
        assert!(Engine::from_source("exports.loadTest = 42;").is_err());
        assert!(Engine::from_source(
            "exports.options = { stages: [] }; exports.loadTest = function (c) {};"
        )
        .is_err());
    }
}
