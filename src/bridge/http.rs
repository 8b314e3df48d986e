use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};
use rquickjs::{Array, Ctx, Exception, Function, Object, Result, Value};
use tokio::runtime::Handle;
use tracing::warn;

use crate::engine::http_client::HttpClient;
use crate::stats::ResponseSnapshot;

/// Bind the `client` object with its synchronous `fetch` method. The worker
/// thread parks on the shared I/O runtime while the request completes.
pub fn register_client<'js>(
    ctx: &Ctx<'js>,
    client: Arc<HttpClient>,
    handle: Handle,
) -> Result<()> {
    let client_obj = Object::new(ctx.clone())?;
    client_obj.set(
        "fetch",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, config: Object<'js>| -> Result<Object<'js>> {
                fetch(&ctx, &client, &handle, config)
            },
        ),
    )?;
    ctx.globals().set("client", client_obj)?;
    Ok(())
}

/// `client.fetch(config)`: the dynamic config bag is validated field by
/// field, the request runs on the I/O runtime, and the outcome maps back
/// into the script's value space. Transport and request-construction
/// failures come back as `{ error }`; a missing url is a thrown script
/// error.
fn fetch<'js>(
    ctx: &Ctx<'js>,
    client: &HttpClient,
    handle: &Handle,
    config: Object<'js>,
) -> Result<Object<'js>> {
    let url = match string_entry(&config, "url")? {
        Some(url) if !url.is_empty() => url,
        _ => return Err(Exception::throw_message(ctx, "url is required")),
    };

    let method = string_entry(&config, "method")?.unwrap_or_else(|| "GET".to_string());
    let method = match Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return error_object(ctx, &format!("invalid method {method:?}")),
    };

    let url: Uri = match url.parse() {
        Ok(parsed) => parsed,
        Err(_) => return error_object(ctx, &format!("invalid url {url:?}")),
    };
    if url.scheme().is_none() || url.authority().is_none() {
        return error_object(ctx, "url must be absolute");
    }

    let mut headers = HeaderMap::new();
    if let Some(entries) = config.get::<_, Option<Object>>("headers")? {
        for key in entries.keys::<String>() {
            let key = key?;
            let value: Value = entries.get(&key)?;
            let Some(text) = value.as_string().and_then(|s| s.to_string().ok()) else {
                warn!("skipping non-string value for header {key:?}");
                continue;
            };
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&text),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("skipping invalid header {key:?}"),
            }
        }
    }

    let body = config
        .get::<_, Value>("body")?
        .as_string()
        .and_then(|s| s.to_string().ok())
        .map(Bytes::from)
        .unwrap_or_default();

    match handle.block_on(client.request(method, url, headers, body)) {
        Ok(response) => response_object(ctx, &response),
        Err(message) => error_object(ctx, &message),
    }
}

fn string_entry(config: &Object<'_>, key: &str) -> Result<Option<String>> {
    let value: Value = config.get(key)?;
    Ok(value.as_string().and_then(|s| s.to_string().ok()))
}

fn response_object<'js>(ctx: &Ctx<'js>, response: &ResponseSnapshot) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("statusCode", response.status as i32)?;
    obj.set("statusMessage", response.status_text.as_str())?;

    let headers = Object::new(ctx.clone())?;
    for name in response.headers.keys() {
        let values = Array::new(ctx.clone())?;
        for (i, value) in response.headers.get_all(name).iter().enumerate() {
            values.set(i, value.to_str().unwrap_or_default())?;
        }
        headers.set(name.as_str(), values)?;
    }
    obj.set("headers", headers)?;

    obj.set("body", String::from_utf8_lossy(&response.body).as_ref())?;
    Ok(obj)
}

fn error_object<'js>(ctx: &Ctx<'js>, message: &str) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("error", message)?;
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::StageToken;
    use crate::engine::vu::VirtualUser;
    use crate::stats::Metrics;
    use http_body_util::Full;
    use hyper_util::rt::TokioIo;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn harness() -> (tokio::runtime::Runtime, Arc<HttpClient>, Arc<Metrics>) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let metrics = Arc::new(Metrics::new(HashMap::new()));
        let client = {
            let _guard = rt.enter();
            Arc::new(HttpClient::new(metrics.clone()).unwrap())
        };
        (rt, client, metrics)
    }

    fn echo_fixture(rt: &tokio::runtime::Runtime) -> SocketAddr {
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(|req: http::Request<_>| async move {
                            let echoed = req
                                .headers()
                                .get("x-echo")
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("none")
                                .to_string();
                            let response = http::Response::builder()
                                .header("x-echo", echoed)
                                .body(Full::new(Bytes::from_static(b"pong")))
                                .unwrap();
                            Ok::<_, std::convert::Infallible>(response)
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

    fn run_script(
        script: &str,
    ) -> (tokio::runtime::Runtime, VirtualUser, Arc<Metrics>) {
        let (rt, client, metrics) = harness();
        let vu = VirtualUser::new(script, client, rt.handle().clone()).unwrap();
        let token = StageToken::with_deadline(Instant::now() + Duration::from_secs(60));
        vu.run(&token).unwrap();
        (rt, vu, metrics)
    }

    #[test]
    fn fetch_maps_the_response_into_script_space() {
        let (rt, client, _metrics) = harness();
        let addr = echo_fixture(&rt);
        let script = format!(
            r#"
            var ok = 0;
            exports.loadTest = function (client) {{
                var res = client.fetch({{
                    method: "GET",
                    url: "http://{addr}/",
                    headers: {{ "x-echo": "ping" }}
                }});
                ok = res.statusCode === 200
                    && res.statusMessage === "200 OK"
                    && res.body === "pong"
                    && res.headers["x-echo"][0] === "ping" ? 1 : 0;
            }};
            "#
        );
        let vu = VirtualUser::new(&script, client, rt.handle().clone()).unwrap();
        let token = StageToken::with_deadline(Instant::now() + Duration::from_secs(60));
        vu.run(&token).unwrap();
        assert_eq!(vu.global_i32("ok"), 1);
    }

    #[test]
    fn missing_url_throws_url_is_required() {
        let script = r#"
            var caught = 0;
            exports.loadTest = function (client) {
                try {
                    client.fetch({ method: "GET" });
                } catch (e) {
                    caught = String(e).indexOf("url is required") >= 0 ? 1 : 2;
                }
            };
        "#;
        let (_rt, vu, metrics) = run_script(script);
        assert_eq!(vu.global_i32("caught"), 1);
        // Nothing reached the transport, so nothing was recorded.
        assert_eq!(metrics.request_count(), 0);
    }

    #[test]
    fn empty_url_throws_url_is_required() {
        let script = r#"
            var caught = 0;
            exports.loadTest = function (client) {
                try {
                    client.fetch({ url: "" });
                } catch (e) {
                    caught = 1;
                }
            };
        "#;
        let (_rt, vu, _metrics) = run_script(script);
        assert_eq!(vu.global_i32("caught"), 1);
    }

    #[test]
    fn relative_url_returns_an_error_object_without_a_record() {
        let script = r#"
            var got_error = 0;
            exports.loadTest = function (client) {
                var res = client.fetch({ url: "/just/a/path" });
                got_error = res.error ? 1 : 0;
            };
        "#;
        let (_rt, vu, metrics) = run_script(script);
        assert_eq!(vu.global_i32("got_error"), 1);
        assert_eq!(metrics.request_count(), 0);
    }

    #[test]
    fn transport_failure_returns_an_error_object_and_records() {
        let script = r#"
            var got_error = 0;
            exports.loadTest = function (client) {
                var res = client.fetch({ url: "http://127.0.0.1:1/" });
                got_error = res.error ? 1 : 0;
            };
        "#;
        let (_rt, vu, metrics) = run_script(script);
        assert_eq!(vu.global_i32("got_error"), 1);
        assert_eq!(metrics.request_count(), 1);
        assert_eq!(metrics.rollup().failure_rate(), 1.0);
    }

    #[test]
    fn non_string_header_values_are_skipped() {
        let (rt, client, metrics) = harness();
        let addr = echo_fixture(&rt);
        let script = format!(
            r#"
            var status = 0;
            exports.loadTest = function (client) {{
                var res = client.fetch({{
                    url: "http://{addr}/",
                    headers: {{ "x-echo": 42, "accept": "text/plain" }}
                }});
                status = res.statusCode;
            }};
            "#
        );
        let vu = VirtualUser::new(&script, client, rt.handle().clone()).unwrap();
        let token = StageToken::with_deadline(Instant::now() + Duration::from_secs(60));
        vu.run(&token).unwrap();
        assert_eq!(vu.global_i32("status"), 200);

        // The numeric x-echo header was dropped before the request went out.
        let requests = metrics.rollup();
        assert_eq!(requests.total, 1);
    }

    #[test]
    fn body_is_sent_as_the_raw_request_body() {
        let (rt, client, metrics) = harness();
        let addr = echo_fixture(&rt);
        let script = format!(
            r#"
            exports.loadTest = function (client) {{
                client.fetch({{ method: "POST", url: "http://{addr}/", body: "payload" }});
            }};
            "#
        );
        let vu = VirtualUser::new(&script, client, rt.handle().clone()).unwrap();
        let token = StageToken::with_deadline(Instant::now() + Duration::from_secs(60));
        vu.run(&token).unwrap();

        let rollup = metrics.rollup();
        assert_eq!(rollup.total, 1);
        // "POST" + url + "HTTP/1.1" + "payload"
        assert!(rollup.data_sent >= "payload".len() as u64);
    }
}
