mod http;

use std::sync::Arc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Result, Value};
use tokio::runtime::Handle;

use crate::engine::http_client::HttpClient;

/// Bind the host surface into a virtual user's context: `console.log`,
/// `client.fetch` and the writable `exports` object. Nothing else is
/// exposed.
pub fn register_globals<'js>(
    ctx: &Ctx<'js>,
    client: Arc<HttpClient>,
    handle: Handle,
) -> Result<()> {
    let globals = ctx.globals();

    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            // First argument only; the rest are ignored.
            if let Some(value) = args.first() {
                tracing::info!(target: "script", "{}", display_value(&ctx, value));
            }
        }),
    )?;
    globals.set("console", console)?;

    let exports = Object::new(ctx.clone())?;
    globals.set("exports", exports)?;

    http::register_client(ctx, client, handle)?;

    Ok(())
}

/// Human-readable rendering of a script value, for the operational log.
fn display_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if let Some(b) = value.as_bool() {
        return b.to_string();
    }
    if let Some(i) = value.as_int() {
        return i.to_string();
    }
    if let Some(f) = value.as_float() {
        return f.to_string();
    }
    json_stringify(ctx, value).unwrap_or_else(|| "[object]".to_string())
}

fn json_stringify<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    let json: Object = ctx.globals().get("JSON").ok()?;
    let stringify: Function = json.get("stringify").ok()?;
    stringify.call((value.clone(),)).ok()
}
