use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use rquickjs::{CatchResultExt, Context, Function, Object, Persistent, Runtime, Value};
use tokio::runtime::Handle;

use crate::bridge;
use crate::engine::executor::StageToken;
use crate::engine::http_client::HttpClient;

/// One slot in the user pool: a scripting context with the scenario already
/// evaluated, plus resolved handles to the entry function and the bound
/// `client` object. Script-level state survives across iterations and
/// checkouts; scenarios reset themselves if they need to.
pub struct VirtualUser {
    // Declaration order is drop order: the persistent handles must be freed
    // before the context they were saved into, which must be freed before
    // the runtime that owns it (Rust drops fields top-to-bottom).
    entry: Persistent<Function<'static>>,
    client: Persistent<Object<'static>>,
    context: Context,
    runtime: Runtime,
}

impl std::fmt::Debug for VirtualUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualUser").finish_non_exhaustive()
    }
}

impl VirtualUser {
    pub fn new(script: &str, client: Arc<HttpClient>, handle: Handle) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create scripting runtime")?;
        let context = Context::full(&runtime).context("failed to create scripting context")?;

        let (entry, client_obj) = context.with(|ctx| -> Result<_> {
            bridge::register_globals(&ctx, client, handle)?;

            ctx.eval::<Value, _>(script)
                .catch(&ctx)
                .map_err(|e| anyhow!("failed to run script: {e}"))?;

            let exports: Object = ctx.globals().get("exports")?;
            let entry: Function = exports
                .get("loadTest")
                .map_err(|_| anyhow!("loadTest not found"))?;
            let client_obj: Object = ctx.globals().get("client")?;

            Ok((
                Persistent::save(&ctx, entry),
                Persistent::save(&ctx, client_obj),
            ))
        })?;

        Ok(Self {
            runtime,
            context,
            entry,
            client: client_obj,
        })
    }

    /// Run one iteration. A cancellation observed before the call returns
    /// without invoking the script; a call already underway is never
    /// interrupted.
    pub fn run(&self, cancel: &StageToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.context.with(|ctx| {
            let entry = self.entry.clone().restore(&ctx)?;
            let client = self.client.clone().restore(&ctx)?;
            entry
                .call::<_, ()>((client,))
                .catch(&ctx)
                .map_err(|e| anyhow!("error running load test function: {e}"))
        })
    }
}

impl Drop for VirtualUser {
    fn drop(&mut self) {
        self.runtime.run_gc();
    }
}

// SAFETY: `Runtime` and `Context` are `Send`/`Sync` under the `parallel`
// feature (access is serialized behind rquickjs's own runtime lock). The
// `Persistent` handles reference the same runtime/context and are moved
// alongside it as a single unit by the pool; only one thread ever holds a
// given `VirtualUser` at a time, so no concurrent access to the persisted
// values across threads is possible.
unsafe impl Send for VirtualUser {}

#[cfg(test)]
impl VirtualUser {
    /// Read a numeric global out of the script context.
    pub(crate) fn global_i32(&self, name: &str) -> i32 {
        self.context
            .with(|ctx| ctx.globals().get::<_, i32>(name))
            .unwrap_or(-1)
    }
}
