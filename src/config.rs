use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use rquickjs::{CatchResultExt, Context, Function, Object, Runtime, Value};
use serde::{Deserialize, Serialize};

/// Test options exported by the scenario script as `exports.options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<String>>,
}

/// One load phase: a target VU count held for `duration`, with optional
/// linear ramps at either end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub target: usize,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_down: Option<String>,
}

/// Parsed timing for a stage. `ramp_up + ramp_down <= duration` holds for
/// every stage that passed validation.
#[derive(Debug, Clone, Copy)]
pub struct StageTiming {
    pub duration: Duration,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
}

impl StageTiming {
    pub fn steady(&self) -> Duration {
        self.duration - self.ramp_up - self.ramp_down
    }
}

impl Stage {
    /// Parse the duration strings. Absent ramps default to zero; present but
    /// malformed ramps are an error.
    pub fn timing(&self) -> Result<StageTiming> {
        let duration = parse_duration(&self.duration)
            .with_context(|| format!("invalid stage duration {:?}", self.duration))?;
        let ramp_up = match &self.ramp_up {
            Some(s) => parse_duration(s)
                .with_context(|| format!("invalid stage ramp-up duration {s:?}"))?,
            None => Duration::ZERO,
        };
        let ramp_down = match &self.ramp_down {
            Some(s) => parse_duration(s)
                .with_context(|| format!("invalid stage ramp-down duration {s:?}"))?,
            None => Duration::ZERO,
        };
        Ok(StageTiming {
            duration,
            ramp_up,
            ramp_down,
        })
    }
}

impl Options {
    /// The pool is sized for the busiest stage.
    pub fn max_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }
}

/// Evaluate the script in a throwaway context and pull `exports.options` out
/// of it. Only `exports` is bound here; virtual users get the full surface.
pub fn load_options(source: &str) -> Result<Options> {
    let runtime = Runtime::new()?;
    let context = Context::full(&runtime)?;

    let options = context.with(|ctx| -> Result<Options> {
        let exports = Object::new(ctx.clone())?;
        ctx.globals().set("exports", exports)?;

        ctx.eval::<Value, _>(source)
            .catch(&ctx)
            .map_err(|e| anyhow!("error running script: {e}"))?;

        let exports: Object = ctx.globals().get("exports")?;
        let options: Value = exports.get("options")?;
        if !options.is_object() {
            bail!("options not found in script");
        }

        let json = json_stringify(&ctx, options)?;
        serde_json::from_str(&json).context("options do not match the expected shape")
    })?;

    runtime.run_gc();
    drop(context);
    drop(runtime);

    validate(&options)?;
    Ok(options)
}

fn validate(options: &Options) -> Result<()> {
    if options.stages.is_empty() {
        bail!("at least one stage is required");
    }
    for (i, stage) in options.stages.iter().enumerate() {
        let describe = || format!("stage {}", i + 1);
        if stage.target == 0 {
            bail!("{}: target must be greater than 0", describe());
        }
        let timing = stage.timing().with_context(describe)?;
        if timing.duration.is_zero() {
            bail!("{}: duration must be greater than 0", describe());
        }
        if timing.ramp_up + timing.ramp_down > timing.duration {
            bail!(
                "{}: ramp-up plus ramp-down exceeds the stage duration",
                describe()
            );
        }
    }
    Ok(())
}

fn json_stringify<'js>(ctx: &rquickjs::Ctx<'js>, value: Value<'js>) -> Result<String> {
    let json: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json.get("stringify")?;
    Ok(stringify.call((value,))?)
}

const UNITS: &[(&str, f64)] = &[
    ("ns", 1e-9),
    ("us", 1e-6),
    ("\u{00b5}s", 1e-6), // µs
    ("\u{03bc}s", 1e-6), // μs
    ("ms", 1e-3),
    ("s", 1.0),
    ("m", 60.0),
    ("h", 3600.0),
];

/// Parse a duration string: one or more decimal-number/unit terms, e.g.
/// "30s", "1.5m", "1h30m", "100ms". A bare "0" is allowed.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut rest = s;
    let mut secs = 0.0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            bail!("invalid duration {input:?}");
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| anyhow!("invalid duration {input:?}"))?;
        rest = &rest[number_len..];

        let (unit, advance) = UNITS
            .iter()
            .find(|(u, _)| rest.starts_with(u))
            .map(|(u, m)| (*m, u.len()))
            .ok_or_else(|| anyhow!("missing or unknown unit in duration {input:?}"))?;
        rest = &rest[advance..];
        secs += value * unit;
    }

    Ok(Duration::from_secs_f64(secs))
}
