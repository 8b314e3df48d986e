use std::collections::HashMap;
use std::fmt;

use super::{percentile, Rollup};

/// Outcome of one evaluated threshold predicate. Displays as the verdict
/// line printed on stdout, e.g.
/// `http_req_duration p(95) < 800: PASS (value: 123)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub metric: String,
    pub operator: Op,
    pub threshold: String,
    pub value: String,
    pub pass: bool,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {} (value: {})",
            self.metric,
            self.operator,
            self.threshold,
            if self.pass { "PASS" } else { "FAIL" },
            self.value
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Op {
    fn parse(s: &str) -> Option<Op> {
        match s {
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            "==" => Some(Op::Eq),
            _ => None,
        }
    }

    fn holds<T: PartialOrd>(self, value: T, threshold: T) -> bool {
        match self {
            Op::Lt => value < threshold,
            Op::Le => value <= threshold,
            Op::Gt => value > threshold,
            Op::Ge => value >= threshold,
            Op::Eq => value == threshold,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
        })
    }
}

/// Which duration statistic a predicate targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DurationStat {
    Percentile(u8),
    Min,
    Max,
}

/// Evaluate every recognised predicate against the rollup. Unknown metric
/// keys and unparseable predicates are skipped; everything else yields
/// exactly one verdict.
pub fn evaluate(thresholds: &HashMap<String, Vec<String>>, rollup: &Rollup) -> Vec<Verdict> {
    let mut verdicts = Vec::new();
    for (metric, predicates) in thresholds {
        for predicate in predicates {
            let verdict = match metric.as_str() {
                "http_req_duration" => evaluate_duration(predicate, rollup),
                "http_req_failed" => evaluate_rate(predicate, rollup),
                _ => None,
            };
            verdicts.extend(verdict);
        }
    }
    verdicts
}

fn evaluate_duration(predicate: &str, rollup: &Rollup) -> Option<Verdict> {
    let (stat, op, threshold_ms) = parse_duration_predicate(predicate)?;

    let value = match stat {
        DurationStat::Percentile(k) => percentile(&rollup.durations, k),
        DurationStat::Min => rollup.durations.first().copied(),
        DurationStat::Max => rollup.durations.last().copied(),
    };
    let value_ms = value.unwrap_or_default().as_millis() as i64;

    let label = match stat {
        DurationStat::Percentile(k) => format!("http_req_duration p({k})"),
        DurationStat::Min => "http_req_duration min".to_string(),
        DurationStat::Max => "http_req_duration max".to_string(),
    };

    Some(Verdict {
        metric: label,
        operator: op,
        threshold: threshold_ms.to_string(),
        value: value_ms.to_string(),
        pass: op.holds(value_ms, threshold_ms),
    })
}

/// `"p(<k>) <op> <ms>"` with k in [1, 100], or `"min <op> <ms>"` /
/// `"max <op> <ms>"`. Whitespace-separated, integer milliseconds.
fn parse_duration_predicate(predicate: &str) -> Option<(DurationStat, Op, i64)> {
    let mut parts = predicate.split_whitespace();
    let stat = parts.next()?;
    let op = Op::parse(parts.next()?)?;
    let threshold: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let stat = match stat {
        "min" => DurationStat::Min,
        "max" => DurationStat::Max,
        _ => {
            let k: u8 = stat.strip_prefix("p(")?.strip_suffix(')')?.parse().ok()?;
            if !(1..=100).contains(&k) {
                return None;
            }
            DurationStat::Percentile(k)
        }
    };
    Some((stat, op, threshold))
}

/// `"rate<op><float>"`, no whitespace, e.g. `"rate<0.01"`.
fn evaluate_rate(predicate: &str, rollup: &Rollup) -> Option<Verdict> {
    let rest = predicate.strip_prefix("rate")?;
    let (op, literal) = ["<=", ">=", "==", "<", ">"]
        .iter()
        .find_map(|symbol| rest.strip_prefix(symbol).map(|l| (*symbol, l)))?;
    let op = Op::parse(op)?;
    let threshold: f64 = literal.trim().parse().ok()?;

    let rate = rollup.failure_rate();
    Some(Verdict {
        metric: "http_req_failed rate".to_string(),
        operator: op,
        threshold: threshold.to_string(),
        value: rate.to_string(),
        pass: op.holds(rate, threshold),
    })
}
