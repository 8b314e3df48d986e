use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;

pub mod thresholds;

pub use thresholds::Verdict;

/// Cloned view of an outgoing request, captured so the wire body stays
/// untouched for the transport.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Cloned view of a response; `status_text` is the full status line text,
/// e.g. "200 OK".
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub proto: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One measured HTTP transaction. Sub-timing pairs are either both present
/// or both absent; when present they fall inside `[start, end]`.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub start: Instant,
    pub end: Instant,
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub wrote_headers: Option<Instant>,
    pub wrote_request: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }

    /// A transaction failed if the transport errored or the server answered
    /// with a 4xx/5xx.
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.response.as_ref().is_some_and(|r| r.status >= 400)
    }
}

/// Process-lifetime request log. Appends are mutex-guarded and O(1);
/// aggregation happens once, after the last stage.
pub struct Metrics {
    requests: Mutex<Vec<RequestRecord>>,
    thresholds: HashMap<String, Vec<String>>,
    test_start: Instant,
}

impl Metrics {
    pub fn new(thresholds: HashMap<String, Vec<String>>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            thresholds,
            test_start: Instant::now(),
        }
    }

    pub fn append(&self, record: RequestRecord) {
        self.requests.lock().push(record);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Single pass over the log, producing everything the summary and the
    /// threshold evaluation need.
    pub fn rollup(&self) -> Rollup {
        let requests = self.requests.lock();
        let elapsed = self.test_start.elapsed();

        let mut rollup = Rollup {
            total: requests.len(),
            elapsed,
            ..Rollup::default()
        };

        for record in requests.iter() {
            rollup.durations.push(record.duration());
            if record.failed() {
                rollup.failed += 1;
            }
            if let Some(response) = &record.response {
                *rollup.status_codes.entry(response.status).or_insert(0) += 1;
                rollup.data_received += estimate_response_size(response);
            }
            rollup.data_sent += estimate_request_size(&record.request);

            push_phase(&mut rollup.dns, record.dns_start, record.dns_done);
            push_phase(&mut rollup.connect, record.connect_start, record.connect_done);
            push_phase(&mut rollup.tls, record.tls_start, record.tls_done);
            push_phase(&mut rollup.ttfb, record.wrote_request, record.first_byte);
        }

        rollup.durations.sort_unstable();
        rollup.dns.sort_unstable();
        rollup.connect.sort_unstable();
        rollup.tls.sort_unstable();
        rollup.ttfb.sort_unstable();
        rollup
    }

    /// Print the summary table and threshold verdicts to stdout. Returns
    /// whether every evaluated threshold passed.
    pub fn report(&self) -> bool {
        let rollup = self.rollup();

        if rollup.total == 0 {
            println!("{}", format_row("Total Requests", "0 (0.00/s)"));
        } else {
            print!("{}", rollup.render());
        }

        println!();
        println!("Threshold Evaluation:");
        let verdicts = thresholds::evaluate(&self.thresholds, &rollup);
        let mut all_passed = true;
        for verdict in &verdicts {
            println!("{verdict}");
            all_passed &= verdict.pass;
        }
        all_passed
    }
}

/// Aggregated view of the request log. Duration lists are sorted ascending.
#[derive(Debug, Default)]
pub struct Rollup {
    pub total: usize,
    pub elapsed: Duration,
    pub durations: Vec<Duration>,
    pub dns: Vec<Duration>,
    pub connect: Vec<Duration>,
    pub tls: Vec<Duration>,
    pub ttfb: Vec<Duration>,
    pub failed: usize,
    pub status_codes: BTreeMap<u16, usize>,
    pub data_sent: u64,
    pub data_received: u64,
}

impl Rollup {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        if self.elapsed.is_zero() {
            0.0
        } else {
            self.total as f64 / self.elapsed.as_secs_f64()
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let elapsed_secs = self.elapsed.as_secs_f64().max(f64::EPSILON);

        out.push_str(&format_row(
            "Total Requests",
            &format!("{} ({:.2}/s)", self.total, self.requests_per_second()),
        ));
        out.push('\n');
        out.push_str(&format_row(
            "Data Sent",
            &format!(
                "{} ({}/s)",
                convert_bytes(self.data_sent),
                convert_bytes((self.data_sent as f64 / elapsed_secs) as u64)
            ),
        ));
        out.push('\n');
        out.push_str(&format_row(
            "Data Received",
            &format!(
                "{} ({}/s)",
                convert_bytes(self.data_received),
                convert_bytes((self.data_received as f64 / elapsed_secs) as u64)
            ),
        ));
        out.push('\n');

        out.push_str(&format_row(
            "HTTP Request Duration",
            &stats_line(&self.durations),
        ));
        out.push('\n');
        out.push_str(&format_row(
            "Percentiles",
            &format!(
                "90th={:7.2}ms, 95th={:7.2}ms, 99th={:7.2}ms",
                millis(percentile(&self.durations, 90)),
                millis(percentile(&self.durations, 95)),
                millis(percentile(&self.durations, 99)),
            ),
        ));
        out.push('\n');
        out.push_str(&format_row("DNS Lookup", &stats_line(&self.dns)));
        out.push('\n');
        out.push_str(&format_row("TCP Connect", &stats_line(&self.connect)));
        out.push('\n');
        out.push_str(&format_row("TLS Handshake", &stats_line(&self.tls)));
        out.push('\n');
        out.push_str(&format_row("Time to First Byte", &stats_line(&self.ttfb)));
        out.push('\n');

        out.push_str("Status Code Distribution:\n");
        for (code, count) in &self.status_codes {
            out.push_str(&format!(
                "  {}: {} ({:.2}%)\n",
                code,
                count,
                *count as f64 / self.total as f64 * 100.0
            ));
        }
        out
    }
}

fn push_phase(list: &mut Vec<Duration>, start: Option<Instant>, done: Option<Instant>) {
    if let (Some(start), Some(done)) = (start, done) {
        list.push(done.duration_since(start));
    }
}

/// Index rule for the k-th percentile of a sorted list:
/// `floor(k/100 * (len - 1))`. k=0 selects the first element, k=100 the last.
pub fn percentile(sorted: &[Duration], k: u8) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let index = (k as f64 / 100.0 * (sorted.len() - 1) as f64).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

fn millis(d: Option<Duration>) -> f64 {
    d.unwrap_or_default().as_secs_f64() * 1000.0
}

fn stats_line(sorted: &[Duration]) -> String {
    let (min, med, max, avg) = match sorted.len() {
        0 => (Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::ZERO),
        len => (
            sorted[0],
            sorted[len / 2],
            sorted[len - 1],
            sorted.iter().sum::<Duration>() / len as u32,
        ),
    };
    format!(
        "min={:7.2}ms, med={:7.2}ms, max={:7.2}ms, avg={:7.2}ms",
        min.as_secs_f64() * 1000.0,
        med.as_secs_f64() * 1000.0,
        max.as_secs_f64() * 1000.0,
        avg.as_secs_f64() * 1000.0,
    )
}

fn format_row(label: &str, value: &str) -> String {
    format!("{label:<25}: {value}")
}

fn convert_bytes(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1.0 {
        format!("{mb:.2} MB")
    } else if kb >= 1.0 {
        format!("{kb:.2} KB")
    } else {
        format!("{bytes} bytes")
    }
}

fn estimate_request_size(request: &RequestSnapshot) -> u64 {
    let mut size = request.method.len() + request.url.len() + request.proto.len();
    for (name, value) in &request.headers {
        size += name.as_str().len() + value.len();
    }
    size += request.body.len();
    size as u64
}

fn estimate_response_size(response: &ResponseSnapshot) -> u64 {
    let mut size = response.status_text.len() + response.proto.len();
    for (name, value) in &response.headers {
        size += name.as_str().len() + value.len();
    }
    size += response.body.len();
    size as u64
}


#[cfg(test)]
mod tests {
    use super::testutil::record;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn percentile_index_rule() {
        let sorted: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 0), Some(Duration::from_millis(1)));
        assert_eq!(percentile(&sorted, 100), Some(Duration::from_millis(10)));
        // floor(0.5 * 9) = 4 -> fifth element
        assert_eq!(percentile(&sorted, 50), Some(Duration::from_millis(5)));
        // floor(0.95 * 9) = 8
        assert_eq!(percentile(&sorted, 95), Some(Duration::from_millis(9)));
        assert_eq!(percentile(&[], 95), None);
    }

    #[test]
    fn percentile_of_single_element() {
        let one = vec![Duration::from_millis(7)];
        assert_eq!(percentile(&one, 0), Some(Duration::from_millis(7)));
        assert_eq!(percentile(&one, 100), Some(Duration::from_millis(7)));
    }

    #[test]
    fn failure_counting() {
        let metrics = Metrics::new(HashMap::new());
        metrics.append(record(Duration::from_millis(10), 200, None));
        metrics.append(record(Duration::from_millis(10), 404, None));
        metrics.append(record(Duration::from_millis(10), 500, None));
        metrics.append(record(Duration::from_millis(10), 0, Some("connection refused")));

        let rollup = metrics.rollup();
        assert_eq!(rollup.total, 4);
        assert_eq!(rollup.failed, 3);
        assert_eq!(rollup.failure_rate(), 0.75);
    }

    #[test]
    fn status_distribution_counts_only_responses() {
        let metrics = Metrics::new(HashMap::new());
        metrics.append(record(Duration::from_millis(10), 200, None));
        metrics.append(record(Duration::from_millis(10), 200, None));
        metrics.append(record(Duration::from_millis(10), 500, None));
        metrics.append(record(Duration::from_millis(10), 0, Some("timeout")));

        let rollup = metrics.rollup();
        let codes: Vec<_> = rollup.status_codes.iter().collect();
        assert_eq!(codes, vec![(&200u16, &2usize), (&500u16, &1usize)]);
        let counted: usize = rollup.status_codes.values().sum();
        assert_eq!(counted, 3);
    }

    #[test]
    fn phases_require_both_boundary_timestamps() {
        let mut half_open = record(Duration::from_millis(10), 200, None);
        let now = half_open.start;
        half_open.dns_start = Some(now);
        // dns_done left unset: must not contribute
        half_open.connect_start = Some(now);
        half_open.connect_done = Some(now + Duration::from_millis(3));

        let metrics = Metrics::new(HashMap::new());
        metrics.append(half_open);
        let rollup = metrics.rollup();
        assert!(rollup.dns.is_empty());
        assert_eq!(rollup.connect, vec![Duration::from_millis(3)]);
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let metrics = Arc::new(Metrics::new(HashMap::new()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    metrics.append(record(Duration::from_millis(1), 200, None));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.request_count(), 2000);
    }

    #[test]
    fn size_estimates_cover_headers_and_body() {
        let mut rec = record(Duration::from_millis(1), 200, None);
        rec.request
            .headers
            .insert("accept", "text/plain".parse().unwrap());

        let metrics = Metrics::new(HashMap::new());
        metrics.append(rec);
        let rollup = metrics.rollup();
        // method + url + proto + "accept" + "text/plain"
        let expected = ("GET".len()
            + "http://example.test/".len()
            + "HTTP/1.1".len()
            + "accept".len()
            + "text/plain".len()) as u64;
        assert_eq!(rollup.data_sent, expected);
        // status text + proto + body "ok"
        assert_eq!(rollup.data_received, ("200 X".len() + "HTTP/1.1".len() + 2) as u64);
    }

    #[test]
    fn empty_run_reports_without_panicking() {
        let metrics = Metrics::new(HashMap::from([(
            "http_req_failed".to_string(),
            vec!["rate<0.01".to_string()],
        )]));
        // No requests recorded: summary must still evaluate the predicate.
        assert!(metrics.report());
    }
}
