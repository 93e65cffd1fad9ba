//! Command execution.

use crate::Commands;
use baas_client::{Client, ClientConfig, ClientError, Pool, PoolConfig};
use colored::Colorize;
use futures::stream::{self, StreamExt};
use std::io::BufRead;
use std::time::{Duration, Instant};

/// Executes a command and returns the formatted output.
pub async fn execute(
    config: ClientConfig,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Hash { password } => {
            let password = read_password(password)?;
            let client = connect(config).await?;
            let hash = client.hash(&password).await;
            client.close().await;
            Ok(hash?)
        }

        Commands::Compare { password, hash } => {
            let password = read_password(password)?;
            let client = connect(config).await?;
            let matched = client.compare(&password, &hash).await;
            client.close().await;

            if matched? {
                Ok("MATCH".green().to_string())
            } else {
                Ok("NO MATCH".red().to_string())
            }
        }

        Commands::Bench {
            requests,
            concurrency,
            connections,
            max_requests_per_connection,
        } => {
            let pool = Pool::new(
                PoolConfig::new(config)
                    .with_max_connections(connections)
                    .with_max_requests_per_connection(max_requests_per_connection),
            )?;
            let report = bench(&pool, requests, concurrency.max(1)).await;
            pool.disconnect().await;
            Ok(report.render())
        }
    }
}

async fn connect(config: ClientConfig) -> Result<Client, ClientError> {
    Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })
}

/// Returns `arg`, or the first line of stdin when `arg` is "-".
fn read_password(arg: String) -> Result<String, Box<dyn std::error::Error>> {
    if arg != "-" {
        return Ok(arg);
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

struct BenchReport {
    ok: usize,
    busy: usize,
    failed: usize,
    elapsed: Duration,
    latencies: Vec<Duration>,
    first_error: Option<String>,
}

async fn bench(pool: &Pool, requests: usize, concurrency: usize) -> BenchReport {
    let started = Instant::now();
    let results: Vec<(Duration, Result<String, ClientError>)> = stream::iter(0..requests)
        .map(|i| async move {
            let sent = Instant::now();
            let result = pool.hash(&format!("bench-{}", i)).await;
            (sent.elapsed(), result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    let elapsed = started.elapsed();

    let mut report = BenchReport {
        ok: 0,
        busy: 0,
        failed: 0,
        elapsed,
        latencies: Vec::with_capacity(results.len()),
        first_error: None,
    };
    for (latency, result) in results {
        match result {
            Ok(_) => {
                report.ok += 1;
                report.latencies.push(latency);
            }
            Err(ClientError::ServerBusy) => report.busy += 1,
            Err(e) => {
                report.failed += 1;
                report.first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    report.latencies.sort();
    report
}

impl BenchReport {
    fn render(&self) -> String {
        let total = self.ok + self.busy + self.failed;
        let throughput = total as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);

        let mut output = format!(
            "{}\n  Requests: {} ({} ok, {} busy, {} failed)\n  Elapsed: {}\n  Throughput: {:.1} req/s",
            "Benchmark complete".green(),
            total,
            self.ok.to_string().green(),
            self.busy.to_string().yellow(),
            self.failed.to_string().red(),
            format_duration(self.elapsed),
            throughput
        );
        if !self.latencies.is_empty() {
            output.push_str(&format!(
                "\n  Latency p50: {}  p99: {}  max: {}",
                format_duration(percentile(&self.latencies, 50.0)),
                format_duration(percentile(&self.latencies, 99.0)),
                format_duration(percentile(&self.latencies, 100.0)),
            ));
        }
        if let Some(ref err) = self.first_error {
            output.push_str(&format!("\n  {}: {}", "First error".red(), err));
        }
        output
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Formats a duration as a human-readable string.
fn format_duration(d: Duration) -> String {
    if d >= Duration::from_secs(1) {
        format!("{:.2}s", d.as_secs_f64())
    } else if d >= Duration::from_millis(1) {
        format!("{:.2}ms", d.as_secs_f64() * 1000.0)
    } else {
        format!("{}µs", d.as_micros())
    }
}
