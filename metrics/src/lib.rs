//! Cheap scoped timers for the build phases. Disabled by default; `-v`
//! turns them on and the table is dumped to stderr at exit.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Default)]
struct Metric {
    count: usize,
    total_micros: u128,
}

#[derive(Debug, Default)]
pub struct Metrics {
    metrics: Vec<(&'static str, Metric)>,
}

impl Metrics {
    fn record(&mut self, name: &'static str, elapsed: Duration) {
        let idx = match self.metrics.iter().position(|(n, _)| *n == name) {
            Some(idx) => idx,
            None => {
                self.metrics.push((name, Metric::default()));
                self.metrics.len() - 1
            }
        };
        let metric = &mut self.metrics[idx].1;
        metric.count += 1;
        metric.total_micros += elapsed.as_micros();
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut name_width = 7; // To fit "metric ".
        for (name, _) in &self.metrics {
            name_width = std::cmp::max(name_width, name.len());
        }
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "metric",
            "count",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        for (name, metric) in &self.metrics {
            writeln!(
                f,
                "{:name_width$} {:>6} {:>9.1} {:>11}",
                name,
                metric.count,
                metric.total_micros as f64 / metric.count as f64,
                metric.total_micros,
                name_width = name_width
            )?;
        }
        Ok(())
    }
}

static METRICS: Lazy<Mutex<Metrics>> = Lazy::new(|| Mutex::new(Metrics::default()));
static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn dump() {
    eprint!("{}", &*METRICS.lock().unwrap());
}

pub struct ScopedMetric {
    name: &'static str,
    start: Instant,
}

impl ScopedMetric {
    /// None when metrics are disabled, so the macro costs nothing then.
    pub fn new(name: &'static str) -> Option<ScopedMetric> {
        if is_enabled() {
            Some(ScopedMetric {
                name,
                start: Instant::now(),
            })
        } else {
            None
        }
    }
}

impl Drop for ScopedMetric {
    fn drop(&mut self) {
        METRICS.lock().unwrap().record(self.name, self.start.elapsed());
    }
}

#[macro_export]
macro_rules! scoped_metric {
    ($name:literal) => {
        let _scoped_metric = $crate::ScopedMetric::new($name);
    };
}
