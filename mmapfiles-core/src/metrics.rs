use serde::Serialize;
use mmapfiles_io::ZeroInit;

/// Running totals of one worker. Lives in memory shared with the supervisor.
///
/// # Invariants
/// Every field only ever grows. Nothing in the worker resets it; a restarted
/// worker keeps accumulating into the same block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MmapMetrics {
    pub mmap_page_count: f64,
    pub mmap_count: f64,
    pub mmap_duration: f64,
    pub munmap_page_count: f64,
    pub munmap_count: f64,
    pub munmap_duration: f64,
}

// SAFETY: repr(C) block of f64, all-zero is 0.0 everywhere.
unsafe impl ZeroInit for MmapMetrics {}

/// Pages spanned by a mapping of `len` bytes.
pub fn pages_for(len: usize, page_size: usize) -> f64 {
    len.div_ceil(page_size) as f64
}

impl MmapMetrics {
    pub fn record_map(&mut self, len: usize, duration: f64, page_size: usize) {
        self.mmap_count += 1.0;
        self.mmap_duration += duration;
        self.mmap_page_count += pages_for(len, page_size);
    }

    pub fn record_unmap(&mut self, len: usize, duration: f64, page_size: usize) {
        self.munmap_count += 1.0;
        self.munmap_duration += duration;
        self.munmap_page_count += pages_for(len, page_size);
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport::from(self)
    }
}

/// Derived rates, as printed by the reporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    pub mmaps_per_sec: f64,
    pub munmaps_per_sec: f64,
    pub mmap_pages_per_sec: f64,
    pub munmap_pages_per_sec: f64,
    pub pages_per_mapping: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

impl From<&MmapMetrics> for MetricsReport {
    fn from(m: &MmapMetrics) -> Self {
        Self {
            mmaps_per_sec: ratio(m.mmap_count, m.mmap_duration),
            munmaps_per_sec: ratio(m.munmap_count, m.munmap_duration),
            mmap_pages_per_sec: ratio(m.mmap_page_count, m.mmap_duration),
            munmap_pages_per_sec: ratio(m.munmap_page_count, m.munmap_duration),
            pages_per_mapping: ratio(m.mmap_page_count, m.mmap_count),
        }
    }
}

impl MetricsReport {
    /// Metric labels in reporting order.
    pub const LABELS: [&'static str; 5] = [
        "file mmaps per sec",
        "file munmap per sec",
        "file pages mmap'd per sec",
        "file pages munmap'd per sec",
        "pages per mapping",
    ];

    pub fn values(&self) -> [f64; 5] {
        [
            self.mmaps_per_sec,
            self.munmaps_per_sec,
            self.mmap_pages_per_sec,
            self.munmap_pages_per_sec,
            self.pages_per_mapping,
        ]
    }

    pub fn labelled(&self) -> impl Iterator<Item = (&'static str, f64)> {
        Self::LABELS.into_iter().zip(self.values())
    }

    /// Combines per-instance reports metric by metric with the harmonic mean.
    pub fn harmonic_mean(reports: &[MetricsReport]) -> MetricsReport {
        let pick = |i: usize| harmonic_mean(reports.iter().map(|r| r.values()[i]));
        MetricsReport {
            mmaps_per_sec: pick(0),
            munmaps_per_sec: pick(1),
            mmap_pages_per_sec: pick(2),
            munmap_pages_per_sec: pick(3),
            pages_per_mapping: pick(4),
        }
    }
}

/// Harmonic mean of the strictly positive values; `0.0` if there are none.
pub fn harmonic_mean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (n, inv_sum) = values
        .into_iter()
        .filter(|v| *v > 0.0)
        .fold((0usize, 0.0f64), |(n, s), v| (n + 1, s + 1.0 / v));
    if n == 0 { 0.0 } else { n as f64 / inv_sum }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_boundaries() {
        assert_eq!(pages_for(0, 4096), 0.0);
        assert_eq!(pages_for(1, 4096), 1.0);
        assert_eq!(pages_for(4095, 4096), 1.0);
        assert_eq!(pages_for(4096, 4096), 1.0);
        assert_eq!(pages_for(4097, 4096), 2.0);
    }

    #[test]
    fn test_record_map_accumulates() {
        let mut m = MmapMetrics::default();
        m.record_map(4095, 0.5, 4096);
        m.record_map(0, 0.25, 4096);
        assert_eq!(m.mmap_count, 2.0);
        assert_eq!(m.mmap_duration, 0.75);
        assert_eq!(m.mmap_page_count, 1.0);
        assert_eq!(m.munmap_count, 0.0);
    }

    #[test]
    fn test_zero_duration_rates_are_zero() {
        let m = MmapMetrics { mmap_count: 10.0, mmap_page_count: 40.0, ..Default::default() };
        let r = m.report();
        assert_eq!(r.mmaps_per_sec, 0.0);
        assert_eq!(r.mmap_pages_per_sec, 0.0);
        assert_eq!(r.munmaps_per_sec, 0.0);
        // Gated on the count, not on the duration.
        assert_eq!(r.pages_per_mapping, 4.0);
    }

    #[test]
    fn test_rates() {
        let m = MmapMetrics {
            mmap_page_count: 100.0,
            mmap_count: 50.0,
            mmap_duration: 2.0,
            munmap_page_count: 100.0,
            munmap_count: 50.0,
            munmap_duration: 0.5,
        };
        let r = m.report();
        assert_eq!(r.mmaps_per_sec, 25.0);
        assert_eq!(r.munmaps_per_sec, 100.0);
        assert_eq!(r.mmap_pages_per_sec, 50.0);
        assert_eq!(r.munmap_pages_per_sec, 200.0);
        assert_eq!(r.pages_per_mapping, 2.0);
    }

    #[test]
    fn test_empty_metrics_pages_per_mapping() {
        assert_eq!(MmapMetrics::default().report(), MetricsReport::default());
    }

    #[test]
    fn test_harmonic_mean_skips_zeroes() {
        assert_eq!(harmonic_mean(Vec::<f64>::new()), 0.0);
        assert_eq!(harmonic_mean([0.0, 0.0]), 0.0);
        let hm = harmonic_mean([1.0, 0.0, 4.0]);
        assert!((hm - 1.6).abs() < 1e-12);

        let a = MetricsReport { mmaps_per_sec: 2.0, ..Default::default() };
        let b = MetricsReport { mmaps_per_sec: 2.0, pages_per_mapping: 3.0, ..Default::default() };
        let combined = MetricsReport::harmonic_mean(&[a, b]);
        assert_eq!(combined.mmaps_per_sec, 2.0);
        assert_eq!(combined.pages_per_mapping, 3.0);
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_string(&MetricsReport::default()).unwrap();
        assert!(json.contains("\"pages_per_mapping\":0.0"));
    }
}
