//! Aggregated results and the `RESULT` lines printed at the end of a run

use super::stats::Statistics;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnalyzerResults {
    pub psnr: Statistics,
    pub ssim: Statistics,
    pub sender_time: Statistics,
    pub receiver_time: Statistics,
    pub total_delay_incl_network: Statistics,
    pub time_between_rendered_frames: Statistics,
    pub encoded_frame_size: Statistics,
    pub encode_frame_rate: Statistics,
    pub encode_time: Statistics,
    pub encode_usage_percent: Statistics,
    pub media_bitrate: Statistics,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerReport {
    pub test_label: String,
    pub frames_to_process: u64,
    pub frames_processed: u64,
    pub results: AnalyzerResults,
}

fn result_line(metric: &str, label: &str, stats: &Statistics, unit: &str) -> String {
    format!(
        "RESULT {metric}: {label} = {{{:.6}, {:.6}}}{unit}",
        stats.mean(),
        stats.stddev()
    )
}

impl AnalyzerReport {
    pub fn result_lines(&self) -> Vec<String> {
        let r = &self.results;
        let label = self.test_label.as_str();
        vec![
            result_line("psnr", label, &r.psnr, " dB"),
            result_line("ssim", label, &r.ssim, ""),
            result_line("sender_time", label, &r.sender_time, " ms"),
            format!("RESULT dropped_frames: {label} = {} frames", r.dropped_frames),
            result_line("receiver_time", label, &r.receiver_time, " ms"),
            result_line(
                "total_delay_incl_network",
                label,
                &r.total_delay_incl_network,
                " ms",
            ),
            result_line(
                "time_between_rendered_frames",
                label,
                &r.time_between_rendered_frames,
                " ms",
            ),
            result_line("encoded_frame_size", label, &r.encoded_frame_size, " bytes"),
            result_line("encode_frame_rate", label, &r.encode_frame_rate, " fps"),
            result_line("encode_time", label, &r.encode_time, " ms"),
            result_line(
                "encode_usage_percent",
                label,
                &r.encode_usage_percent,
                " percent",
            ),
            result_line("media_bitrate", label, &r.media_bitrate, " bps"),
        ]
    }

    pub fn print(&self) {
        for line in self.result_lines() {
            println!("{line}");
        }
    }

    /// Both means must be strictly above their thresholds.
    pub fn check_thresholds(&self, avg_psnr_threshold: f64, avg_ssim_threshold: f64) -> Result<()> {
        let checks = [
            ("psnr", self.results.psnr.mean(), avg_psnr_threshold),
            ("ssim", self.results.ssim.mean(), avg_ssim_threshold),
        ];
        for (metric, mean, threshold) in checks {
            if mean <= threshold {
                return Err(Error::QualityBelowThreshold {
                    label: self.test_label.clone(),
                    metric,
                    mean,
                    threshold,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> AnalyzerReport {
        let mut results = AnalyzerResults::default();
        results.psnr.add_sample(40.0);
        results.psnr.add_sample(42.0);
        results.ssim.add_sample(0.95);
        results.dropped_frames = 3;
        AnalyzerReport {
            test_label: "net_delay_0_0_plr_0".into(),
            frames_to_process: 10,
            frames_processed: 10,
            results,
        }
    }

    #[test]
    fn prints_metrics_in_order() {
        let lines = report().result_lines();
        assert_eq!(lines.len(), 12);
        assert_eq!(
            lines[0],
            "RESULT psnr: net_delay_0_0_plr_0 = {41.000000, 1.000000} dB"
        );
        assert_eq!(lines[1], "RESULT ssim: net_delay_0_0_plr_0 = {0.950000, 0.000000}");
        assert!(lines[2].starts_with("RESULT sender_time:"));
        assert_eq!(lines[3], "RESULT dropped_frames: net_delay_0_0_plr_0 = 3 frames");
        assert_eq!(
            lines[11],
            "RESULT media_bitrate: net_delay_0_0_plr_0 = {0.000000, 0.000000} bps"
        );
    }

    #[test]
    fn thresholds_are_strict() {
        let report = report();
        assert!(report.check_thresholds(36.0, 0.9).is_ok());
        assert!(matches!(
            report.check_thresholds(41.0, 0.9),
            Err(Error::QualityBelowThreshold { metric: "psnr", .. })
        ));
        assert!(matches!(
            report.check_thresholds(0.0, 0.95),
            Err(Error::QualityBelowThreshold { metric: "ssim", .. })
        ));
    }
}
