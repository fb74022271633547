//! Built-in collaborators
//!
//! Used when no external command is configured:
//! - [`PassthroughPreprocessor`] records the requested processing on each trace
//!   and leaves the samples untouched (for data that was processed upstream)
//! - [`ReportPlotter`] writes a plain-text summary per station and merges them
//!   by concatenation

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::models::window::count_windows;
use crate::models::Stream;
use crate::services::{
    PlotRequest, Plotter, PreprocessParams, Preprocessor, ServiceResult,
};

/// Preprocessor that only annotates traces
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPreprocessor;

#[async_trait]
impl Preprocessor for PassthroughPreprocessor {
    async fn preprocess(
        &self,
        stream: &Stream,
        params: &PreprocessParams,
    ) -> ServiceResult<Stream> {
        let mut out = stream.clone();
        for trace in out.traces.iter_mut() {
            trace.processing.push(format!(
                "passthrough(kind={:?}, bandpass={}-{}s, unit={})",
                params.kind, params.min_period, params.max_period, params.unit_output
            ));
        }
        Ok(out)
    }

    async fn convolve_stf(&self, stream: &Stream, half_duration: f64) -> ServiceResult<Stream> {
        let mut out = stream.clone();
        for trace in out.traces.iter_mut() {
            trace
                .processing
                .push(format!("passthrough_stf(half_duration={})", half_duration));
        }
        Ok(out)
    }
}

/// Plotter that writes text reports
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportPlotter;

const PAGE_BREAK: &str = "\x0c\n";

#[async_trait]
impl Plotter for ReportPlotter {
    fn extension(&self) -> &str {
        "txt"
    }

    async fn render(&self, request: &PlotRequest, output: &Path) -> ServiceResult<()> {
        let mut report = String::new();
        report.push_str(&format!("{}\n", request.title));
        report.push_str(&format!("station: {}\n", request.station));
        report.push_str(&format!("time offset: {:.3} s\n", request.time_offset));
        report.push_str(&format!(
            "traces: {} observed, {} synthetic\n",
            request.observed.len(),
            request.synthetic.len()
        ));
        report.push_str(&format!("windows: {}\n", count_windows(&request.windows)));
        for (component, windows) in &request.windows {
            for (i, w) in windows.iter().enumerate() {
                report.push_str(&format!(
                    "  {}[{}] samples {}-{} cc={:.3} dlnA={:.3} shift={}\n",
                    component, i, w.left, w.right, w.max_cc_value, w.dlna, w.cc_shift
                ));
            }
        }
        match request.misfit {
            Some(misfit) => report.push_str(&format!("misfit: {:.6e}\n", misfit)),
            None => report.push_str("misfit: none\n"),
        }

        tokio::fs::write(output, report)
            .await
            .with_context(|| format!("Write plot report {} failed", output.display()))?;
        Ok(())
    }

    async fn merge(&self, parts: &[PathBuf], output: &Path) -> ServiceResult<()> {
        let mut merged = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                merged.push_str(PAGE_BREAK);
            }
            let text = tokio::fs::read_to_string(part)
                .await
                .with_context(|| format!("Read plot report {} failed", part.display()))?;
            merged.push_str(&text);
        }
        tokio::fs::write(output, merged)
            .await
            .with_context(|| format!("Write merged report {} failed", output.display()))?;
        Ok(())
    }
}
