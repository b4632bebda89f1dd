use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use regex::Regex;
use serde::Deserialize;

static FRAME_REGEX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<frame\b([^>]*)>"));
static ATTRIBUTE_REGEX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)="([^"]*)""#));

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Datapoint {
    Vmaf,
    Psnr,
    Ssim,
    MsSsim,
}

impl std::fmt::Display for Datapoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Datapoint {
    pub const ALL: [Self; 4] = [Self::Vmaf, Self::Psnr, Self::Ssim, Self::MsSsim];

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Vmaf => "VMAF",
            Self::Psnr => "PSNR",
            Self::Ssim => "SSIM",
            Self::MsSsim => "MS-SSIM",
        }
    }

    /// Upper bound of the chart axis.
    #[must_use]
    pub const fn maximum(&self) -> f64 {
        match self {
            Self::Vmaf | Self::Psnr => 100.0,
            Self::Ssim | Self::MsSsim => 1.0,
        }
    }

    /// Maps a libvmaf metric name onto a datapoint. Both the v1 names and the v2 feature
    /// extractor names are accepted.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim() {
            "vmaf" => Some(Self::Vmaf),
            "psnr" | "psnr_y" => Some(Self::Psnr),
            "ssim" | "float_ssim" => Some(Self::Ssim),
            "ms_ssim" | "float_ms_ssim" => Some(Self::MsSsim),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReportFormat {
    Xml,
    Json,
    Csv,
}

impl ReportFormat {
    /// Picks the format from the file extension, falling back to the first non-whitespace
    /// character of the contents.
    #[must_use]
    pub fn detect(path: &Path, contents: &str) -> Self {
        match path
            .extension()
            .map(|extension| extension.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("xml") => Self::Xml,
            Some("json") => Self::Json,
            Some("csv") => Self::Csv,
            _ => match contents.trim_start().chars().next() {
                Some('<') => Self::Xml,
                Some('{') => Self::Json,
                _ => Self::Csv,
            },
        }
    }
}

#[derive(Deserialize)]
struct JsonFrame {
    metrics: BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct JsonReport {
    frames: Vec<JsonFrame>,
}

fn round(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn empty_series() -> BTreeMap<Datapoint, Vec<f64>> {
    Datapoint::ALL
        .iter()
        .map(|datapoint| (*datapoint, vec![]))
        .collect()
}

fn parse_xml(contents: &str) -> anyhow::Result<BTreeMap<Datapoint, Vec<f64>>> {
    let frame_regex = FRAME_REGEX
        .as_ref()
        .map_err(|err| anyhow!("Unable to compile frame regex: {err}"))?;
    let attribute_regex = ATTRIBUTE_REGEX
        .as_ref()
        .map_err(|err| anyhow!("Unable to compile attribute regex: {err}"))?;

    let mut series = empty_series();

    for frame in frame_regex.captures_iter(contents) {
        let attributes = frame.get(1).map_or("", |attributes| attributes.as_str());

        for attribute in attribute_regex.captures_iter(attributes) {
            let (_, [key, value]) = attribute.extract();

            if let Some(datapoint) = Datapoint::from_key(key) {
                let value: f64 = value
                    .parse()
                    .with_context(|| format!("Unable to parse {key} value '{value}'"))?;

                series.entry(datapoint).or_default().push(round(value));
            }
        }
    }

    Ok(series)
}

fn parse_json(contents: &str) -> anyhow::Result<BTreeMap<Datapoint, Vec<f64>>> {
    let report: JsonReport =
        serde_json::from_str(contents).context("Unable to deserialize JSON VMAF report")?;

    let mut series = empty_series();

    for frame in report.frames {
        for (key, value) in frame.metrics {
            if let Some(datapoint) = Datapoint::from_key(&key) {
                series.entry(datapoint).or_default().push(round(value));
            }
        }
    }

    Ok(series)
}

fn parse_csv(contents: &str) -> anyhow::Result<BTreeMap<Datapoint, Vec<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let columns: Vec<(usize, Datapoint)> = reader
        .headers()
        .context("Unable to read CSV VMAF report header")?
        .iter()
        .enumerate()
        .filter_map(|(index, name)| Datapoint::from_key(name).map(|datapoint| (index, datapoint)))
        .collect();

    let mut series = empty_series();

    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Unable to read CSV VMAF report row {row}"))?;

        for (index, datapoint) in &columns {
            if let Some(value) = record.get(*index).filter(|value| !value.is_empty()) {
                let value: f64 = value.parse().with_context(|| {
                    format!("Unable to parse {datapoint} value '{value}' in row {row}")
                })?;

                series.entry(*datapoint).or_default().push(round(value));
            }
        }
    }

    Ok(series)
}

/// Splits a report name of the form `<distorted>_<model>` where the model part begins at the
/// last `_vmaf`.
#[must_use]
pub fn split_name(stem: &str) -> (String, String) {
    stem.rfind("_vmaf").map_or_else(
        || (stem.to_owned(), "unknown".to_owned()),
        |index| {
            let (name, model) = stem.split_at(index);
            (name.to_owned(), model.trim_start_matches('_').to_owned())
        },
    )
}

#[derive(Clone, Debug)]
pub struct Report {
    path: PathBuf,
    series: BTreeMap<Datapoint, Vec<f64>>,
}

impl Report {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read VMAF report {path:?}"))?;

        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> anyhow::Result<Self> {
        let series = match ReportFormat::detect(path, contents) {
            ReportFormat::Xml => parse_xml(contents),
            ReportFormat::Json => parse_json(contents),
            ReportFormat::Csv => parse_csv(contents),
        }
        .with_context(|| format!("Unable to parse VMAF report {path:?}"))?;

        if series.values().all(Vec::is_empty) {
            return Err(anyhow!("VMAF report {path:?} does not contain any frame scores"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            series,
        })
    }

    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    #[must_use]
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Distorted file name and model name encoded in the report's file name.
    #[must_use]
    pub fn name_and_model(&self) -> (String, String) {
        split_name(&self.stem())
    }

    #[must_use]
    pub fn series(&self, datapoint: Datapoint) -> &[f64] {
        self.series.get(&datapoint).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.series.values().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML_REPORT: &str = r#"<VMAF version="2.3.1">
  <params qualityWidth="1920" qualityHeight="1080" />
  <fyi fps="41.98" />
  <frames>
    <frame frameNum="0" integer_adm2="0.98" psnr_y="41.123456" float_ssim="0.9912345" float_ms_ssim="0.987" vmaf="95.123456" />
    <frame frameNum="1" integer_adm2="0.97" psnr_y="40.5" float_ssim="0.99" float_ms_ssim="0.98" vmaf="94.0004" />
  </frames>
  <pooled_metrics>
    <metric name="vmaf" min="94.0" max="95.1" mean="94.56" harmonic_mean="94.5" />
  </pooled_metrics>
</VMAF>
"#;

    const JSON_REPORT: &str = r#"{
  "version": "2.3.1",
  "frames": [
    {"frameNum": 0, "metrics": {"integer_adm2": 0.98, "psnr_y": 41.0, "vmaf": 95.5}},
    {"frameNum": 1, "metrics": {"integer_adm2": 0.97, "psnr_y": 40.0, "vmaf": 93.25}}
  ],
  "pooled_metrics": {"vmaf": {"min": 93.25, "max": 95.5, "mean": 94.375}}
}"#;

    const CSV_REPORT: &str = "Frame,integer_adm2,float_ssim,vmaf,\n0,0.98,0.99,90.1234,\n1,0.97,0.98,91.5,\n2,0.96,0.97,92.0,\n";

    #[test]
    fn parses_xml_frames() {
        let report = Report::parse(Path::new("clip_vmaf_v0.6.1.xml"), XML_REPORT).unwrap();

        assert_eq!(report.series(Datapoint::Vmaf), &[95.123, 94.0]);
        assert_eq!(report.series(Datapoint::Psnr), &[41.123, 40.5]);
        assert_eq!(report.series(Datapoint::Ssim), &[0.991, 0.99]);
        assert_eq!(report.series(Datapoint::MsSsim), &[0.987, 0.98]);
        assert_eq!(report.frame_count(), 2);
    }

    #[test]
    fn parses_json_frames() {
        let report = Report::parse(Path::new("clip_vmaf.json"), JSON_REPORT).unwrap();

        assert_eq!(report.series(Datapoint::Vmaf), &[95.5, 93.25]);
        assert_eq!(report.series(Datapoint::Psnr), &[41.0, 40.0]);
        assert!(report.series(Datapoint::Ssim).is_empty());
    }

    #[test]
    fn parses_csv_frames() {
        let report = Report::parse(Path::new("clip_vmaf.csv"), CSV_REPORT).unwrap();

        assert_eq!(report.series(Datapoint::Vmaf), &[90.123, 91.5, 92.0]);
        assert_eq!(report.series(Datapoint::Ssim), &[0.99, 0.98, 0.97]);
        assert_eq!(report.frame_count(), 3);
    }

    #[test]
    fn sniffs_format_without_extension() {
        assert_eq!(
            ReportFormat::detect(Path::new("report.txt"), "  <VMAF>"),
            ReportFormat::Xml
        );
        assert_eq!(
            ReportFormat::detect(Path::new("report.txt"), "{\"frames\": []}"),
            ReportFormat::Json
        );
        assert_eq!(
            ReportFormat::detect(Path::new("report"), "Frame,vmaf"),
            ReportFormat::Csv
        );

        let report = Report::parse(Path::new("report.log"), XML_REPORT).unwrap();
        assert_eq!(report.frame_count(), 2);
    }

    #[test]
    fn rejects_report_without_scores() {
        assert!(Report::parse(Path::new("empty.json"), r#"{"frames": []}"#).is_err());
        assert!(Report::parse(Path::new("broken.json"), "{").is_err());
    }

    #[test]
    fn splits_name_at_last_vmaf() {
        assert_eq!(
            split_name("movie_x265_crf20_vmaf_v0.6.1"),
            ("movie_x265_crf20".to_owned(), "vmaf_v0.6.1".to_owned())
        );
        assert_eq!(
            split_name("vmaf_test_vmaf_4k_v0.6.1"),
            ("vmaf_test".to_owned(), "vmaf_4k_v0.6.1".to_owned())
        );
        assert_eq!(
            split_name("plain"),
            ("plain".to_owned(), "unknown".to_owned())
        );
    }
}
