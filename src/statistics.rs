use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use prettytable::{row, Table};
use statrs::statistics::{Data, OrderStatistics, RankTieBreaker, Statistics as _};
use tracing::{debug, info};

use crate::report::{Datapoint, Report};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Measure {
    Mean,
    Median,
    StandardDeviation,
    MeanAbsoluteDeviation,
    Percentile(f64),
    PercentileAbsoluteDeviation(f64),
}

pub struct Metric {
    pub name: &'static str,
    pub direction: Direction,
    measure: Measure,
}

const fn metric(name: &'static str, direction: Direction, measure: Measure) -> Metric {
    Metric {
        name,
        direction,
        measure,
    }
}

pub const METRICS: [Metric; 21] = [
    metric("Mean", Direction::HigherIsBetter, Measure::Mean),
    metric("Median", Direction::HigherIsBetter, Measure::Median),
    metric(
        "Standard Deviation",
        Direction::LowerIsBetter,
        Measure::StandardDeviation,
    ),
    metric(
        "Mean Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::MeanAbsoluteDeviation,
    ),
    metric(
        "Median Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::PercentileAbsoluteDeviation(0.5),
    ),
    metric(
        "99th Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.99),
    ),
    metric(
        "95th Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.95),
    ),
    metric(
        "90th Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.90),
    ),
    metric(
        "75th Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.75),
    ),
    metric(
        "25th Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.25),
    ),
    metric(
        "1st Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.01),
    ),
    metric(
        "0.1st Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.001),
    ),
    metric(
        "0.01st Percentile",
        Direction::HigherIsBetter,
        Measure::Percentile(0.0001),
    ),
    metric(
        "99th Percentile Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::PercentileAbsoluteDeviation(0.99),
    ),
    metric(
        "95th Percentile Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::PercentileAbsoluteDeviation(0.95),
    ),
    metric(
        "90th Percentile Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::PercentileAbsoluteDeviation(0.90),
    ),
    metric(
        "75th Percentile Absolute Deviation",
        Direction::LowerIsBetter,
        Measure::PercentileAbsoluteDeviation(0.75),
    ),
    metric(
        "25th Percentile Absolute Deviation",
        Direction::HigherIsBetter,
        Measure::PercentileAbsoluteDeviation(0.25),
    ),
    metric(
        "1st Percentile Absolute Deviation",
        Direction::HigherIsBetter,
        Measure::PercentileAbsoluteDeviation(0.01),
    ),
    metric(
        "0.1st Percentile Absolute Deviation",
        Direction::HigherIsBetter,
        Measure::PercentileAbsoluteDeviation(0.001),
    ),
    metric(
        "0.01st Percentile Absolute Deviation",
        Direction::HigherIsBetter,
        Measure::PercentileAbsoluteDeviation(0.0001),
    ),
];

const FILE_SIZE: &str = "File Size";

fn round(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn mean_absolute_deviation(series: &[f64], center: f64) -> f64 {
    series.iter().map(|value| (value - center).abs()).sum::<f64>() / series.len() as f64
}

/// Summary statistics of one datapoint series, in the order of [`METRICS`].
#[derive(Clone, Debug, PartialEq)]
pub struct Statistics {
    frames: usize,
    values: Vec<f64>,
}

/// Linearly interpolated percentile at rank `(n - 1) * tau` of an ascending, non-empty series.
#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn percentile(sorted: &[f64], tau: f64) -> f64 {
    let rank = (sorted.len().saturating_sub(1) as f64) * tau.clamp(0.0, 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    match (sorted.get(lower), sorted.get(upper)) {
        (Some(low), Some(high)) => (rank - rank.floor()).mul_add(high - low, *low),
        _ => f64::NAN,
    }
}

impl Statistics {
    #[must_use]
    pub fn compute(series: &[f64]) -> Option<Self> {
        if series.is_empty() {
            return None;
        }

        let mean = series.iter().mean();

        let mut sorted = series.to_vec();
        sorted.sort_by(f64::total_cmp);

        let values = METRICS
            .iter()
            .map(|metric| match metric.measure {
                Measure::Mean => mean,
                Measure::Median => percentile(&sorted, 0.5),
                Measure::StandardDeviation => {
                    if series.len() > 1 {
                        series.iter().std_dev()
                    } else {
                        0.0
                    }
                }
                Measure::MeanAbsoluteDeviation => mean_absolute_deviation(series, mean),
                Measure::Percentile(tau) => percentile(&sorted, tau),
                Measure::PercentileAbsoluteDeviation(tau) => {
                    mean_absolute_deviation(series, percentile(&sorted, tau))
                }
            })
            .map(round)
            .collect();

        Some(Self {
            frames: series.len(),
            values,
        })
    }

    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        METRICS
            .iter()
            .position(|metric| metric.name == name)
            .and_then(|index| self.values.get(index).copied())
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn median(&self) -> f64 {
        self.values.get(1).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static Metric, f64)> + '_ {
        METRICS.iter().zip(self.values.iter().copied())
    }
}

/// Statistics for every requested datapoint present in the report.
#[must_use]
pub fn report_statistics(
    report: &Report,
    datapoints: &[Datapoint],
) -> BTreeMap<Datapoint, Statistics> {
    datapoints
        .iter()
        .filter_map(|datapoint| {
            Statistics::compute(report.series(*datapoint)).map(|statistics| (*datapoint, statistics))
        })
        .collect()
}

pub fn write_statistics_file(
    directory: &Path,
    stem: &str,
    frames: usize,
    statistics: &BTreeMap<Datapoint, Statistics>,
) -> anyhow::Result<PathBuf> {
    let path = directory.join(format!("{stem}_statistics.txt"));
    let mut contents = String::new();

    writeln!(contents, "Number of frames: {frames}")?;

    for (datapoint, statistics) in statistics {
        for (metric, value) in statistics.iter() {
            writeln!(contents, "{} {datapoint} Score: {value}", metric.name)?;
        }
    }

    std::fs::write(&path, contents)
        .with_context(|| format!("Unable to write statistics file {path:?}"))?;

    debug!("Wrote statistics to {path:?}");

    Ok(path)
}

/// Everything the aggregate rankings need to know about one report.
#[derive(Clone, Debug)]
pub struct AggregateInput {
    pub name: String,
    pub model: String,
    pub file_size: Option<u64>,
    pub statistics: BTreeMap<Datapoint, Statistics>,
}

struct Item {
    label: String,
    direction: Direction,
    scores: Vec<f64>,
}

/// Per-model comparison of every report: the score of each file for every `<datapoint> <metric>`
/// item, the rank of each file per item and the sum of those ranks.
pub struct Ranking {
    pub model: String,
    pub files: Vec<String>,
    items: Vec<Item>,
    ranks: Vec<Vec<f64>>,
    pub overall: Vec<f64>,
}

fn ranks(scores: &[f64], direction: Direction) -> Vec<f64> {
    let values = scores
        .iter()
        .map(|score| match direction {
            Direction::HigherIsBetter => -score,
            Direction::LowerIsBetter => *score,
        })
        .collect::<Vec<_>>();

    Data::new(values).ranks(RankTieBreaker::Average)
}

impl Ranking {
    #[must_use]
    pub fn build(model: &str, inputs: &[&AggregateInput]) -> Self {
        let files = inputs.iter().map(|input| input.name.clone()).collect();
        let mut items = vec![];

        for datapoint in Datapoint::ALL {
            if !inputs
                .iter()
                .all(|input| input.statistics.contains_key(&datapoint))
            {
                continue;
            }

            for metric in &METRICS {
                let scores = inputs
                    .iter()
                    .filter_map(|input| input.statistics.get(&datapoint))
                    .filter_map(|statistics| statistics.get(metric.name))
                    .collect();

                items.push(Item {
                    label: format!("{datapoint} {}", metric.name),
                    direction: metric.direction,
                    scores,
                });
            }
        }

        if inputs.iter().all(|input| input.file_size.is_some()) {
            #[allow(clippy::as_conversions)]
            #[allow(clippy::cast_precision_loss)]
            items.push(Item {
                label: FILE_SIZE.to_owned(),
                direction: Direction::LowerIsBetter,
                scores: inputs
                    .iter()
                    .filter_map(|input| input.file_size)
                    .map(|size| size as f64)
                    .collect(),
            });
        }

        let ranks: Vec<Vec<f64>> = items
            .iter()
            .map(|item| ranks(&item.scores, item.direction))
            .collect();

        let overall = (0..inputs.len())
            .map(|file| ranks.iter().filter_map(|item| item.get(file)).sum())
            .collect();

        Self {
            model: model.to_owned(),
            files,
            items,
            ranks,
            overall,
        }
    }

    /// The best score for an item and the file it belongs to.
    fn top(&self, item: &Item) -> Option<(f64, &str)> {
        item.scores
            .iter()
            .zip(&self.files)
            .reduce(|best, candidate| {
                let better = match item.direction {
                    Direction::HigherIsBetter => candidate.0 > best.0,
                    Direction::LowerIsBetter => candidate.0 < best.0,
                };

                if better {
                    candidate
                } else {
                    best
                }
            })
            .map(|(score, file)| (*score, file.as_str()))
    }

    /// File indices ordered from best to worst overall.
    #[must_use]
    pub fn order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.files.len()).collect();
        order.sort_by(|a, b| {
            self.overall
                .get(*a)
                .partial_cmp(&self.overall.get(*b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.files.get(*a).cmp(&self.files.get(*b)))
        });
        order
    }

    #[must_use]
    pub fn overall_score(&self, file: &str) -> Option<f64> {
        self.files
            .iter()
            .position(|candidate| candidate == file)
            .and_then(|index| self.overall.get(index).copied())
    }

    fn file_name(&self) -> String {
        self.model.replace(['/', '\\'], "_")
    }

    pub fn write_scores(&self, directory: &Path) -> anyhow::Result<PathBuf> {
        let path = directory.join(format!("{}_aggregate_scores.csv", self.file_name()));

        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Unable to create aggregate scores file {path:?}"))?;

        let mut header = vec!["Metric".to_owned()];
        header.extend(self.files.iter().cloned());
        header.push("Top Score".to_owned());
        header.push("Top Score File".to_owned());
        writer.write_record(&header)?;

        for item in &self.items {
            let mut record = vec![item.label.clone()];
            record.extend(item.scores.iter().map(ToString::to_string));

            let (top_score, top_file) = self
                .top(item)
                .map_or_else(|| (String::new(), String::new()), |(score, file)| {
                    (score.to_string(), file.to_owned())
                });

            record.push(top_score);
            record.push(top_file);
            writer.write_record(&record)?;
        }

        writer
            .flush()
            .with_context(|| format!("Unable to write aggregate scores file {path:?}"))?;

        Ok(path)
    }

    pub fn write_rankings(&self, directory: &Path) -> anyhow::Result<PathBuf> {
        let path = directory.join(format!("{}_aggregate_rankings.csv", self.file_name()));

        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Unable to create aggregate rankings file {path:?}"))?;

        let mut header = vec!["File".to_owned()];
        header.extend(self.items.iter().map(|item| format!("{} RANK", item.label)));
        header.push("OVERALL SCORE".to_owned());
        writer.write_record(&header)?;

        for file in self.order() {
            let name = self
                .files
                .get(file)
                .ok_or_else(|| anyhow!("Unable to find ranked file {file}"))?;

            let mut record = vec![name.clone()];
            record.extend(
                self.ranks
                    .iter()
                    .map(|item| item.get(file).map_or_else(String::new, ToString::to_string)),
            );
            record.push(
                self.overall
                    .get(file)
                    .map_or_else(String::new, ToString::to_string),
            );
            writer.write_record(&record)?;
        }

        writer
            .flush()
            .with_context(|| format!("Unable to write aggregate rankings file {path:?}"))?;

        Ok(path)
    }

    #[allow(clippy::print_stdout)]
    pub fn print(&self) {
        println!("Overall ranking for model {}:", self.model);

        let mut table = Table::new();
        table.set_titles(row!["Rank", "File", "Overall Score"]);

        for (position, file) in self.order().into_iter().enumerate() {
            table.add_row(row![
                r->position + 1,
                self.files.get(file).map_or("", String::as_str),
                r->self.overall.get(file).map_or_else(String::new, ToString::to_string)
            ]);
        }

        table.printstd();
    }
}

/// Groups the inputs by model, ranks each group, writes both CSV files per model and prints the
/// overall rankings.
pub fn write_aggregates(inputs: &[AggregateInput], directory: &Path) -> anyhow::Result<Vec<Ranking>> {
    let mut models: BTreeMap<&str, Vec<&AggregateInput>> = BTreeMap::new();

    for input in inputs {
        models.entry(input.model.as_str()).or_default().push(input);
    }

    let mut rankings = vec![];

    for (model, inputs) in models {
        let ranking = Ranking::build(model, &inputs);

        let scores = ranking.write_scores(directory)?;
        let ranks = ranking.write_rankings(directory)?;
        info!("Wrote aggregate statistics for {model} to {scores:?} and {ranks:?}");

        ranking.print();
        rankings.push(ranking);
    }

    Ok(rankings)
}

#[allow(clippy::print_stdout)]
pub fn print_statistics(name: &str, statistics: &BTreeMap<Datapoint, Statistics>) {
    let mut table = Table::new();

    let mut titles = row!["Metric"];
    for datapoint in statistics.keys() {
        titles.add_cell(prettytable::Cell::new(datapoint.label()));
    }
    table.set_titles(titles);

    for metric in &METRICS {
        let mut row = row![metric.name];

        for statistics in statistics.values() {
            row.add_cell(prettytable::Cell::new(
                &statistics
                    .get(metric.name)
                    .map_or_else(String::new, |value| format!("{value:.3}")),
            ));
        }

        table.add_row(row);
    }

    println!("{name}:");
    table.printstd();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, model: &str, vmaf: &[f64], file_size: Option<u64>) -> AggregateInput {
        let mut statistics = BTreeMap::new();
        statistics.insert(Datapoint::Vmaf, Statistics::compute(vmaf).unwrap());

        AggregateInput {
            name: name.to_owned(),
            model: model.to_owned(),
            file_size,
            statistics,
        }
    }

    #[test]
    fn computes_basic_statistics() {
        let statistics = Statistics::compute(&[90.0, 92.0, 94.0, 96.0, 98.0]).unwrap();

        assert_eq!(statistics.frames(), 5);
        assert!((statistics.mean() - 94.0).abs() < 1e-9);
        assert!((statistics.median() - 94.0).abs() < 1e-9);
        assert_eq!(statistics.get("Standard Deviation"), Some(3.162));
        assert_eq!(statistics.get("Mean Absolute Deviation"), Some(2.4));
        assert_eq!(statistics.get("Median Absolute Deviation"), Some(2.4));
        assert!(statistics.get("Unknown").is_none());
        assert_eq!(statistics.iter().count(), METRICS.len());
    }

    #[test]
    fn interpolates_percentiles_linearly() {
        let statistics = Statistics::compute(&[98.0, 90.0, 96.0, 92.0, 94.0]).unwrap();

        assert_eq!(statistics.get("25th Percentile"), Some(92.0));
        assert_eq!(statistics.get("75th Percentile"), Some(96.0));
        assert_eq!(statistics.get("90th Percentile"), Some(97.2));
        assert_eq!(statistics.get("1st Percentile"), Some(90.08));
        assert_eq!(statistics.get("25th Percentile Absolute Deviation"), Some(2.8));

        assert!((percentile(&[1.0, 2.0], 0.5) - 1.5).abs() < 1e-9);
        assert!((percentile(&[7.0], 0.99) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn constant_series_has_no_spread() {
        let statistics = Statistics::compute(&[95.0; 10]).unwrap();

        for (metric, value) in statistics.iter() {
            let expected = match metric.measure {
                Measure::Mean | Measure::Median | Measure::Percentile(_) => 95.0,
                _ => 0.0,
            };

            assert!((value - expected).abs() < 1e-9, "{}", metric.name);
        }

        assert!(Statistics::compute(&[]).is_none());
        assert_eq!(
            Statistics::compute(&[42.0]).unwrap().get("Standard Deviation"),
            Some(0.0)
        );
    }

    #[test]
    fn spread_metrics_rank_lower_first() {
        let lower = METRICS
            .iter()
            .filter(|metric| metric.direction == Direction::LowerIsBetter)
            .map(|metric| metric.name)
            .collect::<Vec<_>>();

        assert_eq!(
            lower,
            [
                "Standard Deviation",
                "Mean Absolute Deviation",
                "Median Absolute Deviation",
                "99th Percentile Absolute Deviation",
                "95th Percentile Absolute Deviation",
                "90th Percentile Absolute Deviation",
                "75th Percentile Absolute Deviation",
            ]
        );
    }

    #[test]
    fn writes_statistics_file() {
        let directory = tempfile::tempdir().unwrap();
        let mut statistics = BTreeMap::new();
        statistics.insert(
            Datapoint::Vmaf,
            Statistics::compute(&[90.0, 100.0]).unwrap(),
        );

        let path = write_statistics_file(directory.path(), "clip_vmaf", 2, &statistics).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();

        assert_eq!(lines.next(), Some("Number of frames: 2"));
        assert_eq!(lines.next(), Some("Mean VMAF Score: 95"));
        assert_eq!(lines.next(), Some("Median VMAF Score: 95"));
        assert_eq!(contents.lines().count(), 1 + METRICS.len());
    }

    #[test]
    fn ranks_files_by_direction() {
        let good = input("good", "vmaf_v0.6.1", &[96.0, 96.0, 96.0], Some(1000));
        let bad = input("bad", "vmaf_v0.6.1", &[80.0, 90.0, 100.0], Some(500));

        let ranking = Ranking::build("vmaf_v0.6.1", &[&good, &bad]);

        let mean = ranking
            .items
            .iter()
            .position(|item| item.label == "VMAF Mean")
            .unwrap();
        assert_eq!(ranking.ranks[mean], vec![1.0, 2.0]);

        let deviation = ranking
            .items
            .iter()
            .position(|item| item.label == "VMAF Standard Deviation")
            .unwrap();
        assert_eq!(ranking.ranks[deviation], vec![1.0, 2.0]);

        let size = ranking
            .items
            .iter()
            .position(|item| item.label == FILE_SIZE)
            .unwrap();
        assert_eq!(ranking.ranks[size], vec![2.0, 1.0]);

        assert_eq!(ranking.order().first(), Some(&0));
        assert_eq!(
            ranking.top(&ranking.items[mean]),
            Some((96.0, "good"))
        );
    }

    #[test]
    fn ties_share_average_rank() {
        let a = input("a", "model", &[90.0], None);
        let b = input("b", "model", &[90.0], None);
        let c = input("c", "model", &[80.0], None);

        let ranking = Ranking::build("model", &[&a, &b, &c]);

        let mean = ranking
            .items
            .iter()
            .position(|item| item.label == "VMAF Mean")
            .unwrap();
        assert_eq!(ranking.ranks[mean], vec![1.5, 1.5, 3.0]);
        assert!(!ranking.items.iter().any(|item| item.label == FILE_SIZE));
    }

    #[test]
    fn writes_aggregate_csv_per_model() {
        let directory = tempfile::tempdir().unwrap();

        let inputs = vec![
            input("a", "vmaf_v0.6.1", &[90.0, 92.0], None),
            input("b", "vmaf_v0.6.1", &[85.0, 87.0], None),
            input("a", "vmaf_4k_v0.6.1", &[91.0, 93.0], None),
        ];

        let rankings = write_aggregates(&inputs, directory.path()).unwrap();
        assert_eq!(rankings.len(), 2);

        let scores = std::fs::read_to_string(
            directory.path().join("vmaf_v0.6.1_aggregate_scores.csv"),
        )
        .unwrap();
        assert!(scores.starts_with("Metric,a,b,Top Score,Top Score File"));
        assert!(scores.contains("VMAF Mean,91,86,91,a"));

        let ranks = std::fs::read_to_string(
            directory.path().join("vmaf_v0.6.1_aggregate_rankings.csv"),
        )
        .unwrap();
        assert!(ranks.lines().next().unwrap().ends_with("OVERALL SCORE"));
        assert!(ranks.lines().nth(1).unwrap().starts_with("a,"));
        assert!(directory
            .path()
            .join("vmaf_4k_v0.6.1_aggregate_rankings.csv")
            .exists());
    }
}
