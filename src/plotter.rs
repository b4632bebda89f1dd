use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use indicatif::ProgressBar;
use plotters::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{LowerBoundary, OutputType, PlotSettings};
use crate::report::{Datapoint, Report};
use crate::statistics::{
    print_statistics, report_statistics, write_aggregates, write_statistics_file, AggregateInput,
    Statistics,
};
use crate::util::{create_progress_style, find_reports, VIDEO_EXTENSIONS};

/// Bottom of the y-axis for a series.
#[must_use]
pub fn lower_boundary(mode: LowerBoundary, custom: f64, statistics: &Statistics) -> f64 {
    let floor = statistics.get("0.01st Percentile").unwrap_or(0.0);

    match mode {
        LowerBoundary::Default => {
            if floor > 5.0 {
                floor - 5.0
            } else {
                0.0
            }
        }
        LowerBoundary::Min => floor.floor(),
        LowerBoundary::Zero => 0.0,
        LowerBoundary::Custom => custom,
    }
}

fn chart_path(directory: &Path, stem: &str, datapoint: Datapoint) -> PathBuf {
    directory.join(format!(
        "{stem}_{}.svg",
        datapoint.label().to_lowercase().replace('-', "_")
    ))
}

pub fn render_chart(
    path: &Path,
    title: &str,
    datapoint: Datapoint,
    series: &[f64],
    statistics: &Statistics,
    settings: &PlotSettings,
) -> anyhow::Result<()> {
    let lower = lower_boundary(settings.lower_boundary, settings.custom, statistics);
    let upper = datapoint.maximum().max(lower + datapoint.maximum() / 100.0);
    let font_size = (settings.height / 40).max(8);

    let root = SVGBackend::new(path, (settings.width, settings.height)).into_drawing_area();

    let background = if settings.transparent {
        TRANSPARENT
    } else {
        WHITE.to_rgba()
    };

    root.fill(&background)
        .map_err(|err| anyhow!("Unable to fill chart background: {err}"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", font_size))
        .margin(font_size)
        .x_label_area_size(font_size * 3)
        .y_label_area_size(font_size * 4)
        .build_cartesian_2d(0..series.len().max(1), lower..upper)
        .map_err(|err| anyhow!("Unable to build chart axes: {err}"))?;

    chart
        .configure_mesh()
        .x_desc("Frame")
        .y_desc(datapoint.label())
        .label_style(("sans-serif", font_size * 2 / 3))
        .axis_desc_style(("sans-serif", font_size))
        .draw()
        .map_err(|err| anyhow!("Unable to draw chart mesh: {err}"))?;

    let legend = format!(
        "Frames: {} | Mean: {:.3} | Median: {:.3}",
        statistics.frames(),
        statistics.mean(),
        statistics.median()
    );

    chart
        .draw_series(LineSeries::new(
            series
                .iter()
                .enumerate()
                .map(|(frame, value)| (frame, value.clamp(lower, upper))),
            &BLUE,
        ))
        .map_err(|err| anyhow!("Unable to draw chart series: {err}"))?
        .label(legend)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    chart
        .configure_series_labels()
        .label_font(("sans-serif", font_size * 2 / 3))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .position(SeriesLabelPosition::LowerRight)
        .draw()
        .map_err(|err| anyhow!("Unable to draw chart legend: {err}"))?;

    root.present()
        .map_err(|err| anyhow!("Unable to write chart {path:?}: {err}"))?;

    debug!("Wrote chart {path:?}");

    Ok(())
}

/// Creates the output directory when only its last component is missing.
fn prepare_output_directory(path: &Path) -> anyhow::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    if path.exists() {
        return Err(anyhow!("Output {path:?} exists but is not a directory"));
    }

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Err(anyhow!(
            "Unable to create output directory {path:?} because {parent:?} does not exist"
        )),
        _ => std::fs::create_dir(path)
            .with_context(|| format!("Unable to create output directory {path:?}")),
    }
}

/// Size of the distorted video a report was computed from, when it can be found next to the
/// report.
fn distorted_size(directory: &Path, name: &str) -> Option<u64> {
    VIDEO_EXTENSIONS
        .iter()
        .flat_map(|extension| {
            let file_name = format!("{name}.{extension}");
            [
                directory.join(&file_name),
                directory.join(format!("{name}_results")).join(&file_name),
            ]
        })
        .find_map(|path| std::fs::metadata(path).ok().filter(std::fs::Metadata::is_file))
        .map(|metadata| metadata.len())
}

struct ReportOutcome {
    stem: String,
    input: AggregateInput,
}

fn process_report(settings: &PlotSettings, path: &Path) -> anyhow::Result<ReportOutcome> {
    let report = Report::read(path)?;
    let stem = report.stem();
    let (name, model) = report.name_and_model();

    let report_directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let directory = settings
        .output
        .clone()
        .unwrap_or_else(|| report_directory.clone());

    let statistics = report_statistics(&report, &settings.datapoints);

    if statistics.is_empty() {
        return Err(anyhow!(
            "Report {path:?} contains none of the requested datapoints"
        ));
    }

    if settings.output_types.contains(&OutputType::Image) {
        for (datapoint, datapoint_statistics) in &statistics {
            render_chart(
                &chart_path(&directory, &stem, *datapoint),
                &format!("{name} ({model}) {datapoint}"),
                *datapoint,
                report.series(*datapoint),
                datapoint_statistics,
                settings,
            )
            .with_context(|| format!("Unable to render {datapoint} chart for {path:?}"))?;
        }
    }

    if settings.output_types.contains(&OutputType::Stats) {
        write_statistics_file(&directory, &stem, report.frame_count(), &statistics)?;
    }

    Ok(ReportOutcome {
        stem,
        input: AggregateInput {
            file_size: distorted_size(&report_directory, &name),
            name,
            model,
            statistics,
        },
    })
}

/// Reads every report, writes its charts and statistics in parallel, then ranks the reports
/// against each other.
pub fn plot(settings: &PlotSettings) -> anyhow::Result<()> {
    let reports = find_reports(&settings.reports).context("Unable to find VMAF reports")?;

    if reports.is_empty() {
        return Err(anyhow!("No VMAF reports found in {:?}", settings.reports));
    }

    if let Some(output) = &settings.output {
        prepare_output_directory(output)?;
    }

    info!("Processing {} VMAF reports", reports.len());

    let progress_bar = ProgressBar::new(reports.len().try_into().unwrap_or(u64::MAX));

    progress_bar.set_style(
        create_progress_style(
            "{spinner:.green} [{elapsed_precise}] Reading VMAF reports... [{wide_bar:.cyan/blue}] {percent:>3}% {human_pos:>4}/{human_len:>4} (ETA: {smooth_eta:>3})",
        )
        .context("Unable to create report progress bar style")?,
    );

    progress_bar.enable_steady_tick(Duration::from_secs(1));

    let outcomes = reports
        .par_iter()
        .map(|path| {
            let outcome = process_report(settings, path)
                .with_context(|| format!("Unable to process VMAF report {path:?}"));
            progress_bar.inc(1);
            outcome
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    progress_bar.finish();

    if settings.output_types.contains(&OutputType::Stats) {
        let mut by_stem: BTreeMap<&str, &AggregateInput> = BTreeMap::new();

        for outcome in &outcomes {
            by_stem.insert(&outcome.stem, &outcome.input);
        }

        for (stem, input) in by_stem {
            print_statistics(stem, &input.statistics);
        }
    }

    if settings.output_types.contains(&OutputType::Agg) {
        let directory = settings.output.clone().unwrap_or_else(|| PathBuf::from("."));
        let inputs: Vec<AggregateInput> = outcomes.into_iter().map(|outcome| outcome.input).collect();

        write_aggregates(&inputs, &directory).context("Unable to write aggregate statistics")?;
    }

    Ok(())
}
