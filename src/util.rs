use std::fmt::{Display, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use indicatif::{HumanDuration, ProgressState, ProgressStyle};
use number_prefix::NumberPrefix;
use tracing::{error, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// File extensions accepted as distorted video files.
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mkv", "mp4", "webm", "avi"];

/// File extensions accepted as VMAF reports.
pub const REPORT_EXTENSIONS: [&str; 3] = ["xml", "json", "csv"];

/// Report-adjacent files written by this tool that must not be read back as reports.
const REPORT_EXCLUSIONS: [&str; 3] = ["aggregate", "statistics", "completions"];

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_sign_loss)]
pub fn create_progress_style(template: &str) -> anyhow::Result<ProgressStyle> {
    let progress_style = ProgressStyle::with_template(template)
        .with_context(|| format!("Unable to create progress bar style with template '{template}'"))?
        .with_key("smooth_eta", |s: &ProgressState, w: &mut dyn Write| {
            match (s.pos(), s.len()) {
                (pos, Some(len)) if pos > 0 => write!(
                    w,
                    "{:#}",
                    HumanDuration(Duration::from_millis(
                        (s.elapsed().as_millis() as f64 * (len as f64 - pos as f64) / pos as f64)
                            .round() as u64
                    ))
                ),
                _ => write!(w, "-"),
            }
            .unwrap_or_else(|err| {
                error!("Unexpected error while formatting smooth_eta in progress bar: {err}");
            });
        })
        .with_key("smooth_per_min", |s: &ProgressState, w: &mut dyn Write| {
            match (s.pos(), s.elapsed().as_millis()) {
                (pos, elapsed_ms) if elapsed_ms > 0 => {
                    write!(w, "{:.2}", pos as f64 * 60_000_f64 / elapsed_ms as f64)
                }
                _ => write!(w, "-"),
            }
            .unwrap_or_else(|err| {
                error!("Unexpected error while formatting smooth_per_min in progress bar: {err}");
            });
        });

    Ok(progress_style)
}

pub fn install_tracing(verbosity: u8) -> anyhow::Result<()> {
    let default_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .context("Unable to initialize global default subscriber")?;

    Ok(())
}

pub fn verify_filename(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create directory {parent:?}"))?;
        }
    }

    Ok(())
}

pub fn verify_directory(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(anyhow!("{path:?} exists but is not a directory"));
        }
    } else {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Unable to create directory {path:?}"))?;
    }

    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            extensions
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(extension))
        })
}

/// Expands a list of files and directories into the files they contain with one of the given
/// extensions. Explicitly named files are accepted as long as their extension matches.
pub fn find_files(
    paths: &[PathBuf],
    extensions: &[&str],
    recursive: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];

    for path in paths {
        if path.is_dir() {
            let walker = WalkDir::new(path)
                .follow_links(true)
                .max_depth(if recursive { usize::MAX } else { 1 });

            for entry in walker {
                let entry =
                    entry.with_context(|| format!("Unable to scan directory {path:?}"))?;

                if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            if has_extension(path, extensions) {
                files.push(path.clone());
            } else {
                return Err(anyhow!(
                    "{path:?} does not have one of the expected extensions: {}",
                    extensions.join(", ")
                ));
            }
        } else {
            return Err(anyhow!("Unable to find {path:?}"));
        }
    }

    files.sort();
    files.dedup();

    Ok(files)
}

pub fn find_reports(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    Ok(find_files(paths, &REPORT_EXTENSIONS, true)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_lowercase())
                .is_some_and(|name| {
                    !REPORT_EXCLUSIONS
                        .iter()
                        .any(|exclusion| name.contains(exclusion))
                })
        })
        .collect())
}

/// Byte counts using binary prefixes, such as `9.8 KiB`.
pub struct HumanSize(pub u64);

impl Display for HumanSize {
    #[allow(clippy::as_conversions)]
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(bytes) => write!(f, "{bytes:.0} B"),
            NumberPrefix::Prefixed(prefix, value) => write!(f, "{value:.1} {prefix}B"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn human_size_uses_binary_prefixes() {
        assert_eq!(HumanSize(512).to_string(), "512 B");
        assert_eq!(HumanSize(10_000).to_string(), "9.8 KiB");
        assert_eq!(HumanSize(100_001_221).to_string(), "95.4 MiB");
    }

    #[test]
    fn find_files_filters_by_extension() {
        let directory = tempfile::tempdir().unwrap();
        let nested = directory.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        File::create(directory.path().join("a.mkv")).unwrap();
        File::create(directory.path().join("b.MP4")).unwrap();
        File::create(directory.path().join("notes.txt")).unwrap();
        File::create(nested.join("c.mkv")).unwrap();

        let shallow =
            find_files(&[directory.path().to_path_buf()], &VIDEO_EXTENSIONS, false).unwrap();
        assert_eq!(shallow.len(), 2);

        let deep = find_files(&[directory.path().to_path_buf()], &VIDEO_EXTENSIONS, true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&nested.join("c.mkv")));
    }

    #[test]
    fn find_files_rejects_named_file_with_wrong_extension() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("notes.txt");
        File::create(&path).unwrap();

        assert!(find_files(&[path], &VIDEO_EXTENSIONS, false).is_err());
    }

    #[test]
    fn find_reports_skips_generated_files() {
        let directory = tempfile::tempdir().unwrap();

        File::create(directory.path().join("clip_vmaf_v0.6.1.xml")).unwrap();
        File::create(directory.path().join("clip_vmaf_v0.6.1_statistics.csv")).unwrap();
        File::create(directory.path().join("clip_aggregate.json")).unwrap();
        File::create(directory.path().join("ref_completions.json")).unwrap();

        let reports = find_reports(&[directory.path().to_path_buf()]).unwrap();
        assert_eq!(reports, vec![directory.path().join("clip_vmaf_v0.6.1.xml")]);
    }
}
