use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use ini::Ini;
use tracing::{debug, warn};

use crate::report::Datapoint;
use crate::util::verify_filename;

pub const DEFAULT_CONFIG_FILE: &str = "config.ini";
pub const DEFAULT_MODEL: &str = "vmaf_v0.6.1";

const SECTION_GENERAL: &str = "General";
const SECTION_CALCULATIONS: &str = "Calculations";
const SECTION_GRAPHING: &str = "Graphing";
const SECTION_IMAGE: &str = "Image Settings";

const KNOWN_KEYS: [(&str, &[&str]); 4] = [
    (SECTION_GENERAL, &["ffmpeg", "vmaf_version"]),
    (
        SECTION_CALCULATIONS,
        &[
            "models",
            "psnr",
            "ssim",
            "ms_ssim",
            "subsamples",
            "log_format",
            "log_directory",
            "threads",
            "processes",
            "use_remaining_threads",
            "hwaccel",
        ],
    ),
    (
        SECTION_GRAPHING,
        &[
            "output",
            "output_types",
            "datapoints",
            "resolution",
            "lower_boundary",
            "custom",
        ],
    ),
    (SECTION_IMAGE, &["x", "y", "transparent"]),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogFormat {
    Xml,
    Json,
    Csv,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Xml => write!(f, "xml"),
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

impl LogFormat {
    #[must_use]
    pub fn extension(&self) -> String {
        self.to_string()
    }
}

/// Major version of the libvmaf library FFmpeg was built against. The 1.x filter loads `.pkl`
/// models through `model_path` and enables extra metrics with flags such as `psnr=1`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum VmafVersion {
    #[value(name = "1")]
    V1,
    #[default]
    #[value(name = "2")]
    V2,
}

impl std::fmt::Display for VmafVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
            Self::V2 => write!(f, "2"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputType {
    Image,
    Stats,
    Agg,
    All,
}

impl OutputType {
    #[must_use]
    pub fn expand(choices: &[Self]) -> Vec<Self> {
        if choices.is_empty() || choices.contains(&Self::All) {
            vec![Self::Image, Self::Stats, Self::Agg]
        } else {
            let mut expanded = choices.to_vec();
            expanded.sort();
            expanded.dedup();
            expanded
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum DatapointChoice {
    Vmaf,
    Psnr,
    Ssim,
    #[value(alias = "ms_ssim")]
    MsSsim,
    All,
}

impl DatapointChoice {
    #[must_use]
    pub fn expand(choices: &[Self]) -> Vec<Datapoint> {
        if choices.is_empty() || choices.contains(&Self::All) {
            return Datapoint::ALL.to_vec();
        }

        let mut datapoints: Vec<Datapoint> = choices
            .iter()
            .filter_map(|choice| match choice {
                Self::Vmaf => Some(Datapoint::Vmaf),
                Self::Psnr => Some(Datapoint::Psnr),
                Self::Ssim => Some(Datapoint::Ssim),
                Self::MsSsim => Some(Datapoint::MsSsim),
                Self::All => None,
            })
            .collect();

        datapoints.sort();
        datapoints.dedup();
        datapoints
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Resolution {
    #[value(name = "720")]
    Hd,
    #[value(name = "1080")]
    FullHd,
    #[value(name = "1440")]
    Qhd,
    #[value(name = "4k")]
    Uhd,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Hd => write!(f, "720"),
            Self::FullHd => write!(f, "1080"),
            Self::Qhd => write!(f, "1440"),
            Self::Uhd => write!(f, "4k"),
        }
    }
}

impl Resolution {
    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Hd => (1280, 720),
            Self::FullHd => (1920, 1080),
            Self::Qhd => (2560, 1440),
            Self::Uhd => (3840, 2160),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LowerBoundary {
    /// 0.01st percentile minus 5, or zero when that would be 5 or below
    Default,
    /// 0.01st percentile
    Min,
    /// Always zero
    Zero,
    /// The value given with --custom
    Custom,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, or a directory containing config.ini
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Calculate VMAF scores for encoded files against a reference
    Calculate(CalculateArgs),

    /// Generate statistics and charts from VMAF reports
    Plot(PlotArgs),

    /// Show the completions ledger for a reference file
    Status(StatusArgs),

    /// Write a configuration file containing the default settings
    InitConfig(InitConfigArgs),
}

#[derive(Args, Clone, Debug, Default)]
pub struct CalculateArgs {
    /// Reference video file
    pub reference: PathBuf,

    /// Encoded video files, or directories to scan for them
    pub encoded: Vec<PathBuf>,

    /// Scan encoded directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// VMAF model file or built-in model version (repeatable)
    #[arg(short, long = "model")]
    pub models: Vec<String>,

    /// FFmpeg executable, or a directory containing it
    #[arg(short, long)]
    pub ffmpeg: Option<PathBuf>,

    /// Major version of the libvmaf library FFmpeg was built against
    #[arg(long, value_enum)]
    pub vmaf_version: Option<VmafVersion>,

    /// libvmaf threads per FFmpeg process (0 to divide all cores between processes)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Number of simultaneous FFmpeg processes
    #[arg(short, long)]
    pub processes: Option<usize>,

    /// Run one extra process with the threads left over by the others
    #[arg(short, long, overrides_with = "no_use_remaining_threads")]
    pub use_remaining_threads: bool,

    #[arg(long, overrides_with = "use_remaining_threads", hide = true)]
    pub no_use_remaining_threads: bool,

    /// Also calculate PSNR
    #[arg(long, overrides_with = "no_psnr")]
    pub psnr: bool,

    #[arg(long, overrides_with = "psnr", hide = true)]
    pub no_psnr: bool,

    /// Also calculate SSIM
    #[arg(long, overrides_with = "no_ssim")]
    pub ssim: bool,

    #[arg(long, overrides_with = "ssim", hide = true)]
    pub no_ssim: bool,

    /// Also calculate MS-SSIM
    #[arg(long, overrides_with = "no_ms_ssim")]
    pub ms_ssim: bool,

    #[arg(long, overrides_with = "ms_ssim", hide = true)]
    pub no_ms_ssim: bool,

    /// Only score every Nth frame
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub subsamples: Option<u32>,

    /// VMAF report format
    #[arg(short, long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Directory for VMAF reports and aggregate score files
    #[arg(long)]
    pub log_directory: Option<PathBuf>,

    /// Let FFmpeg use hardware accelerated decoding
    #[arg(long, overrides_with = "no_hwaccel")]
    pub hwaccel: bool,

    #[arg(long, overrides_with = "hwaccel", hide = true)]
    pub no_hwaccel: bool,

    /// Ignore any existing completions ledger and start over
    #[arg(long)]
    pub fresh: bool,

    /// Move distorted files into a <stem>_results directory once every model is done
    #[arg(long)]
    pub move_completed: bool,
}

#[derive(Args, Clone, Debug, Default)]
pub struct PlotArgs {
    /// VMAF report files, or directories to scan for them
    #[arg(required = true)]
    pub reports: Vec<PathBuf>,

    /// Output directory (defaults to the directory of each report)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Outputs to generate
    #[arg(short = 't', long, value_enum, value_delimiter = ',')]
    pub output_types: Vec<OutputType>,

    /// Metrics to include
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub datapoints: Vec<DatapointChoice>,

    /// Chart resolution
    #[arg(short, long, value_enum)]
    pub resolution: Option<Resolution>,

    /// How to choose the lowest value on the chart's vertical axis
    #[arg(short, long, value_enum)]
    pub lower_boundary: Option<LowerBoundary>,

    /// Lower boundary used with --lower-boundary custom
    #[arg(long)]
    pub custom: Option<f64>,
}

#[derive(Args, Clone, Debug)]
pub struct StatusArgs {
    /// Reference video file whose ledger should be shown
    pub reference: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct InitConfigArgs {
    /// Path of the configuration file to write
    #[arg(default_value = DEFAULT_CONFIG_FILE)]
    pub path: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Settings read from the INI configuration file. Every field is optional so that the
/// command line can override individual values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigFile {
    pub ffmpeg: Option<PathBuf>,
    pub vmaf_version: Option<VmafVersion>,
    pub models: Option<Vec<String>>,
    pub psnr: Option<bool>,
    pub ssim: Option<bool>,
    pub ms_ssim: Option<bool>,
    pub subsamples: Option<u32>,
    pub log_format: Option<LogFormat>,
    pub log_directory: Option<PathBuf>,
    pub threads: Option<usize>,
    pub processes: Option<usize>,
    pub use_remaining_threads: Option<bool>,
    pub hwaccel: Option<bool>,
    pub output: Option<PathBuf>,
    pub output_types: Option<Vec<OutputType>>,
    pub datapoints: Option<Vec<DatapointChoice>>,
    pub resolution: Option<Resolution>,
    pub lower_boundary: Option<LowerBoundary>,
    pub custom: Option<f64>,
    pub image_width: Option<u32>,
    pub image_height: Option<u32>,
    pub transparent: Option<bool>,
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        other => Err(anyhow!("'{other}' is not a boolean")),
    }
}

fn parse_number<T>(value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("'{}' is not a valid number", value.trim()))
}

fn parse_enum<T: ValueEnum>(value: &str) -> anyhow::Result<T> {
    T::from_str(value.trim(), true).map_err(|err| anyhow!(err))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Model arguments may be file paths containing spaces, so only commas separate them.
fn parse_models(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_enum_list<T: ValueEnum>(value: &str) -> anyhow::Result<Vec<T>> {
    parse_list(value)
        .iter()
        .map(|item| parse_enum(item))
        .collect()
}

fn lookup<T>(
    ini: &Ini,
    section: &str,
    key: &str,
    parse: impl Fn(&str) -> anyhow::Result<T>,
) -> anyhow::Result<Option<T>> {
    ini.section(Some(section))
        .and_then(|properties| properties.get(key))
        .map(|value| parse(value).with_context(|| format!("Invalid value for [{section}] {key}")))
        .transpose()
}

impl ConfigFile {
    /// Loads the configuration file. Without an explicit path, `config.ini` in the working
    /// directory is used if it exists and defaults apply otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) if path.is_dir() => {
                let candidate = path.join(DEFAULT_CONFIG_FILE);

                if !candidate.is_file() {
                    return Err(anyhow!(
                        "Unable to find {DEFAULT_CONFIG_FILE} in directory {path:?}"
                    ));
                }

                candidate
            }
            Some(path) => {
                if !path.is_file() {
                    return Err(anyhow!("Configuration file {path:?} does not exist"));
                }

                path.to_path_buf()
            }
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);

                if !candidate.is_file() {
                    debug!("No {DEFAULT_CONFIG_FILE} found, using default settings");
                    return Ok(Self::default());
                }

                candidate
            }
        };

        debug!("Reading configuration from {path:?}");

        let ini = Ini::load_from_file(&path)
            .with_context(|| format!("Unable to read configuration file {path:?}"))?;

        Self::from_ini(&ini).with_context(|| format!("Unable to parse configuration file {path:?}"))
    }

    pub fn from_ini(ini: &Ini) -> anyhow::Result<Self> {
        for (section, properties) in ini.iter() {
            let known = section.and_then(|section| {
                KNOWN_KEYS
                    .iter()
                    .find(|(name, _keys)| *name == section)
                    .map(|(_name, keys)| *keys)
            });

            for (key, _value) in properties.iter() {
                if !known.is_some_and(|keys| keys.contains(&key)) {
                    debug!(
                        "Ignoring unknown configuration key [{}] {key}",
                        section.unwrap_or_default()
                    );
                }
            }
        }

        let ffmpeg = lookup(ini, SECTION_GENERAL, "ffmpeg", |value| {
            Ok(PathBuf::from(value.trim()))
        })?;

        Ok(Self {
            ffmpeg,
            vmaf_version: lookup(ini, SECTION_GENERAL, "vmaf_version", parse_enum)?,
            models: lookup(ini, SECTION_CALCULATIONS, "models", |value| {
                Ok(parse_models(value))
            })?,
            psnr: lookup(ini, SECTION_CALCULATIONS, "psnr", parse_bool)?,
            ssim: lookup(ini, SECTION_CALCULATIONS, "ssim", parse_bool)?,
            ms_ssim: lookup(ini, SECTION_CALCULATIONS, "ms_ssim", parse_bool)?,
            subsamples: lookup(ini, SECTION_CALCULATIONS, "subsamples", parse_number)?,
            log_format: lookup(ini, SECTION_CALCULATIONS, "log_format", parse_enum)?,
            log_directory: lookup(ini, SECTION_CALCULATIONS, "log_directory", |value| {
                Ok(PathBuf::from(value.trim()))
            })?,
            threads: lookup(ini, SECTION_CALCULATIONS, "threads", parse_number)?,
            processes: lookup(ini, SECTION_CALCULATIONS, "processes", parse_number)?,
            use_remaining_threads: lookup(
                ini,
                SECTION_CALCULATIONS,
                "use_remaining_threads",
                parse_bool,
            )?,
            hwaccel: lookup(ini, SECTION_CALCULATIONS, "hwaccel", parse_bool)?,
            output: lookup(ini, SECTION_GRAPHING, "output", |value| {
                Ok(PathBuf::from(value.trim()))
            })?
            .filter(|path| !path.as_os_str().is_empty()),
            output_types: lookup(ini, SECTION_GRAPHING, "output_types", parse_enum_list)?,
            datapoints: lookup(ini, SECTION_GRAPHING, "datapoints", parse_enum_list)?,
            resolution: lookup(ini, SECTION_GRAPHING, "resolution", parse_enum)?,
            lower_boundary: lookup(ini, SECTION_GRAPHING, "lower_boundary", parse_enum)?,
            custom: lookup(ini, SECTION_GRAPHING, "custom", parse_number)?,
            image_width: lookup(ini, SECTION_IMAGE, "x", parse_number)?,
            image_height: lookup(ini, SECTION_IMAGE, "y", parse_number)?,
            transparent: lookup(ini, SECTION_IMAGE, "transparent", parse_bool)?,
        })
    }

    #[must_use]
    pub fn default_ini() -> Ini {
        let mut ini = Ini::new();

        ini.with_section(Some(SECTION_GENERAL))
            .set("ffmpeg", "ffmpeg")
            .set("vmaf_version", "2");

        ini.with_section(Some(SECTION_CALCULATIONS))
            .set("models", DEFAULT_MODEL)
            .set("psnr", "false")
            .set("ssim", "false")
            .set("ms_ssim", "false")
            .set("subsamples", "1")
            .set("log_format", "xml")
            .set("log_directory", "logs")
            .set("threads", "0")
            .set("processes", "1")
            .set("use_remaining_threads", "false")
            .set("hwaccel", "false");

        ini.with_section(Some(SECTION_GRAPHING))
            .set("output_types", "all")
            .set("datapoints", "all")
            .set("resolution", "1080")
            .set("lower_boundary", "default")
            .set("custom", "0");

        ini.with_section(Some(SECTION_IMAGE))
            .set("transparent", "true");

        ini
    }

    pub fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
        if path.exists() && !force {
            return Err(anyhow!(
                "{path:?} already exists; pass --force to overwrite it"
            ));
        }

        verify_filename(path)?;

        Self::default_ini()
            .write_to_file(path)
            .with_context(|| format!("Unable to write configuration file {path:?}"))?;

        Ok(())
    }
}

/// Distributes the available cores between FFmpeg processes and returns the libvmaf thread
/// count for each worker.
#[allow(clippy::integer_division)]
#[must_use]
pub fn plan_workers(
    threads: usize,
    processes: usize,
    use_remaining_threads: bool,
    cores: usize,
) -> Vec<usize> {
    let cores = cores.max(1);

    let mut processes = if processes == 0 {
        1
    } else if processes > cores {
        warn!(
            "{processes} processes requested but the system only has {cores} threads, running 1 process"
        );
        1
    } else {
        processes
    };

    let threads = if threads == 0 {
        (cores / processes).max(1)
    } else if threads > cores {
        warn!(
            "{threads} threads requested but the system only has {cores} threads, using 1 thread per process"
        );
        1
    } else {
        threads
    };

    if threads * processes > cores {
        let reduced = (cores / threads).max(1);

        warn!(
            "Unable to run {processes} processes with {threads} threads each on {cores} threads, running {reduced} processes instead"
        );

        processes = reduced;
    }

    let mut workers = vec![threads; processes];
    let remaining = cores.saturating_sub(threads * processes);

    if use_remaining_threads && remaining > 0 {
        workers.push(remaining);
    }

    workers
}

#[derive(Clone, Debug)]
pub struct CalculationSettings {
    pub reference: PathBuf,
    pub encoded: Vec<PathBuf>,
    pub recursive: bool,
    pub ffmpeg: PathBuf,
    pub vmaf_version: VmafVersion,
    pub models: Vec<String>,
    pub psnr: bool,
    pub ssim: bool,
    pub ms_ssim: bool,
    pub subsamples: Option<u32>,
    pub log_format: LogFormat,
    pub log_directory: PathBuf,
    pub hwaccel: bool,
    pub workers: Vec<usize>,
    pub fresh: bool,
    pub move_completed: bool,
}

/// Resolves an on/off switch from its `--flag` and `--no-flag` forms, falling back to the
/// configuration file.
const fn switch(enabled: bool, disabled: bool, file: Option<bool>) -> bool {
    if enabled {
        true
    } else if disabled {
        false
    } else {
        match file {
            Some(value) => value,
            None => false,
        }
    }
}

impl CalculationSettings {
    pub fn resolve(args: &CalculateArgs, file: &ConfigFile, cores: usize) -> anyhow::Result<Self> {
        if !args.reference.is_file() {
            return Err(anyhow!(
                "Reference {:?} does not exist or is not a file",
                args.reference
            ));
        }

        let models = if args.models.is_empty() {
            file.models
                .clone()
                .filter(|models| !models.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_MODEL.to_owned()])
        } else {
            args.models.clone()
        };

        let threads = args.threads.or(file.threads).unwrap_or(0);
        let processes = args.processes.or(file.processes).unwrap_or(1);
        let use_remaining_threads = switch(
            args.use_remaining_threads,
            args.no_use_remaining_threads,
            file.use_remaining_threads,
        );

        Ok(Self {
            reference: args.reference.clone(),
            encoded: args.encoded.clone(),
            recursive: args.recursive,
            ffmpeg: args
                .ffmpeg
                .clone()
                .or_else(|| file.ffmpeg.clone())
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            vmaf_version: args
                .vmaf_version
                .or(file.vmaf_version)
                .unwrap_or_default(),
            models,
            psnr: switch(args.psnr, args.no_psnr, file.psnr),
            ssim: switch(args.ssim, args.no_ssim, file.ssim),
            ms_ssim: switch(args.ms_ssim, args.no_ms_ssim, file.ms_ssim),
            subsamples: args
                .subsamples
                .or(file.subsamples)
                .filter(|subsamples| *subsamples > 1),
            log_format: args.log_format.or(file.log_format).unwrap_or(LogFormat::Xml),
            log_directory: args
                .log_directory
                .clone()
                .or_else(|| file.log_directory.clone())
                .unwrap_or_else(|| PathBuf::from("logs")),
            hwaccel: switch(args.hwaccel, args.no_hwaccel, file.hwaccel),
            workers: plan_workers(threads, processes, use_remaining_threads, cores),
            fresh: args.fresh,
            move_completed: args.move_completed,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PlotSettings {
    pub reports: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub output_types: Vec<OutputType>,
    pub datapoints: Vec<Datapoint>,
    pub resolution: Resolution,
    pub width: u32,
    pub height: u32,
    pub lower_boundary: LowerBoundary,
    pub custom: f64,
    pub transparent: bool,
}

impl PlotSettings {
    pub fn resolve(args: &PlotArgs, file: &ConfigFile) -> anyhow::Result<Self> {
        let output_types = if args.output_types.is_empty() {
            OutputType::expand(file.output_types.as_deref().unwrap_or_default())
        } else {
            OutputType::expand(&args.output_types)
        };

        let datapoints = if args.datapoints.is_empty() {
            DatapointChoice::expand(file.datapoints.as_deref().unwrap_or_default())
        } else {
            DatapointChoice::expand(&args.datapoints)
        };

        let resolution = args
            .resolution
            .or(file.resolution)
            .unwrap_or(Resolution::FullHd);

        let (default_width, default_height) = resolution.dimensions();

        let lower_boundary = args
            .lower_boundary
            .or(file.lower_boundary)
            .unwrap_or(LowerBoundary::Default);

        let custom = args.custom.or(file.custom).unwrap_or(0.0);

        if lower_boundary == LowerBoundary::Custom && !custom.is_finite() {
            return Err(anyhow!("Custom lower boundary must be a finite number"));
        }

        Ok(Self {
            reports: args.reports.clone(),
            output: args.output.clone().or_else(|| file.output.clone()),
            output_types,
            datapoints,
            resolution,
            width: file.image_width.unwrap_or(default_width),
            height: file.image_height.unwrap_or(default_height),
            lower_boundary,
            custom,
            transparent: file.transparent.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> anyhow::Result<ConfigFile> {
        ConfigFile::from_ini(&Ini::load_from_str(text)?)
    }

    #[test]
    fn default_ini_round_trips_to_defaults() {
        let mut buffer = Vec::new();
        ConfigFile::default_ini().write_to(&mut buffer).unwrap();
        let config = parse(std::str::from_utf8(&buffer).unwrap()).unwrap();

        assert_eq!(config.ffmpeg, Some(PathBuf::from("ffmpeg")));
        assert_eq!(config.vmaf_version, Some(VmafVersion::V2));
        assert_eq!(config.models, Some(vec![DEFAULT_MODEL.to_owned()]));
        assert_eq!(config.log_format, Some(LogFormat::Xml));
        assert_eq!(config.processes, Some(1));
        assert_eq!(config.resolution, Some(Resolution::FullHd));
        assert_eq!(config.output_types, Some(vec![OutputType::All]));
        assert_eq!(config.transparent, Some(true));
    }

    #[test]
    fn parses_booleans_lists_and_enums() {
        let config = parse(
            "[Calculations]\npsnr = yes\nssim = Off\nmodels = vmaf_v0.6.1, vmaf_4k_v0.6.1\nlog_format = JSON\n\n[Graphing]\ndatapoints = vmaf ms_ssim\nresolution = 4k\n",
        )
        .unwrap();

        assert_eq!(config.psnr, Some(true));
        assert_eq!(config.ssim, Some(false));
        assert_eq!(config.ms_ssim, None);
        assert_eq!(
            config.models,
            Some(vec!["vmaf_v0.6.1".to_owned(), "vmaf_4k_v0.6.1".to_owned()])
        );
        assert_eq!(config.log_format, Some(LogFormat::Json));
        assert_eq!(
            config.datapoints,
            Some(vec![DatapointChoice::Vmaf, DatapointChoice::MsSsim])
        );
        assert_eq!(config.resolution, Some(Resolution::Uhd));
    }

    #[test]
    fn model_paths_keep_their_spaces() {
        let config = parse(
            "[General]\nvmaf_version = 1\n\n[Calculations]\nmodels = /models/My Models/vmaf_v0.6.1.pkl, vmaf_4k_v0.6.1 ,\n",
        )
        .unwrap();

        assert_eq!(config.vmaf_version, Some(VmafVersion::V1));
        assert_eq!(
            config.models,
            Some(vec![
                "/models/My Models/vmaf_v0.6.1.pkl".to_owned(),
                "vmaf_4k_v0.6.1".to_owned()
            ])
        );
    }

    #[test]
    fn malformed_value_names_section_and_key() {
        let error = parse("[Calculations]\nthreads = many\n").unwrap_err();

        assert!(format!("{error:#}").contains("[Calculations] threads"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let directory = tempfile::tempdir().unwrap();

        assert!(ConfigFile::load(Some(&directory.path().join("missing.ini"))).is_err());
        assert!(ConfigFile::load(Some(directory.path())).is_err());
    }

    #[test]
    fn directory_config_uses_config_ini() {
        let directory = tempfile::tempdir().unwrap();
        std::fs::write(
            directory.path().join(DEFAULT_CONFIG_FILE),
            "[Calculations]\nprocesses = 3\n",
        )
        .unwrap();

        let config = ConfigFile::load(Some(directory.path())).unwrap();
        assert_eq!(config.processes, Some(3));
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(DEFAULT_CONFIG_FILE);

        ConfigFile::write_default(&path, false).unwrap();
        assert!(ConfigFile::write_default(&path, false).is_err());
        ConfigFile::write_default(&path, true).unwrap();
    }

    #[test]
    fn plan_workers_divides_cores() {
        assert_eq!(plan_workers(0, 4, false, 16), vec![4, 4, 4, 4]);
        assert_eq!(plan_workers(4, 2, false, 16), vec![4, 4]);
        assert_eq!(plan_workers(0, 0, false, 8), vec![8]);
    }

    #[test]
    fn plan_workers_clamps_oversubscription() {
        assert_eq!(plan_workers(32, 1, false, 16), vec![1]);
        assert_eq!(plan_workers(1, 32, false, 16), vec![1]);
        assert_eq!(plan_workers(3, 5, false, 13), vec![3, 3, 3, 3]);
    }

    #[test]
    fn plan_workers_uses_remaining_threads() {
        assert_eq!(plan_workers(3, 5, true, 13), vec![3, 3, 3, 3, 1]);
        assert_eq!(plan_workers(4, 4, true, 16), vec![4, 4, 4, 4]);
    }

    #[test]
    fn command_line_overrides_config_file() {
        let directory = tempfile::tempdir().unwrap();
        let reference = directory.path().join("reference.mkv");
        std::fs::write(&reference, b"").unwrap();

        let file = ConfigFile {
            models: Some(vec!["vmaf_4k_v0.6.1".to_owned()]),
            log_format: Some(LogFormat::Csv),
            psnr: Some(true),
            subsamples: Some(1),
            processes: Some(2),
            ..ConfigFile::default()
        };

        let args = CalculateArgs {
            reference,
            log_format: Some(LogFormat::Json),
            processes: Some(4),
            ..CalculateArgs::default()
        };

        let settings = CalculationSettings::resolve(&args, &file, 8).unwrap();

        assert_eq!(settings.models, vec!["vmaf_4k_v0.6.1".to_owned()]);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert!(settings.psnr);
        assert_eq!(settings.subsamples, None);
        assert_eq!(settings.workers, vec![2, 2, 2, 2]);
        assert_eq!(settings.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn negated_flags_override_config_file() {
        let directory = tempfile::tempdir().unwrap();
        let reference = directory.path().join("reference.mkv");
        std::fs::write(&reference, b"").unwrap();
        let reference = reference.to_string_lossy().to_string();

        let file = ConfigFile {
            vmaf_version: Some(VmafVersion::V1),
            psnr: Some(true),
            ssim: Some(true),
            hwaccel: Some(true),
            use_remaining_threads: Some(true),
            ..ConfigFile::default()
        };

        let cli = Cli::try_parse_from([
            "vmaf-suite",
            "calculate",
            reference.as_str(),
            "--no-psnr",
            "--no-hwaccel",
            "--no-use-remaining-threads",
            "--ms-ssim",
            "--vmaf-version",
            "2",
        ])
        .unwrap();

        let Command::Calculate(args) = cli.command else {
            panic!("expected the calculate command");
        };

        let settings = CalculationSettings::resolve(&args, &file, 8).unwrap();

        assert!(!settings.psnr);
        assert!(settings.ssim);
        assert!(settings.ms_ssim);
        assert!(!settings.hwaccel);
        assert_eq!(settings.vmaf_version, VmafVersion::V2);
        assert_eq!(settings.workers, vec![8]);

        let cli =
            Cli::try_parse_from(["vmaf-suite", "calculate", "reference.mkv", "--no-psnr", "--psnr"])
                .unwrap();

        let Command::Calculate(args) = cli.command else {
            panic!("expected the calculate command");
        };

        assert!(args.psnr);
        assert!(!args.no_psnr);
    }

    #[test]
    fn plot_settings_expand_all() {
        let args = PlotArgs {
            reports: vec![PathBuf::from("reports")],
            ..PlotArgs::default()
        };

        let settings = PlotSettings::resolve(&args, &ConfigFile::default()).unwrap();

        assert_eq!(
            settings.output_types,
            vec![OutputType::Image, OutputType::Stats, OutputType::Agg]
        );
        assert_eq!(settings.datapoints, Datapoint::ALL.to_vec());
        assert_eq!((settings.width, settings.height), (1920, 1080));
    }
}
