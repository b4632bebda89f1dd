use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use cached::{proc_macro::cached, UnboundCache};
use regex::Regex;
use tracing::debug;

use crate::config::{LogFormat, VmafVersion};

static SCORE_REGEX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"VMAF score\s*[:=]\s*([-+]?[0-9]*\.?[0-9]+)"));

const EXECUTABLE_NAME: &str = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };

/// Accepts an executable name, a path to the executable or a directory containing it.
#[must_use]
pub fn resolve_executable(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(EXECUTABLE_NAME)
    } else {
        path.to_path_buf()
    }
}

#[cached(
    result = true,
    ty = "UnboundCache<String, bool>",
    create = "{ UnboundCache::with_capacity(1) }",
    convert = r#"{ format!("{}", executable.to_string_lossy()) }"#
)]
pub fn supports_libvmaf(executable: &Path) -> anyhow::Result<bool> {
    let output = Command::new(executable)
        .arg("-hide_banner")
        .arg("-filters")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("Unable to run {executable:?} to list filters"))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{executable:?} exited with {} while listing filters",
            output.status
        ));
    }

    let supported = String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some("libvmaf"));

    debug!("libvmaf support in {executable:?}: {supported}");

    Ok(supported)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Model {
    File(PathBuf),
    Version(String),
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Model {
    /// Interprets a model argument. Arguments ending in `.json` or `.pkl` name a model file that
    /// must exist; anything else is a model version built into libvmaf. libvmaf 2.x only loads
    /// `.json` files, while 1.x only loads `.pkl` files and has no built-in versions.
    pub fn parse(argument: &str, version: VmafVersion) -> anyhow::Result<Self> {
        let path = Path::new(argument);

        let extension = path
            .extension()
            .map(|extension| extension.to_string_lossy().to_lowercase());

        let expected = match version {
            VmafVersion::V1 => "pkl",
            VmafVersion::V2 => "json",
        };

        match extension.as_deref() {
            Some(extension @ ("json" | "pkl")) => {
                if extension != expected {
                    return Err(anyhow!(
                        "VMAF model file {path:?} cannot be loaded by libvmaf {version}.x, which expects .{expected} models"
                    ));
                }

                if !path.is_file() {
                    return Err(anyhow!("VMAF model file {path:?} does not exist"));
                }

                Ok(Self::File(path.to_path_buf()))
            }
            _ if argument.trim().is_empty() => Err(anyhow!("VMAF model name must not be empty")),
            _ if version == VmafVersion::V1 => Err(anyhow!(
                "libvmaf 1.x needs a .pkl model file, not the model version '{}'",
                argument.trim()
            )),
            _ => Ok(Self::Version(argument.trim().to_owned())),
        }
    }

    /// The string this model was configured with, used as its completions key.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::File(path) => path.to_string_lossy().to_string(),
            Self::Version(version) => version.clone(),
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path
                .file_stem()
                .map_or_else(|| self.key(), |stem| stem.to_string_lossy().to_string()),
            Self::Version(version) => version.clone(),
        }
    }

    fn option(&self) -> String {
        match self {
            Self::File(path) => format!("path={}", path.to_string_lossy()),
            Self::Version(version) => format!("version={version}"),
        }
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());

    for character in value.chars() {
        if character == '\\' || special.contains(&character) {
            escaped.push('\\');
        }

        escaped.push(character);
    }

    escaped
}

/// Escapes a value for use inside a filter's option list.
#[must_use]
pub fn escape_option(value: &str) -> String {
    escape(value, &['\'', ':'])
}

/// Escapes a filter description for use inside a filter graph.
#[must_use]
pub fn escape_graph(value: &str) -> String {
    escape(value, &['\'', '[', ']', ',', ';'])
}

#[derive(Clone, Debug)]
pub struct VmafFilter {
    pub version: VmafVersion,
    pub model: Model,
    pub log_format: LogFormat,
    pub log_path: PathBuf,
    pub psnr: bool,
    pub ssim: bool,
    pub ms_ssim: bool,
    pub subsamples: Option<u32>,
    pub threads: Option<usize>,
}

impl VmafFilter {
    #[must_use]
    pub fn options(&self) -> String {
        let model = match self.version {
            VmafVersion::V1 => format!("model_path={}", escape_option(&self.model.key())),
            VmafVersion::V2 => format!("model={}", escape_option(&self.model.option())),
        };

        let mut options = vec![
            model,
            format!("log_fmt={}", self.log_format),
            format!(
                "log_path={}",
                escape_option(&self.log_path.to_string_lossy().replace('\\', "/"))
            ),
        ];

        let metrics = [
            (self.psnr, "psnr", "name=psnr"),
            (self.ssim, "ssim", "name=float_ssim"),
            (self.ms_ssim, "ms_ssim", "name=float_ms_ssim"),
        ];

        let enabled = metrics.iter().filter(|(enabled, _, _)| *enabled);

        match self.version {
            VmafVersion::V1 => {
                options.extend(enabled.map(|(_, flag, _)| format!("{flag}=1")));
            }
            VmafVersion::V2 => {
                let features = enabled.map(|(_, _, feature)| *feature).collect::<Vec<_>>();

                if !features.is_empty() {
                    options.push(format!("feature={}", features.join("|")));
                }
            }
        }

        if let Some(subsamples) = self.subsamples {
            options.push(format!("n_subsample={subsamples}"));
        }

        if let Some(threads) = self.threads {
            options.push(format!("n_threads={threads}"));
        }

        options.join(":")
    }

    #[must_use]
    pub fn graph(&self) -> String {
        [
            "[0:v:0]setpts=PTS-STARTPTS[distorted]".to_owned(),
            "[1:v:0]setpts=PTS-STARTPTS[reference]".to_owned(),
            format!(
                "[distorted][reference]libvmaf={}",
                escape_graph(&self.options())
            ),
        ]
        .join(";")
    }
}

#[must_use]
pub fn vmaf_args(
    distorted: &Path,
    reference: &Path,
    graph: &str,
    threads: usize,
    hwaccel: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-nostdin".into()];

    for input in [distorted, reference] {
        if hwaccel {
            args.push("-hwaccel".into());
            args.push("auto".into());
        }

        args.push("-threads".into());
        args.push(threads.to_string().into());
        args.push("-i".into());
        args.push(input.into());
    }

    args.push("-lavfi".into());
    args.push(graph.into());
    args.push("-f".into());
    args.push("null".into());
    args.push("-".into());

    args
}

pub fn spawn_vmaf(executable: &Path, args: &[OsString]) -> anyhow::Result<Child> {
    let child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Unable to spawn FFmpeg subprocess {executable:?}"))?;

    Ok(child)
}

/// Extracts the pooled score from the `VMAF score` line libvmaf prints when it finishes.
pub fn parse_vmaf_score(stderr: &str) -> anyhow::Result<f64> {
    let regex = SCORE_REGEX
        .as_ref()
        .map_err(|err| anyhow!("Unable to compile VMAF score regex: {err}"))?;

    let captures = regex
        .captures_iter(stderr)
        .last()
        .ok_or_else(|| anyhow!("FFmpeg output does not contain a VMAF score"))?;

    let value = captures
        .get(1)
        .ok_or_else(|| anyhow!("VMAF score line is missing its value"))?
        .as_str();

    value
        .parse()
        .with_context(|| format!("Unable to parse VMAF score '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> VmafFilter {
        VmafFilter {
            version: VmafVersion::V2,
            model: Model::Version("vmaf_v0.6.1".to_owned()),
            log_format: LogFormat::Xml,
            log_path: PathBuf::from("logs/clip_vmaf_v0.6.1.xml"),
            psnr: false,
            ssim: false,
            ms_ssim: false,
            subsamples: None,
            threads: None,
        }
    }

    #[test]
    fn builds_minimal_graph() {
        assert_eq!(
            filter().graph(),
            "[0:v:0]setpts=PTS-STARTPTS[distorted];[1:v:0]setpts=PTS-STARTPTS[reference];[distorted][reference]libvmaf=model=version=vmaf_v0.6.1:log_fmt=xml:log_path=logs/clip_vmaf_v0.6.1.xml"
        );
    }

    #[test]
    fn includes_optional_features() {
        let filter = VmafFilter {
            psnr: true,
            ms_ssim: true,
            subsamples: Some(5),
            threads: Some(8),
            log_format: LogFormat::Json,
            ..filter()
        };

        assert_eq!(
            filter.options(),
            "model=version=vmaf_v0.6.1:log_fmt=json:log_path=logs/clip_vmaf_v0.6.1.xml:feature=name=psnr|name=float_ms_ssim:n_subsample=5:n_threads=8"
        );
    }

    #[test]
    fn escapes_paths_at_both_levels() {
        assert_eq!(escape_option("C:/logs/a'b.xml"), r"C\:/logs/a\'b.xml");
        assert_eq!(escape_graph(r"log_path=C\:/x[1].xml"), r"log_path=C\\:/x\[1\].xml");

        let filter = VmafFilter {
            log_path: PathBuf::from("C:/logs/clip.xml"),
            ..filter()
        };

        assert!(filter.graph().ends_with(r"log_path=C\\:/logs/clip.xml"));
    }

    #[test]
    fn parses_models() {
        assert_eq!(
            Model::parse("vmaf_4k_v0.6.1", VmafVersion::V2).unwrap(),
            Model::Version("vmaf_4k_v0.6.1".to_owned())
        );
        assert!(Model::parse("missing/model.json", VmafVersion::V2).is_err());
        assert!(Model::parse(" ", VmafVersion::V2).is_err());

        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("custom_model.json");
        std::fs::write(&path, "{}").unwrap();

        let model = Model::parse(&path.to_string_lossy(), VmafVersion::V2).unwrap();
        assert_eq!(model.name(), "custom_model");
        assert_eq!(model.key(), path.to_string_lossy());
        assert!(model.option().starts_with("path="));
    }

    #[test]
    fn model_files_must_match_libvmaf_version() {
        let directory = tempfile::tempdir().unwrap();
        let pickle = directory.path().join("vmaf_v0.6.1.pkl");
        let json = directory.path().join("vmaf_v0.6.1.json");
        std::fs::write(&pickle, "").unwrap();
        std::fs::write(&json, "{}").unwrap();

        let error = Model::parse(&pickle.to_string_lossy(), VmafVersion::V2).unwrap_err();
        assert!(error.to_string().contains("libvmaf 2.x"));

        assert!(Model::parse(&json.to_string_lossy(), VmafVersion::V1).is_err());
        assert!(Model::parse("vmaf_v0.6.1", VmafVersion::V1).is_err());
        assert_eq!(
            Model::parse(&pickle.to_string_lossy(), VmafVersion::V1).unwrap(),
            Model::File(pickle)
        );
    }

    #[test]
    fn builds_libvmaf_1_options() {
        let filter = VmafFilter {
            version: VmafVersion::V1,
            model: Model::File(PathBuf::from("/models/vmaf_v0.6.1.pkl")),
            psnr: true,
            ssim: true,
            ms_ssim: true,
            subsamples: Some(2),
            threads: Some(4),
            ..filter()
        };

        assert_eq!(
            filter.options(),
            "model_path=/models/vmaf_v0.6.1.pkl:log_fmt=xml:log_path=logs/clip_vmaf_v0.6.1.xml:psnr=1:ssim=1:ms_ssim=1:n_subsample=2:n_threads=4"
        );
    }

    #[test]
    fn builds_command_line() {
        let args = vmaf_args(
            Path::new("clip.mkv"),
            Path::new("source.mkv"),
            "graph",
            4,
            true,
        );

        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();

        assert_eq!(
            args,
            [
                "-hide_banner", "-nostdin", "-hwaccel", "auto", "-threads", "4", "-i", "clip.mkv",
                "-hwaccel", "auto", "-threads", "4", "-i", "source.mkv", "-lavfi", "graph", "-f",
                "null", "-"
            ]
        );
    }

    #[test]
    fn parses_score_from_stderr() {
        let stderr = "frame= 240 fps= 40 q=-0.0 Lsize=N/A\n[Parsed_libvmaf_2 @ 0x55d1c7a0] VMAF score: 93.4\n";
        assert!((parse_vmaf_score(stderr).unwrap() - 93.4).abs() < f64::EPSILON);

        let stderr = "[libvmaf @ 0x1] VMAF score = 87.123456";
        assert!((parse_vmaf_score(stderr).unwrap() - 87.123_456).abs() < f64::EPSILON);

        assert!(parse_vmaf_score("Conversion failed!").is_err());
    }

    #[test]
    fn resolves_executable_inside_directory() {
        let directory = tempfile::tempdir().unwrap();

        assert_eq!(
            resolve_executable(directory.path()),
            directory.path().join(EXECUTABLE_NAME)
        );
        assert_eq!(
            resolve_executable(Path::new("ffmpeg")),
            PathBuf::from("ffmpeg")
        );
    }
}
