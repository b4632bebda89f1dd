use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_queue::ArrayQueue;
use indicatif::{HumanDuration, ProgressBar};
use prettytable::{row, Table};
use tracing::{debug, error, info, warn};

use crate::config::CalculationSettings;
use crate::ffmpeg::{
    parse_vmaf_score, resolve_executable, spawn_vmaf, supports_libvmaf, vmaf_args, Model,
    VmafFilter,
};
use crate::ledger::{Ledger, Status};
use crate::util::{create_progress_style, find_files, verify_directory, HumanSize, VIDEO_EXTENSIONS};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LINES: usize = 10;

#[derive(Clone, Debug)]
struct Job {
    file: String,
    model: Model,
    distorted: PathBuf,
    log_path: PathBuf,
}

enum Outcome {
    Started { id: usize, graph: String },
    Finished { id: usize, result: anyhow::Result<f64> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Score {
    pub file: String,
    pub model: String,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct Summary {
    pub scores: Vec<Score>,
    pub elapsed: Duration,
}

/// Spawns a helper thread that raises the returned flag when Ctrl-C is received.
pub fn watch_for_interrupt() -> anyhow::Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Unable to create signal handling runtime")?;

    let flag = Arc::clone(&interrupted);

    std::thread::Builder::new()
        .name("interrupt-watcher".to_owned())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Interrupt received, shutting down");
                        flag.store(true, Ordering::SeqCst);
                    }
                    Err(err) => error!("Unable to listen for interrupt signal: {err}"),
                }
            });
        })
        .context("Unable to spawn interrupt watcher thread")?;

    Ok(interrupted)
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

fn log_path(settings: &CalculationSettings, distorted: &Path, model: &Model) -> PathBuf {
    let stem = distorted
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    settings.log_directory.join(format!(
        "{stem}_{}.{}",
        model.name(),
        settings.log_format.extension()
    ))
}

struct Dispatcher<'a> {
    settings: &'a CalculationSettings,
    executable: PathBuf,
    jobs: Vec<Job>,
    children: Mutex<HashMap<usize, Child>>,
    cancelled: AtomicBool,
}

impl Dispatcher<'_> {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.kill_running();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn kill_running(&self) {
        match self.children.lock() {
            Ok(mut children) => {
                for (id, child) in children.iter_mut() {
                    match child.kill() {
                        Ok(()) => info!("Terminated FFmpeg process {} (job {id})", child.id()),
                        Err(err) => debug!("Unable to terminate FFmpeg process {}: {err}", child.id()),
                    }
                }
            }
            Err(_) => error!("Unable to access running FFmpeg processes"),
        }
    }

    fn filter(&self, job: &Job, threads: usize) -> VmafFilter {
        VmafFilter {
            version: self.settings.vmaf_version,
            model: job.model.clone(),
            log_format: self.settings.log_format,
            log_path: job.log_path.clone(),
            psnr: self.settings.psnr,
            ssim: self.settings.ssim,
            ms_ssim: self.settings.ms_ssim,
            subsamples: self.settings.subsamples,
            threads: Some(threads),
        }
    }

    fn run_job(&self, id: usize, job: &Job, graph: &str, threads: usize) -> anyhow::Result<f64> {
        let args = vmaf_args(
            &job.distorted,
            &self.settings.reference,
            graph,
            threads,
            self.settings.hwaccel,
        );

        debug!(
            "Running {:?} {}",
            self.executable,
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = spawn_vmaf(&self.executable, &args)?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Unable to capture FFmpeg error output"))?;

        self.children
            .lock()
            .map_err(|_| anyhow!("Running FFmpeg process registry is poisoned"))?
            .insert(id, child);

        if self.is_cancelled() {
            self.kill_running();
        }

        let mut output = vec![];
        let read_result = stderr.read_to_end(&mut output);

        let mut child = self
            .children
            .lock()
            .map_err(|_| anyhow!("Running FFmpeg process registry is poisoned"))?
            .remove(&id)
            .ok_or_else(|| anyhow!("FFmpeg process for job {id} is no longer registered"))?;

        let status = child
            .wait()
            .context("Unable to wait for FFmpeg subprocess")?;

        read_result.context("Unable to read FFmpeg error output")?;

        let output = String::from_utf8_lossy(&output);

        if !status.success() {
            if self.is_cancelled() {
                return Err(anyhow!("FFmpeg subprocess was cancelled"));
            }

            return Err(anyhow!(
                "FFmpeg exited with {status}:\n{}",
                tail(&output)
            ));
        }

        parse_vmaf_score(&output)
    }

    fn work(
        &self,
        threads: usize,
        job_queue: &ArrayQueue<usize>,
        outcome_queue: &ArrayQueue<Outcome>,
    ) -> anyhow::Result<()> {
        while !self.is_cancelled() {
            let Some(id) = job_queue.pop() else {
                break;
            };

            let job = self.job(id)?;
            let graph = self.filter(job, threads).graph();

            if outcome_queue
                .push(Outcome::Started {
                    id,
                    graph: graph.clone(),
                })
                .is_err()
            {
                return Err(anyhow!("Calculation result queue was unexpectedly full"));
            }

            let result = self.run_job(id, job, &graph, threads);
            let failed = result.is_err();

            if outcome_queue.push(Outcome::Finished { id, result }).is_err() {
                return Err(anyhow!("Calculation result queue was unexpectedly full"));
            }

            // Pushed first so the failure is reported ahead of the jobs it cancels.
            if failed {
                self.cancel();
            }
        }

        Ok(())
    }

    fn job(&self, id: usize) -> anyhow::Result<&Job> {
        self.jobs
            .get(id)
            .ok_or_else(|| anyhow!("Unable to find calculation job {id}"))
    }

    fn record(
        &self,
        outcome: Outcome,
        ledger: &mut Ledger,
        failure: &mut Option<anyhow::Error>,
        scores: &mut Vec<Score>,
        progress_bar: &ProgressBar,
    ) -> anyhow::Result<()> {
        match outcome {
            Outcome::Started { id, graph } => {
                let job = self.job(id)?;

                progress_bar.set_message(format!("{} ({})", job.file, job.model));

                ledger.update(&job.file, &job.model.key(), |entry| {
                    entry.status = Status::Started;
                    entry.score = None;
                    entry.log_path = Some(job.log_path.clone());
                    entry.filter = Some(graph);
                })?;
            }
            Outcome::Finished { id, result } => {
                let job = self.job(id)?;

                match result {
                    Ok(score) => {
                        info!("{} with model {}: VMAF score {score}", job.file, job.model);

                        ledger.update(&job.file, &job.model.key(), |entry| {
                            entry.status = Status::Done;
                            entry.score = Some(score);
                        })?;

                        scores.push(Score {
                            file: job.file.clone(),
                            model: job.model.name(),
                            score,
                        });

                        progress_bar.inc(1);

                        if ledger.is_file_complete(&job.file) {
                            finish_file(self.settings, ledger, &job.file)?;
                        }
                    }
                    Err(err) => {
                        if failure.is_none() {
                            error!("Calculation failed for {} with model {}: {err:?}", job.file, job.model);

                            *failure = Some(err.context(format!(
                                "Unable to calculate VMAF for {} with model {}",
                                job.file, job.model
                            )));

                            self.cancel();
                        }

                        cancel_entry(ledger, job)?;
                    }
                }
            }
        }

        ledger.save()
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &self,
        ledger: &mut Ledger,
        interrupted: &AtomicBool,
    ) -> anyhow::Result<Vec<Score>> {
        let job_queue: ArrayQueue<usize> = ArrayQueue::new(self.jobs.len().max(1));
        let outcome_queue: ArrayQueue<Outcome> = ArrayQueue::new(self.jobs.len().max(1) * 2);

        for id in 0..self.jobs.len() {
            if job_queue.push(id).is_err() {
                return Err(anyhow!("Calculation job queue was unexpectedly full"));
            }
        }

        let progress_bar = ProgressBar::new(self.jobs.len().try_into().unwrap_or(u64::MAX));

        progress_bar.set_style(
            create_progress_style(
                "{spinner:.green} [{elapsed_precise}] Calculating VMAF... [{wide_bar:.cyan/blue}] {percent:>3}% {human_pos:>4}/{human_len:>4} ({smooth_per_min:>6}/min, ETA: {smooth_eta:>3}) {msg}",
            )
            .context("Unable to create calculation progress bar style")?,
        );

        progress_bar.enable_steady_tick(Duration::from_secs(1));

        let mut failure: Option<anyhow::Error> = None;
        let mut scores = vec![];

        let result = std::thread::scope(|scope| -> anyhow::Result<()> {
            let job_queue = &job_queue;
            let outcome_queue = &outcome_queue;

            let threads = self
                .settings
                .workers
                .iter()
                .enumerate()
                .map(|(index, &threads)| {
                    std::thread::Builder::new()
                        .name(format!("vmaf-worker-{index}"))
                        .spawn_scoped(scope, move || {
                            self.work(threads, job_queue, outcome_queue)
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .context("Unable to spawn calculation workers")?;

            while threads.iter().any(|thread| !thread.is_finished()) || !outcome_queue.is_empty()
            {
                if interrupted.load(Ordering::SeqCst) && !self.is_cancelled() {
                    warn!("Cancelling outstanding calculations");
                    failure = Some(anyhow!("Calculation was interrupted"));
                    self.cancel();
                }

                let mut idle = true;

                while let Some(outcome) = outcome_queue.pop() {
                    idle = false;

                    if let Err(err) =
                        self.record(outcome, ledger, &mut failure, &mut scores, &progress_bar)
                    {
                        self.cancel();
                        return Err(err);
                    }
                }

                if idle {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }

            for thread in threads {
                match thread.join() {
                    Ok(result) => result.context("Calculation worker failed")?,
                    Err(err) => return Err(anyhow!("Calculation worker panicked: {err:?}")),
                }
            }

            Ok(())
        })
        .context("Unable to execute calculation workers");

        progress_bar.finish();

        if let Err(err) = result {
            self.cancel();

            if failure.is_some() {
                error!("{err:?}");
            } else {
                failure = Some(err);
            }
        }

        if self.is_cancelled() {
            while let Some(id) = job_queue.pop() {
                cancel_entry(ledger, self.job(id)?)?;
            }

            for job in &self.jobs {
                if ledger
                    .entry(&job.file, &job.model.key())
                    .is_some_and(|entry| entry.status == Status::Started)
                {
                    cancel_entry(ledger, job)?;
                }
            }

            ledger.save()?;

            return Err(failure.unwrap_or_else(|| anyhow!("Calculation was cancelled")));
        }

        Ok(scores)
    }
}

fn cancel_entry(ledger: &mut Ledger, job: &Job) -> anyhow::Result<()> {
    if job.log_path.exists() {
        std::fs::remove_file(&job.log_path)
            .with_context(|| format!("Unable to delete partial log file {:?}", job.log_path))?;
    }

    ledger.set_status(&job.file, &job.model.key(), Status::Cancelled)
}

fn aggregate_path(settings: &CalculationSettings, distorted: &Path) -> PathBuf {
    let stem = distorted
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    settings
        .log_directory
        .join(format!("{stem}_aggregate.txt"))
}

/// Logs and aggregate files are named after the file stem alone, so two distorted files sharing a
/// stem (e.g. in different subdirectories) would overwrite each other's output.
fn check_name_collisions(settings: &CalculationSettings, ledger: &Ledger) -> anyhow::Result<()> {
    let mut names: HashMap<PathBuf, &str> = HashMap::new();

    for file in ledger.files().keys() {
        let path = aggregate_path(settings, Path::new(file));

        if let Some(other) = names.insert(path, file) {
            return Err(anyhow!(
                "Encoded video files {other:?} and {file:?} share a file name, so their VMAF logs would overwrite each other"
            ));
        }
    }

    Ok(())
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn write_aggregate(settings: &CalculationSettings, ledger: &Ledger, file: &str) -> anyhow::Result<()> {
    let models = ledger
        .files()
        .get(file)
        .ok_or_else(|| anyhow!("No completions entries for {file}"))?;

    let distorted = Path::new(file);
    let mut contents = String::new();
    let mut scores = vec![];

    for (model, entry) in models {
        if let Some(score) = entry.score {
            writeln!(contents, "{model} Score: {score}")?;
            scores.push(score);
        }
    }

    let average = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    let size = std::fs::metadata(distorted)
        .with_context(|| format!("Unable to read size of {distorted:?}"))?
        .len();

    writeln!(contents, "\nAverage Score: {average}")?;
    writeln!(contents, "File Size: {size}B = {}", HumanSize(size))?;

    let path = aggregate_path(settings, distorted);

    std::fs::write(&path, contents)
        .with_context(|| format!("Unable to write aggregate score file {path:?}"))?;

    info!("Wrote aggregate scores for {file} to {path:?}");

    Ok(())
}

fn move_completed(ledger: &mut Ledger, file: &str) -> anyhow::Result<()> {
    let distorted = Path::new(file);

    let stem = distorted
        .file_stem()
        .ok_or_else(|| anyhow!("Unable to determine file stem of {distorted:?}"))?
        .to_string_lossy();

    let file_name = distorted
        .file_name()
        .ok_or_else(|| anyhow!("Unable to determine file name of {distorted:?}"))?;

    let results_directory = distorted.with_file_name(format!("{stem}_results"));

    verify_directory(&results_directory)?;

    let destination = results_directory.join(file_name);

    std::fs::rename(distorted, &destination)
        .with_context(|| format!("Unable to move {distorted:?} to {destination:?}"))?;

    info!("Moved {distorted:?} to {destination:?}");

    let models: Vec<String> = ledger
        .files()
        .get(file)
        .map(|models| models.keys().cloned().collect())
        .unwrap_or_default();

    for model in models {
        ledger.set_status(file, &model, Status::Moved)?;
    }

    Ok(())
}

/// Writes the aggregate score file for a distorted file whose models are all done and, when
/// configured, moves the file into its results directory.
fn finish_file(settings: &CalculationSettings, ledger: &mut Ledger, file: &str) -> anyhow::Result<()> {
    write_aggregate(settings, ledger, file)?;

    if settings.move_completed {
        move_completed(ledger, file)?;
    }

    Ok(())
}

/// Scores every pending `(distorted file, model)` pair against the reference. The ledger is kept
/// current throughout, and any failure or interrupt cancels all outstanding work.
pub fn calculate(settings: &CalculationSettings, interrupted: &AtomicBool) -> anyhow::Result<Summary> {
    let start_time = Instant::now();
    let executable = resolve_executable(&settings.ffmpeg);

    if !supports_libvmaf(&executable)
        .with_context(|| format!("Unable to verify FFmpeg executable {executable:?}"))?
    {
        return Err(anyhow!(
            "{executable:?} was not built with the libvmaf filter"
        ));
    }

    let models = settings
        .models
        .iter()
        .map(|model| Model::parse(model, settings.vmaf_version))
        .collect::<anyhow::Result<Vec<_>>>()
        .context("Unable to load VMAF models")?;

    let files = if settings.encoded.is_empty() {
        vec![]
    } else {
        find_files(&settings.encoded, &VIDEO_EXTENSIONS, settings.recursive)
            .context("Unable to find encoded video files")?
    };

    let mut ledger = Ledger::open(&settings.reference, settings.fresh)
        .context("Unable to open completions file")?;

    if files.is_empty() && ledger.is_empty() {
        return Err(anyhow!(
            "No encoded video files were given and no completions file exists for {:?}",
            settings.reference
        ));
    }

    let reset = ledger.reset_unfinished()?;

    if reset > 0 {
        info!("Restarting {reset} calculations left unfinished by an earlier run");
    }

    for file in &files {
        let file = file.to_string_lossy();

        for model in &models {
            ledger.register(&file, &model.key());
        }
    }

    check_name_collisions(settings, &ledger)?;

    verify_directory(&settings.log_directory)?;

    if settings.move_completed {
        let finished: Vec<String> = ledger
            .files()
            .iter()
            .filter(|(file, models)| {
                ledger.is_file_complete(file)
                    && models.values().any(|entry| entry.status == Status::Done)
            })
            .map(|(file, _)| file.clone())
            .collect();

        for file in finished {
            finish_file(settings, &mut ledger, &file)?;
        }
    }

    let mut jobs = vec![];

    for (file, model) in ledger.pending() {
        let distorted = PathBuf::from(&file);

        if !distorted.is_file() {
            warn!("Skipping {model} for {distorted:?}, which no longer exists");
            continue;
        }

        let model = Model::parse(&model, settings.vmaf_version)
            .with_context(|| format!("Unable to resume {file} with model {model}"))?;

        jobs.push(Job {
            log_path: log_path(settings, &distorted, &model),
            file,
            model,
            distorted,
        });
    }

    ledger.save()?;

    if jobs.is_empty() {
        info!("All calculations in {:?} are already complete", ledger.path());

        return Ok(Summary {
            scores: vec![],
            elapsed: start_time.elapsed(),
        });
    }

    info!(
        "Submitting {} calculations across {} workers",
        jobs.len(),
        settings.workers.len()
    );

    let dispatcher = Dispatcher {
        settings,
        executable,
        jobs,
        children: Mutex::new(HashMap::new()),
        cancelled: AtomicBool::new(false),
    };

    let scores = dispatcher.dispatch(&mut ledger, interrupted)?;

    Ok(Summary {
        scores,
        elapsed: start_time.elapsed(),
    })
}

#[allow(clippy::print_stdout)]
#[allow(clippy::as_conversions)]
#[allow(clippy::cast_possible_truncation)]
pub fn print_summary(summary: &Summary) {
    if summary.scores.is_empty() {
        println!("Nothing to calculate.");
        return;
    }

    let mut table = Table::new();
    table.set_titles(row!["Encoded", "Model", "VMAF Score"]);

    for score in &summary.scores {
        table.add_row(row![score.file, score.model, r->format!("{:.6}", score.score)]);
    }

    table.printstd();

    println!(
        "Calculated {} scores in {} (average {} per calculation)",
        summary.scores.len(),
        HumanDuration(summary.elapsed),
        HumanDuration(summary.elapsed / summary.scores.len() as u32)
    );
}

#[allow(clippy::print_stdout)]
pub fn print_status(reference: &Path) -> anyhow::Result<()> {
    let path = Ledger::path_for(reference)?;

    if !path.exists() {
        return Err(anyhow!("No completions file exists for {reference:?}"));
    }

    let ledger = Ledger::load(&path)?;

    let mut table = Table::new();
    table.set_titles(row!["Encoded", "Model", "Status", "Score", "Log"]);

    for (file, models) in ledger.files() {
        for (model, entry) in models {
            table.add_row(row![
                file,
                model,
                entry.status,
                r->entry.score.map_or_else(String::new, |score| format!("{score:.6}")),
                entry
                    .log_path
                    .as_ref()
                    .map_or_else(String::new, |path| path.to_string_lossy().to_string())
            ]);
        }
    }

    table.printstd();

    Ok(())
}
