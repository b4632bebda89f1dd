use anyhow::Context;

pub mod calculator;
pub mod config;
pub mod ffmpeg;
pub mod ledger;
pub mod plotter;
pub mod report;
pub mod statistics;
pub mod util;

use config::{CalculationSettings, Cli, Command, ConfigFile, PlotSettings};

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Calculate(args) => {
            let file = ConfigFile::load(cli.config.as_deref())
                .context("Unable to load configuration file")?;
            let settings = CalculationSettings::resolve(args, &file, num_cpus::get())
                .context("Unable to resolve calculation settings")?;

            let interrupted =
                calculator::watch_for_interrupt().context("Unable to install interrupt handler")?;

            let summary = calculator::calculate(&settings, &interrupted)
                .context("Unable to calculate VMAF scores")?;

            calculator::print_summary(&summary);
        }
        Command::Plot(args) => {
            let file = ConfigFile::load(cli.config.as_deref())
                .context("Unable to load configuration file")?;
            let settings =
                PlotSettings::resolve(args, &file).context("Unable to resolve plot settings")?;

            plotter::plot(&settings).context("Unable to plot VMAF reports")?;
        }
        Command::Status(args) => {
            calculator::print_status(&args.reference).context("Unable to show completions")?;
        }
        Command::InitConfig(args) => {
            ConfigFile::write_default(&args.path, args.force)
                .context("Unable to write default configuration file")?;
        }
    }

    Ok(())
}
