use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "machine-monitor-rs",
    version,
    about = "Machine status & downtime accounting engine"
)]
pub struct Args {
    /// Run a single evaluation pass and exit instead of starting the schedulers.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}
