extern crate clap;

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use ndt7_speed::errors::exit_codes;
use ndt7_speed::measurements::Summary;
use ndt7_speed::ndt7::events::{Event, LogLevel};
use ndt7_speed::{Client, Settings, Subtest};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version = env!("NDT7_SPEED_VERSION"), about, long_about = None)]
struct Cli {
    /// Hostname or IP address of the ndt7 server
    hostname: Option<String>,

    /// Port of the ndt7 server
    #[arg(short, long)]
    port: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long)]
    disable_tls: bool,

    /// Accept any TLS certificate
    #[arg(long)]
    skip_tls_verify: bool,

    /// Requested test duration in seconds
    #[arg(short, long)]
    duration: Option<i64>,

    /// Let the server end the download early once BBR converges
    #[arg(long)]
    adaptive: bool,

    /// Scramble the plaintext connection (requires --disable-tls)
    #[arg(long)]
    scramble: bool,

    /// Settings as a JSON object, instead of the flags above
    #[arg(long, value_name = "JSON", conflicts_with = "hostname")]
    settings: Option<String>,

    /// Which subtest(s) to run
    #[arg(long, value_enum, default_value_t = SubtestArg::Download)]
    subtest: SubtestArg,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,

    #[command(flatten)]
    verbose: Verbosity,
}

#[derive(Clone, Copy, ValueEnum)]
enum SubtestArg {
    Download,
    Upload,
    All,
}

impl SubtestArg {
    fn subtests(self) -> &'static [Subtest] {
        match self {
            SubtestArg::Download => &[Subtest::Download],
            SubtestArg::Upload => &[Subtest::Upload],
            SubtestArg::All => &[Subtest::Download, Subtest::Upload],
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// One JSON event per line
    Json,
    /// Colored progress and a final summary
    Human,
}

impl Cli {
    fn to_settings(&self) -> Result<Settings, String> {
        if let Some(ref json) = self.settings {
            return Settings::from_json(json)
                .map_err(|e| format!("invalid settings JSON: {}", e));
        }

        let hostname = self
            .hostname
            .clone()
            .ok_or_else(|| "a hostname or --settings is required".to_string())?;

        Ok(Settings {
            disable_tls: self.disable_tls,
            skip_tls_verify: self.skip_tls_verify,
            hostname,
            port: self.port.clone(),
            duration: self.duration,
            adaptive: self.adaptive,
            scramble: self.scramble,
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    let settings = match cli.to_settings() {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("{} {}", "Error:".bold().red(), message);
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let client = Client::new(settings);
    let mut exit_code = exit_codes::SUCCESS;

    for &subtest in cli.subtest.subtests() {
        if cancel.is_cancelled() {
            break;
        }

        if cli.format == Format::Human {
            println!("{}", format!("{} test", subtest).bold().white());
        }

        let mut summary = Summary::new();
        let mut events = client.start(subtest, cancel.clone());
        while let Some(event) = events.recv().await {
            match &event {
                Event::Measurement(record) if record.is_local => {
                    summary.record_local(record.measurement)
                }
                Event::Measurement(record) => summary.record_remote(record.measurement),
                Event::Failure(record) => {
                    exit_code = exit_code.max(record.kind.exit_code())
                }
                Event::Log(_) => {}
            }

            match cli.format {
                Format::Json => match event.to_json() {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("cannot serialize event: {}", e),
                },
                Format::Human => print_event(subtest, &event),
            }
        }

        if cli.format == Format::Human {
            print_summary(subtest, &summary);
        }
    }

    std::process::exit(exit_code);
}

fn print_event(subtest: Subtest, event: &Event) {
    match event {
        Event::Log(record) => match record.log_level {
            LogLevel::Warning => println!("{}", record.message.yellow()),
            LogLevel::Info => println!("{}", record.message.dimmed()),
            LogLevel::Debug => {}
        },
        Event::Measurement(record) => {
            let source = if record.is_local { "client" } else { "server" };
            println!(
                "{} {:>6.2} s {:>10} bytes {}",
                format!("{} ({}):", subtest, source).white(),
                record.measurement.elapsed,
                record.measurement.num_bytes,
                format!("{:.2} Mbps", record.measurement.speed_mbps()).bright_blue()
            );
        }
        Event::Failure(record) => {
            eprintln!("{}", record.detail.red());
        }
    }
}

fn print_summary(subtest: Subtest, summary: &Summary) {
    if let Some(speed) = summary.local_speed_mbps() {
        println!(
            "{} {}",
            format!("{} speed (client):", subtest).bold().white(),
            format!("{:.2} Mbps", speed).bright_cyan()
        );
    }
    if let Some(speed) = summary.remote_speed_mbps() {
        println!(
            "{} {}",
            format!("{} speed (server):", subtest).bold().white(),
            format!("{:.2} Mbps", speed).bright_cyan()
        );
    }
    if let Some(bandwidth) = summary.max_bandwidth {
        println!(
            "{} {:.2} Mbps",
            "BBR bandwidth:".bold().white(),
            bandwidth / 1_000_000.0
        );
    }
    if let Some(rtt) = summary.min_rtt {
        println!("{} {:.2} ms", "Minimum RTT:".bold().white(), rtt);
    }
}
