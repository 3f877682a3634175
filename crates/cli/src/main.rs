// annosync CLI entry point.

use clap::Parser;

mod commands;
mod exit_code;
mod output;

#[derive(Parser)]
#[command(name = "annosync", about = "Inspect the local annotation index and client configuration")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.command.json_requested();
    if let Err(error) = commands::run(cli.command) {
        output::print_anyhow_error(output::OutputFormat::detect(json), &error);
        std::process::exit(exit_code::ExitCode::from_error(&error).code());
    }
}
