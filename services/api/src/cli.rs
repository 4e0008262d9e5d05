use crate::demo::{run_demo, DemoArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use loan_origination::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Logbook Loan Origination",
    about = "Run or demonstrate the logbook loan origination service from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk one application from eligibility to an approved loan using offline evaluators
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_optional_and_demo_parses_overrides() {
        let cli = Cli::try_parse_from(["loan-origination-api"]).expect("no subcommand");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from([
            "loan-origination-api",
            "demo",
            "--collateral",
            "Honda Fit 2012",
            "--requested-amount",
            "90000",
        ])
        .expect("demo args");
        match cli.command {
            Some(Command::Demo(args)) => {
                assert_eq!(args.collateral, "Honda Fit 2012");
                assert_eq!(args.requested_amount, 90_000);
            }
            other => panic!("expected demo command, got {other:?}"),
        }
    }
}
