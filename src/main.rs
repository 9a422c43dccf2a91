use clap::{Parser, Subcommand};
use sharecgt::cmd;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sharecgt", version, about = "UK Capital Gains Tax for employee shares")]
struct Cli {
    /// Data file holding the ledger, rates, settings and results
    #[arg(long, global = true, env = "SHARECGT_DATA", default_value = "sharecgt.json")]
    data: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the REST server
    Serve(cmd::serve::ServeCommand),
    /// Recalculate one tax year, or every year with sales
    Recalc(cmd::recalc::RecalcCommand),
    /// CGT summary for a tax year
    Summary(cmd::summary::SummaryCommand),
    /// Section 104 pool at the end of a tax year
    Pools(cmd::pools::PoolsCommand),
    /// SA108 figures or the disposal schedule for a tax year
    Export(cmd::export::ExportCommand),
    /// Manage the USD/GBP rate table
    Rates(cmd::rates::RatesCommand),
    /// Print input formats
    Schema(cmd::schema::SchemaCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::Serve(c) => c.exec(&cli.data),
        Command::Recalc(c) => c.exec(&cli.data),
        Command::Summary(c) => c.exec(&cli.data),
        Command::Pools(c) => c.exec(&cli.data),
        Command::Export(c) => c.exec(&cli.data),
        Command::Rates(c) => c.exec(&cli.data),
        Command::Schema(c) => c.exec(),
    }
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) if !verbose => builder.parse_filters(&filters),
        _ => builder.filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }),
    };
    builder.init();
}
