use clap::Parser;
use flotilla::cli::Cli;
use flotilla::error::FlotillaError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    cli.init_logging()?;

    let code = match cli.execute().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            e.downcast_ref::<FlotillaError>()
                .map(FlotillaError::exit_code)
                .unwrap_or(1)
        }
    };

    std::process::exit(code);
}
