use anyhow::Result;
use clap::Parser;
use cohort::launcher::Launch;
use dotenvy::dotenv;

/// Runs one copy of a program per processing element.
#[derive(Parser, Debug)]
#[command(name = "cohort-run", version)]
pub struct Cli {
    #[command(flatten)]
    pub launch: Launch,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    cohort::init::tracing();
    let args = Cli::parse();

    let code = args.launch.run().await?;
    std::process::exit(code);
}
