use clap::Parser;
use loaf_cli::MultitoolCli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    loaf_cli::init_logging();
    let cli = MultitoolCli::parse();
    let exit_code = loaf_cli::run_main(cli).await?;
    std::process::exit(exit_code);
}
