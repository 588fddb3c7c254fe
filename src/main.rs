use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    negotiator::cli::run_cli().await
}
