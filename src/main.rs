//! Kestrel CLI entry point.

use kestrel_lib::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await?;
    Ok(())
}
