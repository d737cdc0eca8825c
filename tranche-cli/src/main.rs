#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tranche_cli::run_app().await
}
