#[tokio::main]
async fn main() -> eyre::Result<()> {
    parcelmq::run().start().await
}
