#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hls_relay::run().await
}
