#[tokio::main]
async fn main() -> anyhow::Result<()> {
    screentrail_lib::run().await
}
