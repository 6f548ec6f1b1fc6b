#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall::run().await
}
