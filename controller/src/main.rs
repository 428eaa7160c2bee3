#[tokio::main]
async fn main() -> anyhow::Result<()> {
    heating_controller::app::run().await
}
