#[tokio::main]
async fn main() -> anyhow::Result<()> {
    heating_node_sim::host::run().await
}
