#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vendo_entitlement_lib::run().await
}
