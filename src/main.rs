#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Start the web application
    nutrilog::app::run().await?;

    Ok(())
}
