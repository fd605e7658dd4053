use anyhow::Result;

use cloud_credential_controller::runtime::initialization::initialize;
use cloud_credential_controller::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the controller runtime
    let init_result = initialize().await?;

    // Run the watch loop
    run_watch_loop(init_result.requests, init_result.context).await?;

    Ok(())
}
