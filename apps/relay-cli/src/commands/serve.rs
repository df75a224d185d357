// serve.rs - Run the relay in the foreground until Ctrl-C.

use relay_dispatcher::{start_from_config, RelayConfig};

pub fn execute(config: &RelayConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let relay = start_from_config(config).await?;
        if let Some(addr) = relay.http_addr() {
            tracing::info!(%addr, "operator API listening");
        }
        relay
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}
