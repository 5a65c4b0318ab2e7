use anyhow::{Context, Result};
use kairo_kernel::kernel::{Inbound, KernelClient};
use std::io::Write;
use std::path::PathBuf;

pub(crate) async fn cmd_call(
    config_path: Option<PathBuf>,
    socket: Option<PathBuf>,
    method: &str,
    params: Option<&str>,
    listen: bool,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let socket = socket.unwrap_or(config.socket_path.clone());

    let params: serde_json::Value = match params {
        Some(raw) => serde_json::from_str(raw).context("Params must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let client = KernelClient::connect(&socket)
        .await?
        .with_timeout(config.request_timeout());
    // Subscribe before calling so nothing emitted in response is missed
    let mut inbound = client.listen();

    let result = client.request(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !listen {
        return Ok(());
    }

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(Inbound::Event(body)) => println!("{}", body),
                Some(Inbound::StreamChunk(chunk)) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&chunk.data)?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if client.is_closed() {
            break;
        }
    }
    Ok(())
}
