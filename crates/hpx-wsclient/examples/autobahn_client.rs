//! Runs the Autobahn fuzzingserver test cases against this client.
//!
//! ```text
//! docker run -it --rm -p 9001:9001 crossbario/autobahn-testsuite wstest -m fuzzingserver
//! cargo run --example autobahn_client
//! ```

use eyre::Result;
use hpx_wsclient::{HandshakeRequest, Message, Options, WebSocketClient};
use tokio::sync::mpsc;

const SERVER: &str = "127.0.0.1:9001";
const AGENT: &str = "hpx-wsclient";

fn echo_options() -> Options {
    Options::default()
        .with_strict(true)
        .with_compression()
        .with_max_payload_read(100 * 1024 * 1024)
        .with_max_message_size(200 * 1024 * 1024)
        .on_message(|client: WebSocketClient, message: Message| async move {
            if let Err(err) = client.write(message.opcode(), message.into_payload()).await {
                tracing::debug!("echo failed: {err}");
            }
        })
}

async fn get_case_count() -> Result<u32> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = Options::default().on_message(move |_client: WebSocketClient, message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    });

    let client = WebSocketClient::connect(HandshakeRequest::new(SERVER, "/getCaseCount"), options).await?;
    client.start()?;

    let message = rx
        .recv()
        .await
        .ok_or_else(|| eyre::eyre!("no response from getCaseCount"))?;
    client.wait().await?;

    let count = message
        .as_text()
        .ok_or_else(|| eyre::eyre!("case count is not text"))?
        .trim()
        .parse()?;
    Ok(count)
}

async fn run_case(case: u32) -> Result<()> {
    let path = format!("/runCase?case={case}&agent={AGENT}");
    let client = WebSocketClient::connect(HandshakeRequest::new(SERVER, path), echo_options()).await?;
    client.start()?;

    // protocol violations are expected in many cases and are reported by the server
    if let Err(err) = client.wait().await {
        tracing::debug!("case {case} ended with: {err}");
    }
    Ok(())
}

async fn update_reports() -> Result<()> {
    let path = format!("/updateReports?agent={AGENT}");
    let client = WebSocketClient::connect(HandshakeRequest::new(SERVER, path), Options::default()).await?;
    client.start()?;
    client.wait().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let count = get_case_count().await?;
    tracing::info!("Running {count} cases");

    for case in 1..=count {
        if case % 10 == 0 {
            update_reports().await?;
        }
        tracing::debug!("Running case {case}");
        run_case(case).await?;
    }

    update_reports().await?;
    tracing::info!("Done, reports updated");

    Ok(())
}
