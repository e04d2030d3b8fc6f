use std::sync::Arc;

use mattbot::plugins::bundled::{PingPlugin, StatusPlugin, WebhookEchoPlugin};
use mattbot::transport::RestClient;
use mattbot::{Bot, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mattbot=info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let client = Arc::new(RestClient::connect(&settings).await?);
    let bot = Bot::new(
        settings,
        client,
        vec![
            Arc::new(PingPlugin),
            Arc::new(StatusPlugin),
            Arc::new(WebhookEchoPlugin),
        ],
    );
    bot.run().await?;
    Ok(())
}
