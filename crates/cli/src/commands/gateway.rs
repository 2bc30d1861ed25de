//! `loopwire gateway`: Start the HTTP/SSE server.

use loopwire_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Loopwire Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.model);
    println!("   Stream:    POST /v1/chat/stream");

    loopwire_gateway::start(config).await?;

    Ok(())
}
