use std::env;
use std::error::Error;
use std::str::FromStr;
use std::time::Duration;

use chord_node::{api, ChordNode, Config};
use log::{error, info};

fn env_parse<T>(name: &str) -> Result<Option<T>, Box<dyn Error + Send + Sync>>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => Ok(Some(value.trim().parse()?)),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, Box<dyn Error + Send + Sync>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

fn config_from_env() -> Result<Config, Box<dyn Error + Send + Sync>> {
    let defaults = Config::default();
    Ok(Config {
        address: env::var("NODE_ADDRESS").unwrap_or(defaults.address),
        port: env_parse("NODE_PORT")?.unwrap_or(defaults.port),
        node_id: env_parse("NODE_ID")?,
        finger_bits: env_parse("FINGER_BITS")?.unwrap_or(defaults.finger_bits),
        successor_list_len: env_parse("SUCCESSOR_LIST_SIZE")?
            .unwrap_or(defaults.successor_list_len),
        call_timeout: env_millis("CALL_TIMEOUT_MS")?.unwrap_or(defaults.call_timeout),
        fix_fingers_pacing: env_millis("FIX_FINGERS_PACING_MS")?
            .unwrap_or(defaults.fix_fingers_pacing),
        stabilize_interval: env_millis("STABILIZE_INTERVAL_MS")?
            .unwrap_or(defaults.stabilize_interval),
        monitor_address: env::var("MONITOR_ADDRESS").ok(),
        api_port: env_parse("API_PORT")?,
        ..defaults
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env()?;
    let bootstrap_address = env::var("BOOTSTRAP_ADDRESS").ok();
    let api_port = config.api_port;

    let node = ChordNode::launch(config).await?;
    node.join_network(bootstrap_address.as_deref()).await?;
    let stabilizer = node.spawn_stabilizer();

    if let Some(port) = api_port {
        let api_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run(api_node, port).await {
                error!("Status API stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, leaving the ring");
    node.shutdown().await;
    if let Err(e) = stabilizer.await {
        error!("Stabilizer task failed: {}", e);
    }
    Ok(())
}
