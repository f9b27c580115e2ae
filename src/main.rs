use std::sync::Arc;

use outreach_engine::db::OutreachDb;
use outreach_engine::error::EngineError;
use outreach_engine::platform::HttpPlatformClient;
use outreach_engine::state::{self, EngineState};

fn init() -> Result<Arc<EngineState>, EngineError> {
    let config = state::load_config()?;
    let db = OutreachDb::open(config.database_path.as_deref())?;
    let platform = HttpPlatformClient::new(&config.platform, config.proxy.clone())?;
    let state = EngineState::new(config, db, Arc::new(platform))?;
    Ok(Arc::new(state))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let state = match init() {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to start outreach engine: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("Outreach engine started");
    outreach_engine::run(state).await;
}
