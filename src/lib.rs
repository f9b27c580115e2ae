pub mod acceptance_poller;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod follow_up;
pub mod identity;
mod migrations;
pub mod platform;
pub mod renderer;
pub mod send_window;
pub mod state;
pub mod types;

use std::sync::Arc;

use state::EngineState;

/// Run the Dispatcher and the Acceptance Poller until Ctrl-C.
pub async fn run(state: Arc<EngineState>) {
    // Spawn dispatcher
    let dispatcher_state = state.clone();
    let dispatcher = tokio::spawn(async move {
        dispatcher::run_dispatcher(dispatcher_state).await;
    });

    // Spawn acceptance poller
    let poller_state = state.clone();
    let poller = tokio::spawn(async move {
        acceptance_poller::run_acceptance_poller(poller_state).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutdown requested"),
        Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
    }

    // Abandoned claims go back to pending once stale.
    dispatcher.abort();
    poller.abort();
}
