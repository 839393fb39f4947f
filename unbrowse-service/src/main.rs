//! unbrowse control service binary

use unbrowse_service::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    if !config.tos_accepted() {
        tracing::warn!(
            "Terms of service not accepted; set UNBROWSE_TOS_ACCEPTED to skip this notice"
        );
    }

    let state = AppState::build(config)?;
    state.spawn_background();

    let app = handlers::router(state.clone());
    Server::new(state).serve(app).await?;

    Ok(())
}
