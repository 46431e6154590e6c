#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use ntrip_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.mountpoints.is_empty() {
        log::warn!(
            "No mountpoints are configured, this caster has nothing to serve, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    ntrip_server::startup(config).await
}
