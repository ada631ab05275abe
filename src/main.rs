use std::sync::Arc;

use catzilla::cache::HotCache;
use catzilla::config::ServerConfig;
use catzilla::router::Router;
use catzilla::static_files::{MountPolicy, StaticMount};
use catzilla::{Method, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };

    let mut router = Router::new();
    router.route(Method::GET, "/health", || async { "ok" });

    let mut mount = StaticMount::builder("/static", "./web")
        .policy(MountPolicy::from_config(&config));
    if config.enable_hot_cache {
        mount = mount.cache(Arc::new(HotCache::new(
            config.cache_budget_bytes(),
            config.cache_ttl(),
        )));
    }
    router.mount(mount.build());

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    serve(listener, router).await;
    Ok(())
}
