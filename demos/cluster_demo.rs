//! Three-node cluster on loopback.
//!
//! Spins up three engines, joins them through a single seed, watches the
//! membership events as the cluster converges, then kills one node and
//! watches the survivors suspect and fail it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal::{Event, Member, MemberId, SwimConfig, SwimEngine, UdpTransport};

async fn node(name: &str, config: SwimConfig) -> shoal::Result<SwimEngine> {
    let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
    let local = Member::alive(MemberId::new(name, transport.local_address()));
    let engine = SwimEngine::new(local, config, transport);
    engine.start();
    Ok(engine)
}

fn watch(name: &'static str, engine: &SwimEngine) {
    let mut events = engine.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Joined(m) => info!("[{name}] joined: {}", m.id),
                Event::Suspected(m) => info!("[{name}] suspected: {}", m.id),
                Event::Failed(m) => info!("[{name}] failed: {}", m.id),
                Event::Recovered(m) => info!("[{name}] recovered: {}", m.id),
                Event::LocalLeft(id) => info!("[{name}] left: {}", id),
                Event::IncarnationIncremented(inc) => {
                    info!("[{name}] refuted a rumour, incarnation {inc}")
                }
                Event::Error(kind) => info!("[{name}] error: {kind:?}"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> shoal::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SwimConfig {
        protocol_period: Duration::from_millis(100),
        ping_timeout: Duration::from_millis(50),
        ..SwimConfig::default()
    };

    let a = node("node-a", config.clone()).await?;
    let b = node("node-b", config.clone()).await?;
    let c = node("node-c", config).await?;

    watch("a", &a);
    watch("b", &b);
    watch("c", &c);

    // b and c both join through a.
    b.join(&[a.local().id]).await?;
    c.join(&[a.local().id]).await?;

    sleep(Duration::from_secs(1)).await;
    info!(
        "converged: a sees {}, b sees {}, c sees {} members",
        a.members().len(),
        b.members().len(),
        c.members().len()
    );

    info!("stopping node-c without a goodbye");
    c.stop();

    sleep(Duration::from_secs(3)).await;
    info!(
        "after failure detection: a counts {} alive, b counts {} alive",
        a.alive_count(),
        b.alive_count()
    );

    a.leave().await;
    b.stop();
    Ok(())
}
