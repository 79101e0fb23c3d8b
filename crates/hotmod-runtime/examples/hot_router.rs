//! Hot-reload demo: a "router" whose response text lives in a watched file.
//!
//! The module's persistent hit counter survives every reload; only the
//! banner (re-read from the file on activation) changes.
//!
//! Run with: `cargo run --example hot_router`

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hotmod_runtime::{
    Activation, ContentWatcher, HmrRuntime, HotModule, ModuleId, ModuleResult, StaticResolver,
    UpdateEmitter, WatchConfig,
};

/// One hot-reloadable route handler.
struct BannerRouter {
    source: PathBuf,
}

/// The export consumers call: banner text from the current build, hit
/// counter from the persistent state.
struct BannerApi {
    banner: String,
    hits: Arc<AtomicU64>,
}

impl BannerApi {
    fn handle(&self) -> String {
        let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{} (hit #{hits})", self.banner)
    }
}

#[async_trait::async_trait]
impl HotModule for BannerRouter {
    type Persistent = AtomicU64;
    type Export = BannerApi;

    async fn init_persistent(&self) -> ModuleResult<Self::Persistent> {
        // Created once; reloads below never reset the counter.
        Ok(AtomicU64::new(0))
    }

    async fn activate(
        &self,
        state: Arc<Self::Persistent>,
        _updates: UpdateEmitter,
    ) -> ModuleResult<Activation<Self::Export>> {
        let banner = tokio::fs::read_to_string(&self.source).await?;
        Ok(Activation::ready(BannerApi {
            banner: banner.trim().to_string(),
            hits: state,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let source = dir.path().join("banner.txt");
    tokio::fs::write(&source, "hello from v1").await?;

    let resolver = Arc::new(StaticResolver::new());
    let module_source = source.clone();
    resolver.register("banner-router", move || BannerRouter {
        source: module_source.clone(),
    });
    resolver.set_path("banner-router", &source);

    let runtime = HmrRuntime::builder(resolver)
        .with_watcher(Box::new(ContentWatcher::new(WatchConfig::default())))
        .build();
    runtime.start(&[ModuleId::new("banner-router")]).await?;

    let handle = runtime.handle::<BannerApi>("banner-router").expect("imported");

    for round in 1..=3u32 {
        let api = handle.exports().expect("published");
        println!("{}", api.handle());
        println!("{}", api.handle());

        if round < 3 {
            tokio::fs::write(&source, format!("hello from v{}", round + 1)).await?;
            // Give the watcher a moment to fingerprint and swap.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    let report = runtime.close_all().await;
    assert!(report.is_clean());
    Ok(())
}
