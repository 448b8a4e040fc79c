//! The plugin pump: ticks plugins and the instruction planner, advances
//! aircraft kinematics into the pending batch, and discovers external
//! plugin modules on disk.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aircraft::Aircraft;
use crate::protocol::AircraftUpdate;
use crate::sim::bridge::BridgePlugin;
use crate::sim::planner::Planner;
use crate::sim::plugin::{Plugin, ServerHandle};
use crate::sim::store::Store;

/// How often the pump rescans the plugin directories.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// A collaborator an in-process plugin asks the pump for at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginDependency {
    /// The simulation API handle.
    ServerHandle,
    /// A fresh snapshot of the aircraft map.
    AircraftSnapshot,
    /// A previously-instantiated plugin of the given type.
    Plugin(TypeId),
}

/// Everything available to a plugin factory once its dependencies resolve.
pub struct BuildContext<'a> {
    pub handle: Arc<ServerHandle>,
    pub aircraft: &'a HashMap<Uuid, Aircraft>,
    built: &'a HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl BuildContext<'_> {
    /// A previously-built plugin, by concrete type.
    pub fn plugin<T: Plugin + 'static>(&self) -> Option<Arc<T>> {
        self.built
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|plugin| plugin.downcast::<T>().ok())
    }
}

/// Factories hand back the same instance twice: as the trait object the
/// pump drives, and as `Any` so dependent factories can downcast it.
type PluginFactory =
    Box<dyn Fn(&BuildContext) -> (Arc<dyn Plugin>, Arc<dyn Any + Send + Sync>) + Send + Sync>;

struct Registration {
    name: String,
    type_id: TypeId,
    dependencies: Vec<PluginDependency>,
    build: PluginFactory,
}

/// Type-keyed registry of in-process plugins.
///
/// Each plugin declares the collaborators it needs; instantiation runs in
/// rounds until every factory is satisfied or a round makes no progress,
/// which fails startup with the unsatisfied names.
#[derive(Default)]
pub struct PluginRegistry {
    registrations: Vec<Registration>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Shorthand for depending on another plugin by type.
    pub fn depends_on<T: Plugin + 'static>() -> PluginDependency {
        PluginDependency::Plugin(TypeId::of::<T>())
    }

    pub fn register<T, F>(&mut self, name: &str, dependencies: Vec<PluginDependency>, build: F)
    where
        T: Plugin + 'static,
        F: Fn(&BuildContext) -> T + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            name: name.to_string(),
            type_id: TypeId::of::<T>(),
            dependencies,
            build: Box::new(move |ctx| {
                let concrete = Arc::new(build(ctx));
                (
                    concrete.clone() as Arc<dyn Plugin>,
                    concrete as Arc<dyn Any + Send + Sync>,
                )
            }),
        });
    }

    /// Build every registered plugin, resolving dependencies in rounds.
    fn instantiate(
        self,
        handle: Arc<ServerHandle>,
        aircraft: HashMap<Uuid, Aircraft>,
    ) -> Result<Vec<LoadedPlugin>> {
        let mut remaining = self.registrations;
        let mut built: HashMap<TypeId, Arc<dyn Any + Send + Sync>> = HashMap::new();
        let mut loaded = Vec::new();

        while !remaining.is_empty() {
            let mut progressed = false;
            let mut next_round = Vec::new();

            for registration in remaining {
                let satisfied = registration.dependencies.iter().all(|dep| match dep {
                    PluginDependency::ServerHandle | PluginDependency::AircraftSnapshot => true,
                    PluginDependency::Plugin(type_id) => built.contains_key(type_id),
                });
                if !satisfied {
                    next_round.push(registration);
                    continue;
                }

                let ctx = BuildContext {
                    handle: handle.clone(),
                    aircraft: &aircraft,
                    built: &built,
                };
                let (instance, as_any) = (registration.build)(&ctx);
                built.insert(registration.type_id, as_any);
                info!(plugin = %registration.name, "Plugin instantiated");
                loaded.push(LoadedPlugin {
                    name: registration.name,
                    instance,
                    enabled: Arc::new(AtomicBool::new(true)),
                    module: None,
                    cancel: CancellationToken::new(),
                });
                progressed = true;
            }

            if !progressed && !next_round.is_empty() {
                let missing: Vec<&str> =
                    next_round.iter().map(|r| r.name.as_str()).collect();
                bail!("unresolvable plugin dependencies: {}", missing.join(", "));
            }
            remaining = next_round;
        }

        Ok(loaded)
    }
}

/// One running plugin, in-process or bridged.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub name: String,
    instance: Arc<dyn Plugin>,
    enabled: Arc<AtomicBool>,
    /// Module path and mtime for bridge plugins discovered on disk.
    module: Option<(PathBuf, SystemTime)>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("module", &self.module)
            .finish()
    }
}

impl LoadedPlugin {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

pub struct Pump {
    store: Arc<Store>,
    handle: Arc<ServerHandle>,
    planner: Arc<tokio::sync::Mutex<Planner>>,
    plugins: Arc<RwLock<Vec<LoadedPlugin>>>,
    plugin_dirs: Vec<PathBuf>,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl Pump {
    /// Build the pump, instantiating every registered in-process plugin.
    /// Fails when the registry cannot satisfy a plugin's dependencies.
    pub async fn new(
        store: Arc<Store>,
        handle: Arc<ServerHandle>,
        planner: Arc<tokio::sync::Mutex<Planner>>,
        registry: PluginRegistry,
        plugin_dirs: Vec<PathBuf>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Pump>> {
        let aircraft = store.effective_aircraft().await;
        let loaded = registry.instantiate(handle.clone(), aircraft)?;
        Ok(Arc::new(Pump {
            store,
            handle,
            planner,
            plugins: Arc::new(RwLock::new(loaded)),
            plugin_dirs,
            tick_interval,
            cancel,
        }))
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|plugin| plugin.name.clone())
            .collect()
    }

    /// Enable or disable one plugin by name; returns false when unknown.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let plugins = self.plugins.read().await;
        match plugins.iter().find(|plugin| plugin.name == name) {
            Some(plugin) => {
                plugin.set_enabled(enabled);
                info!(plugin = name, enabled, "Plugin toggled");
                true
            }
            None => false,
        }
    }

    /// Hand a relayed chat frame to every enabled plugin.
    ///
    /// A failing plugin call is that call's problem, never the pump's.
    pub async fn dispatch_text(&self, sender: Uuid, recipient: Uuid, message: &str) {
        let plugins = self.plugins.read().await.clone();
        for plugin in plugins.iter().filter(|plugin| plugin.is_enabled()) {
            if let Err(error) = plugin
                .instance
                .process_text_message(sender, recipient, message)
                .await
            {
                warn!(plugin = %plugin.name, %error, "process_text_message failed");
            }
        }
    }

    /// The pump task: tick until cancelled, rescanning for modules as it
    /// goes.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        let mut discovery = tokio::time::interval(DISCOVERY_INTERVAL);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick);
                    last_tick = now;
                    self.step(dt).await;
                }
                _ = discovery.tick() => self.scan_modules().await,
            }
        }

        for plugin in self.plugins.read().await.iter() {
            plugin.cancel.cancel();
        }
        info!("Pump stopped");
    }

    /// One pump tick: advance kinematics, fly instructions, tick plugins.
    async fn step(&self, dt: Duration) {
        let started = Instant::now();
        let now = Utc::now();

        let aircraft = self.store.effective_aircraft().await;
        for (id, current) in &aircraft {
            let advanced = current.extrapolated(now);
            let delta = AircraftUpdate::diff(*id, current, &advanced);
            if !delta.update.is_empty() {
                self.store.queue_update(delta).await;
            }
        }

        self.planner
            .lock()
            .await
            .tick(&self.store, dt.as_secs_f64())
            .await;

        let plugins = self.plugins.read().await.clone();
        for plugin in plugins.iter().filter(|plugin| plugin.is_enabled()) {
            if let Err(error) = plugin.instance.tick(dt).await {
                warn!(plugin = %plugin.name, %error, "Plugin tick failed");
            }
        }

        metrics::histogram!("sim.pump.tick_ms").record(started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Rescan the configured directories for loadable modules. Unchanged
    /// modules (same path and mtime) are skipped; changed ones are
    /// restarted.
    async fn scan_modules(&self) {
        for dir in &self.plugin_dirs {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(dir = %dir.display(), %error, "Plugin directory unreadable");
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if !file_type.is_file() {
                    continue;
                }
                let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                    continue;
                };

                let known = {
                    let plugins = self.plugins.read().await;
                    plugins.iter().any(|plugin| {
                        plugin.module.as_ref() == Some(&(path.clone(), modified))
                    })
                };
                if known {
                    continue;
                }
                self.load_module(path, modified).await;
            }
        }
    }

    /// Start (or restart) one bridge module.
    async fn load_module(&self, path: PathBuf, modified: SystemTime) {
        let mut plugins = self.plugins.write().await;

        // A module already running from the same path changed on disk
        if let Some(index) = plugins
            .iter()
            .position(|plugin| matches!(&plugin.module, Some((p, _)) if *p == path))
        {
            let stale = plugins.remove(index);
            info!(plugin = %stale.name, "Module changed on disk, restarting");
            stale.cancel.cancel();
        }

        match BridgePlugin::spawn(&path, self.handle.clone()).await {
            Ok((instance, cancel)) => {
                let name = instance.name().to_string();
                info!(plugin = %name, module = %path.display(), "Bridge plugin started");
                metrics::counter!("sim.plugins.loaded").increment(1);
                plugins.push(LoadedPlugin {
                    name,
                    instance,
                    enabled: Arc::new(AtomicBool::new(true)),
                    module: Some((path, modified)),
                    cancel,
                });
            }
            Err(error) => {
                error!(module = %path.display(), %error, "Failed to start bridge plugin");
            }
        }
    }
}
