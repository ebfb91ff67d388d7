use std::path::PathBuf;

use bevy::app::AppExit;
use bevy::log::LogPlugin;
use bevy::prelude::*;
use serde::Deserialize;

use lockstep_lua::{
    ActiveSession, Coordinator, DirectoryLoader, HandleConfig, LockstepScriptingPlugin,
    ScriptHandles, SimulationFrame,
};

#[derive(Deserialize)]
#[serde(default)]
struct SessionConfig {
    seed: u64,
    frames: u64,
    script_root: PathBuf,
    /// Archive layers searched by load modes, e.g. `{ "mode": "M", "dir": "game" }`.
    layers: Vec<ModeLayer>,
    handles: Vec<HandleSpec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            frames: 300,
            script_root: PathBuf::from("scripts"),
            layers: Vec::new(),
            handles: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct ModeLayer {
    mode: char,
    dir: PathBuf,
}

#[derive(Deserialize)]
struct HandleSpec {
    name: String,
    #[serde(default)]
    order: i32,
    synced: String,
    unsynced: String,
    #[serde(default = "default_modes")]
    modes: String,
    #[serde(default)]
    config: HandleConfig,
}

fn default_modes() -> String {
    "M".to_string()
}

fn load_session_config() -> SessionConfig {
    let path = std::env::var("LOCKSTEP_SESSION_CONFIG")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "session.json".to_string());
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<SessionConfig>(&contents) {
            Ok(cfg) => {
                println!("[Lockstep] Loaded session config from {}", path);
                cfg
            }
            Err(e) => {
                eprintln!("[Lockstep] Failed to parse {}: {}", path, e);
                SessionConfig::default()
            }
        },
        Err(_) => SessionConfig::default(),
    }
}

fn main() {
    let config = load_session_config();
    let mut app = App::new();
    app.add_plugins(LogPlugin::default())
        .add_plugins(LockstepScriptingPlugin { seed: config.seed });
    app.finish();
    app.cleanup();

    let session = app.world().resource::<ActiveSession>().0.clone();
    let loader = config
        .layers
        .iter()
        .fold(DirectoryLoader::new(&config.script_root), |loader, layer| {
            loader.with_mode(layer.mode, config.script_root.join(&layer.dir))
        });
    {
        let mut handles = app.world_mut().non_send_resource_mut::<ScriptHandles>();
        for spec in &config.handles {
            let mut coordinator =
                Coordinator::new(&spec.name, spec.order, session.clone()).with_config(spec.config);
            if let Err(err) = coordinator.init(&loader, &spec.synced, &spec.unsynced, &spec.modes) {
                error!("[Lockstep session] Handle '{}' not loaded: {}", spec.name, err);
                continue;
            }
            handles.insert(coordinator);
        }
        info!(
            "[Lockstep session] Seed {} with {} handle(s), running {} frame(s)",
            config.seed,
            handles.len(),
            config.frames
        );
    }

    for _ in 0..config.frames {
        app.world_mut().run_schedule(FixedUpdate);
        app.world_mut().run_schedule(Update);
    }

    {
        let frame = app.world().resource::<SimulationFrame>().0;
        let handles = app.world().non_send_resource::<ScriptHandles>();
        let stats = handles.bridge_stats();
        info!(
            "[Lockstep session] Frame {}: bridge sent {}, delivered {}, dropped {}; {} script error(s)",
            frame,
            stats.sent,
            stats.delivered,
            stats.dropped,
            handles.error_count()
        );
        for (key, value) in session.game_params() {
            info!("[Lockstep session] {} = {}", key, value);
        }
    }

    app.world_mut().send_event(AppExit::Success);
    app.world_mut().run_schedule(Last);
}
