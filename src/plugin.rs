use bevy::app::AppExit;
use bevy::prelude::*;

use crate::handles::ScriptHandles;
use crate::session::Session;

#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScriptSet {
    /// Deterministic call-ins, once per simulation step.
    Simulation,
    /// Bridge delivery. Always before `Draw` in the same update.
    Drain,
    Draw,
}

#[derive(Resource, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationFrame(pub u64);

#[derive(Resource, Clone)]
pub struct ActiveSession(pub Session);

pub struct LockstepScriptingPlugin {
    pub seed: u64,
}

impl Plugin for LockstepScriptingPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(ActiveSession(Session::new(self.seed)))
            .init_resource::<SimulationFrame>()
            .init_non_send_resource::<ScriptHandles>()
            .configure_sets(Update, (ScriptSet::Drain, ScriptSet::Draw).chain())
            .add_systems(FixedUpdate, run_game_frame.in_set(ScriptSet::Simulation))
            .add_systems(Update, drain_bridges.in_set(ScriptSet::Drain))
            .add_systems(Last, end_session_on_exit);
    }
}

fn run_game_frame(mut frame: ResMut<SimulationFrame>, mut handles: NonSendMut<ScriptHandles>) {
    frame.0 += 1;
    handles.game_frame(frame.0);
}

fn drain_bridges(handles: NonSend<ScriptHandles>) {
    handles.drain_bridges();
}

fn end_session_on_exit(
    mut exit: EventReader<AppExit>,
    mut handles: NonSendMut<ScriptHandles>,
    session: Res<ActiveSession>,
) {
    if exit.read().next().is_none() {
        return;
    }
    handles.kill_all(false);
    if session.0.clear_game_params() {
        info!(
            "[Lockstep session] Session {} ended, {} handle(s) closed",
            session.0.seed(),
            handles.len()
        );
    }
}
