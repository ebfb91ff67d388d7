use std::cell::Ref;
use std::collections::BTreeMap;

use bevy::log::{error, info};
use mlua::Lua;
use serde::Serialize;

use crate::bridge::{bridge, BridgeReceiver, BridgeStats};
use crate::callins::{
    BuildInfo, Command, CommandFallbackResult, ContextKind, FeatureDamage, FeatureRef, Float3,
    PreDamaged, ProjectileRef, ShieldHit, UnitDamage, UnitRef, WeaponRef, WeaponTarget,
    TARGET_CHECK_NO_OPINION,
};
use crate::config::{HandleConfig, MessageRouting};
use crate::context::{
    ContextStack, DefKind, DeterministicContext, HandleIdentity, PresentationContext,
    ScriptContext, SharedErrors,
};
use crate::errors::{LoadError, ScriptErrors};
use crate::loader::ScriptLoader;
use crate::permissions::{CapabilityGate, Permission, Permissions};
use crate::session::Session;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Loading,
    Valid,
    /// Init failed part way. Nothing leaves this state.
    Invalid,
    Killed,
}

/// Lets the embedding engine add its own call-outs to a freshly built state before any script
/// chunk runs.
pub trait CodeHooks {
    fn add_synced_code(&self, _lua: &Lua) -> mlua::Result<()> {
        Ok(())
    }

    fn add_unsynced_code(&self, _lua: &Lua) -> mlua::Result<()> {
        Ok(())
    }
}

pub struct NoCodeHooks;

impl CodeHooks for NoCodeHooks {}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StackReport {
    pub handle: String,
    pub synced: Option<ContextStack>,
    pub unsynced: Option<ContextStack>,
}

impl StackReport {
    pub fn balanced(&self) -> bool {
        self.synced.map_or(true, |stack| stack.balanced)
            && self.unsynced.map_or(true, |stack| stack.balanced)
    }
}

struct ChunkSource<'a> {
    chunk: &'a str,
    source: &'a str,
}

/// One script handle: a deterministic and a presentation context loaded together, joined by a
/// bridge and a shared capability gate.
pub struct Coordinator {
    identity: HandleIdentity,
    config: HandleConfig,
    state: HandleState,
    gate: CapabilityGate,
    session: Session,
    hooks: Box<dyn CodeHooks>,
    synced: Option<DeterministicContext>,
    unsynced: Option<PresentationContext>,
    bridge_rx: Option<BridgeReceiver>,
    frame: u64,
    errors: SharedErrors,
}

impl Coordinator {
    pub fn new(name: impl Into<String>, order: i32, session: Session) -> Self {
        Self {
            identity: HandleIdentity {
                name: name.into(),
                order,
            },
            config: HandleConfig::default(),
            state: HandleState::Uninitialized,
            gate: CapabilityGate::default(),
            session,
            hooks: Box::new(NoCodeHooks),
            synced: None,
            unsynced: None,
            bridge_rx: None,
            frame: 0,
            errors: SharedErrors::default(),
        }
    }

    pub fn with_config(mut self, config: HandleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: impl CodeHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Loads both script files through `loader` and brings the handle up. On any failure both
    /// contexts are torn down and the handle is left `Invalid`.
    pub fn init(
        &mut self,
        loader: &dyn ScriptLoader,
        synced_file: &str,
        unsynced_file: &str,
        modes: &str,
    ) -> Result<(), LoadError> {
        self.begin_init()?;
        let result = loader.load_file(synced_file, modes).and_then(|synced| {
            let unsynced = loader.load_file(unsynced_file, modes)?;
            self.build_contexts(
                ChunkSource {
                    chunk: synced_file,
                    source: &synced,
                },
                ChunkSource {
                    chunk: unsynced_file,
                    source: &unsynced,
                },
            )
        });
        self.finish_init(result)
    }

    pub fn init_sources(&mut self, synced: &str, unsynced: &str) -> Result<(), LoadError> {
        self.begin_init()?;
        let synced_chunk = format!("{}/synced", self.identity.name);
        let unsynced_chunk = format!("{}/unsynced", self.identity.name);
        let result = self.build_contexts(
            ChunkSource {
                chunk: &synced_chunk,
                source: synced,
            },
            ChunkSource {
                chunk: &unsynced_chunk,
                source: unsynced,
            },
        );
        self.finish_init(result)
    }

    fn begin_init(&mut self) -> Result<(), LoadError> {
        if self.state != HandleState::Uninitialized {
            return Err(LoadError::InvalidTransition(self.state));
        }
        self.state = HandleState::Loading;
        Ok(())
    }

    fn finish_init(&mut self, result: Result<(), LoadError>) -> Result<(), LoadError> {
        match result {
            Ok(()) => {
                self.state = HandleState::Valid;
                info!(
                    "[Lockstep scripts] Loaded handle '{}' (order {})",
                    self.identity.name, self.identity.order
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "[Lockstep scripts] Failed to load handle '{}': {}",
                    self.identity.name, err
                );
                self.kill_lua(true);
                self.state = HandleState::Invalid;
                Err(err)
            }
        }
    }

    fn build_contexts(
        &mut self,
        synced: ChunkSource<'_>,
        unsynced: ChunkSource<'_>,
    ) -> Result<(), LoadError> {
        let limits = self.config.limits;
        let (tx, rx) = bridge(limits.bridge_capacity);
        self.bridge_rx = Some(rx);

        let synced_ctx = self.synced.insert(DeterministicContext::new(
            self.identity.clone(),
            limits,
            self.gate.clone(),
            self.session.clone(),
            self.errors.clone(),
            tx,
        )?);
        if let Some(lua) = synced_ctx.lua() {
            self.hooks
                .add_synced_code(lua)
                .map_err(|err| LoadError::Environment {
                    context: ContextKind::Deterministic,
                    message: err.to_string(),
                })?;
        }

        let unsynced_ctx = self.unsynced.insert(PresentationContext::new(
            self.identity.clone(),
            limits,
            self.gate.clone(),
            self.session.clone(),
            self.errors.clone(),
        )?);
        if let Some(lua) = unsynced_ctx.lua() {
            self.hooks
                .add_unsynced_code(lua)
                .map_err(|err| LoadError::Environment {
                    context: ContextKind::Presentation,
                    message: err.to_string(),
                })?;
        }

        if let Some(ctx) = self.synced.as_ref() {
            ctx.exec_chunk(synced.chunk, synced.source)?;
        }
        if let Some(ctx) = self.unsynced.as_ref() {
            ctx.exec_chunk(unsynced.chunk, unsynced.source)?;
        }
        if let Some(ctx) = self.synced.as_ref() {
            ctx.initialize()?;
        }
        if let Some(ctx) = self.unsynced.as_ref() {
            ctx.initialize()?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.state == HandleState::Valid
    }

    /// Tears down the deterministic context, then the presentation context. `Shutdown` runs in
    /// each unless the handle is being freed from inside one of its own call-ins.
    pub fn kill_lua(&mut self, in_free_handler: bool) {
        if self.synced.is_none() && self.unsynced.is_none() {
            return;
        }
        if let Some(mut synced) = self.synced.take() {
            synced.kill(in_free_handler);
        }
        if let Some(mut unsynced) = self.unsynced.take() {
            unsynced.kill(in_free_handler);
        }
        if self.state == HandleState::Valid {
            self.state = HandleState::Killed;
        }
        info!(
            "[Lockstep scripts] Closed handle '{}'",
            self.identity.name
        );
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn identity(&self) -> &HandleIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn order(&self) -> i32 {
        self.identity.order
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn synced_context(&self) -> Option<&DeterministicContext> {
        if self.state == HandleState::Valid {
            self.synced.as_ref()
        } else {
            None
        }
    }

    pub fn unsynced_context(&self) -> Option<&PresentationContext> {
        if self.state == HandleState::Valid {
            self.unsynced.as_ref()
        } else {
            None
        }
    }

    // Permissions

    pub fn set_permission(&self, permission: Permission) {
        self.gate.set(permission);
    }

    pub fn set_full_ctrl(&self, value: bool) {
        self.set_permission(Permission::FullCtrl(value));
    }

    pub fn set_full_read(&self, value: bool) {
        self.set_permission(Permission::FullRead(value));
    }

    pub fn set_ctrl_team(&self, team: i32) {
        self.set_permission(Permission::CtrlTeam(team));
    }

    pub fn set_read_team(&self, team: i32) {
        self.set_permission(Permission::ReadTeam(team));
    }

    pub fn set_read_ally_team(&self, ally_team: i32) {
        self.set_permission(Permission::ReadAllyTeam(ally_team));
    }

    pub fn set_select_team(&self, team: i32) {
        self.set_permission(Permission::SelectTeam(team));
    }

    pub fn permissions(&self) -> Permissions {
        self.gate.snapshot()
    }

    // Frames and the bridge

    pub fn game_frame(&mut self, frame: u64) {
        self.frame = frame;
        if let Some(ctx) = self.synced_context() {
            ctx.game_frame(frame);
        }
        self.check_stack();
    }

    /// Delivers every queued bridge message to `RecvFromSynced`, oldest first. Returns how many
    /// were delivered; messages reaching a closed presentation context are counted as dropped.
    pub fn drain_bridge(&self) -> usize {
        let Some(rx) = self.bridge_rx.as_ref() else {
            return 0;
        };
        let Some(ctx) = self.unsynced_context() else {
            rx.discard();
            return 0;
        };
        let messages = rx.drain();
        for message in &messages {
            ctx.set_frame(message.frame);
            ctx.recv_from_synced(message);
        }
        messages.len()
    }

    fn drain_pending(&self) {
        if self.bridge_rx.as_ref().is_some_and(|rx| rx.pending() > 0) {
            self.drain_bridge();
        }
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.bridge_rx
            .as_ref()
            .map(BridgeReceiver::stats)
            .unwrap_or_default()
    }

    // Diagnostics

    pub fn check_stack(&self) -> StackReport {
        StackReport {
            handle: self.identity.name.clone(),
            synced: self.synced.as_ref().and_then(|ctx| ctx.check_stack()),
            unsynced: self.unsynced.as_ref().and_then(|ctx| ctx.check_stack()),
        }
    }

    pub fn errors(&self) -> Ref<'_, ScriptErrors> {
        self.errors.borrow()
    }

    pub fn text_commands(&self) -> BTreeMap<String, String> {
        self.synced_context()
            .map(DeterministicContext::text_commands)
            .unwrap_or_default()
    }

    pub fn is_watched(&self, kind: DefKind, id: i32) -> bool {
        self.synced_context()
            .is_some_and(|ctx| ctx.is_watched(kind, id))
    }

    // Messages routed to both contexts

    fn route(
        &self,
        routing: MessageRouting,
        synced_claimed: bool,
        deliver: impl FnOnce(&PresentationContext) -> bool,
    ) -> bool {
        if synced_claimed && routing == MessageRouting::ShortCircuit {
            return true;
        }
        let unsynced_claimed = self.unsynced_context().is_some_and(deliver);
        synced_claimed || unsynced_claimed
    }

    pub fn got_chat_msg(&self, msg: &str, player_id: i32) -> bool {
        let synced_claimed = self
            .synced_context()
            .is_some_and(|ctx| ctx.got_chat_msg(msg, player_id));
        self.route(self.config.chat_routing, synced_claimed, |ctx| {
            ctx.got_chat_msg(msg, player_id)
        })
    }

    pub fn recv_lua_msg(&self, msg: &str, player_id: i32) -> bool {
        let synced_claimed = self
            .synced_context()
            .is_some_and(|ctx| ctx.recv_lua_msg(msg, player_id));
        self.route(self.config.lua_msg_routing, synced_claimed, |ctx| {
            ctx.recv_lua_msg(msg, player_id)
        })
    }

    // Presentation call-ins

    pub fn draw_unit(&self, unit_id: u32, draw_mode: i32) -> bool {
        self.drain_pending();
        self.unsynced_context()
            .is_some_and(|ctx| ctx.draw_unit(unit_id, draw_mode))
    }

    pub fn draw_feature(&self, feature_id: u32, draw_mode: i32) -> bool {
        self.drain_pending();
        self.unsynced_context()
            .is_some_and(|ctx| ctx.draw_feature(feature_id, draw_mode))
    }

    pub fn draw_shield(&self, unit_id: u32, weapon_num: u32, draw_mode: i32) -> bool {
        self.drain_pending();
        self.unsynced_context()
            .is_some_and(|ctx| ctx.draw_shield(unit_id, weapon_num, draw_mode))
    }

    pub fn draw_projectile(&self, projectile_id: u32, draw_mode: i32) -> bool {
        self.drain_pending();
        self.unsynced_context()
            .is_some_and(|ctx| ctx.draw_projectile(projectile_id, draw_mode))
    }

    // Deterministic call-ins

    pub fn synced_action_fallback(&self, line: &str, player_id: i32) -> bool {
        self.synced_context()
            .is_some_and(|ctx| ctx.synced_action_fallback(line, player_id))
    }

    pub fn command_fallback(&self, unit: &UnitRef, cmd: &Command) -> CommandFallbackResult {
        self.synced_context()
            .map(|ctx| ctx.command_fallback(unit, cmd))
            .unwrap_or(CommandFallbackResult {
                used: false,
                remove: true,
            })
    }

    pub fn allow_command(&self, unit: &UnitRef, cmd: &Command, from_synced: bool) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_command(unit, cmd, from_synced))
    }

    pub fn allow_unit_creation(
        &self,
        unit_def_id: i32,
        builder: Option<&UnitRef>,
        build: Option<&BuildInfo>,
    ) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_creation(unit_def_id, builder, build))
    }

    pub fn allow_unit_transfer(&self, unit: &UnitRef, new_team: i32, capture: bool) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_transfer(unit, new_team, capture))
    }

    pub fn allow_unit_build_step(&self, builder: &UnitRef, unit: &UnitRef, part: f32) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_build_step(builder, unit, part))
    }

    pub fn allow_unit_transport(&self, transporter: &UnitRef, transportee: &UnitRef) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_transport(transporter, transportee))
    }

    pub fn allow_unit_cloak(&self, unit: &UnitRef, enemy: Option<&UnitRef>) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_cloak(unit, enemy))
    }

    pub fn allow_unit_decloak(
        &self,
        unit: &UnitRef,
        object_id: Option<u32>,
        weapon: Option<&WeaponRef>,
    ) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_unit_decloak(unit, object_id, weapon))
    }

    pub fn allow_feature_creation(&self, feature_def_id: i32, ally_team: i32, pos: Float3) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_feature_creation(feature_def_id, ally_team, pos))
    }

    pub fn allow_feature_build_step(
        &self,
        builder: &UnitRef,
        feature: &FeatureRef,
        part: f32,
    ) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_feature_build_step(builder, feature, part))
    }

    pub fn allow_resource_level(&self, team: i32, resource: &str, level: f32) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_resource_level(team, resource, level))
    }

    pub fn allow_resource_transfer(
        &self,
        old_team: i32,
        new_team: i32,
        resource: &str,
        amount: f32,
    ) -> bool {
        self.synced_context().map_or(true, |ctx| {
            ctx.allow_resource_transfer(old_team, new_team, resource, amount)
        })
    }

    pub fn allow_direct_unit_control(&self, player_id: i32, unit: &UnitRef) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_direct_unit_control(player_id, unit))
    }

    pub fn allow_builder_hold_fire(&self, unit: &UnitRef, action: i32) -> bool {
        self.synced_context()
            .map_or(true, |ctx| ctx.allow_builder_hold_fire(unit, action))
    }

    pub fn allow_start_position(
        &self,
        player_id: i32,
        team_id: i32,
        ready_state: u8,
        clamped: Float3,
        raw_pick: Float3,
    ) -> bool {
        self.synced_context().map_or(true, |ctx| {
            ctx.allow_start_position(player_id, team_id, ready_state, clamped, raw_pick)
        })
    }

    pub fn terraform_complete(&self, unit: &UnitRef, build: &UnitRef) -> bool {
        self.synced_context()
            .is_some_and(|ctx| ctx.terraform_complete(unit, build))
    }

    pub fn move_ctrl_notify(&self, unit: &UnitRef, data: i32) -> bool {
        self.synced_context()
            .is_some_and(|ctx| ctx.move_ctrl_notify(unit, data))
    }

    pub fn allow_weapon_target_check(
        &self,
        attacker_id: u32,
        weapon_num: u32,
        weapon_def_id: i32,
    ) -> i32 {
        self.synced_context()
            .map_or(TARGET_CHECK_NO_OPINION, |ctx| {
                ctx.allow_weapon_target_check(attacker_id, weapon_num, weapon_def_id)
            })
    }

    pub fn allow_weapon_target(
        &self,
        attacker_id: u32,
        target_id: u32,
        weapon_num: u32,
        weapon_def_id: i32,
        priority: f32,
    ) -> WeaponTarget {
        self.synced_context()
            .map(|ctx| {
                ctx.allow_weapon_target(attacker_id, target_id, weapon_num, weapon_def_id, priority)
            })
            .unwrap_or(WeaponTarget {
                allowed: true,
                priority,
            })
    }

    pub fn allow_weapon_intercept_target(
        &self,
        interceptor: &UnitRef,
        weapon: &WeaponRef,
        target: &ProjectileRef,
    ) -> bool {
        self.synced_context().map_or(true, |ctx| {
            ctx.allow_weapon_intercept_target(interceptor, weapon, target)
        })
    }

    pub fn unit_pre_damaged(&self, hit: &UnitDamage) -> PreDamaged {
        self.synced_context()
            .map(|ctx| ctx.unit_pre_damaged(hit))
            .unwrap_or_else(|| PreDamaged::unchanged(hit.damage))
    }

    pub fn feature_pre_damaged(&self, hit: &FeatureDamage) -> PreDamaged {
        self.synced_context()
            .map(|ctx| ctx.feature_pre_damaged(hit))
            .unwrap_or_else(|| PreDamaged::unchanged(hit.damage))
    }

    pub fn shield_pre_damaged(&self, hit: &ShieldHit) -> bool {
        self.synced_context()
            .is_some_and(|ctx| ctx.shield_pre_damaged(hit))
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.kill_lua(false);
    }
}
