use std::collections::{BTreeMap, BTreeSet};

use bevy::log::debug;
use mlua::{Function, Lua, MultiValue, Table, Value};
use serde::Serialize;

use super::{
    context_env, script_table, synced_iter, CallOutcome, ContextStack, HandleIdentity,
    LuaContext, ScriptContext, SharedErrors,
};
use crate::bridge::{encode_payload, BridgeMessage, BridgeSender};
use crate::callins::{
    BuildInfo, CallIn, Command, CommandFallbackResult, ContextKind, FeatureDamage, FeatureRef,
    Float3, PreDamaged, ProjectileRef, ShieldHit, UnitDamage, UnitRef, WeaponRef, WeaponTarget,
    TARGET_CHECK_NO_OPINION,
};
use crate::config::ScriptLimits;
use crate::errors::LoadError;
use crate::fallback::ActionFallbacks;
use crate::permissions::CapabilityGate;
use crate::session::Session;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefKind {
    Unit,
    Feature,
    Weapon,
}

#[derive(Default)]
struct WatchFlags {
    units: BTreeSet<i32>,
    features: BTreeSet<i32>,
    weapons: BTreeSet<i32>,
}

impl WatchFlags {
    fn ids(&self, kind: DefKind) -> &BTreeSet<i32> {
        match kind {
            DefKind::Unit => &self.units,
            DefKind::Feature => &self.features,
            DefKind::Weapon => &self.weapons,
        }
    }

    fn ids_mut(&mut self, kind: DefKind) -> &mut BTreeSet<i32> {
        match kind {
            DefKind::Unit => &mut self.units,
            DefKind::Feature => &mut self.features,
            DefKind::Weapon => &mut self.weapons,
        }
    }

    fn get(&self, kind: DefKind, id: i32) -> bool {
        self.ids(kind).contains(&id)
    }

    fn set(&mut self, kind: DefKind, id: i32, watch: bool) {
        if watch {
            self.ids_mut(kind).insert(id);
        } else {
            self.ids_mut(kind).remove(&id);
        }
    }
}

/// Deterministic-only app data: everything the synced call-outs mutate.
struct SyncedEnv {
    bridge: BridgeSender,
    frame: u64,
    fallbacks: ActionFallbacks,
    watch: WatchFlags,
}

fn synced_env(lua: &Lua) -> mlua::Result<mlua::AppDataRef<'_, SyncedEnv>> {
    lua.app_data_ref::<SyncedEnv>()
        .ok_or_else(|| mlua::Error::RuntimeError("synced call-out outside a synced state".into()))
}

fn synced_env_mut(lua: &Lua) -> mlua::Result<mlua::AppDataRefMut<'_, SyncedEnv>> {
    lua.app_data_mut::<SyncedEnv>()
        .ok_or_else(|| mlua::Error::RuntimeError("synced call-out outside a synced state".into()))
}

/// Script state whose observable effects must match on every peer.
pub struct DeterministicContext {
    base: LuaContext,
}

impl DeterministicContext {
    pub(crate) fn new(
        identity: HandleIdentity,
        limits: ScriptLimits,
        gate: CapabilityGate,
        session: Session,
        errors: SharedErrors,
        bridge: BridgeSender,
    ) -> Result<Self, LoadError> {
        let base = LuaContext::new(
            ContextKind::Deterministic,
            identity,
            limits,
            gate,
            session,
            errors,
        )?;
        if let Some(lua) = base.lua() {
            lua.set_app_data(SyncedEnv {
                bridge,
                frame: 0,
                fallbacks: ActionFallbacks::default(),
                watch: WatchFlags::default(),
            });
            install_synced_callouts(lua).map_err(|err| LoadError::Environment {
                context: ContextKind::Deterministic,
                message: err.to_string(),
            })?;
        }
        Ok(Self { base })
    }

    pub(crate) fn exec_chunk(&self, chunk: &str, source: &str) -> Result<(), LoadError> {
        self.base.exec_chunk(chunk, source)
    }

    pub(crate) fn initialize(&self) -> Result<(), LoadError> {
        self.base.initialize()
    }

    pub(crate) fn kill(&mut self, in_free_handler: bool) {
        self.base.kill(in_free_handler);
    }

    pub(crate) fn check_stack(&self) -> Option<ContextStack> {
        self.base.check_stack()
    }

    pub(crate) fn set_frame(&self, frame: u64) {
        self.base.set_frame(frame);
        if let Some(lua) = self.base.lua() {
            if let Ok(mut env) = synced_env_mut(lua) {
                env.frame = frame;
            }
        }
    }

    pub fn text_commands(&self) -> BTreeMap<String, String> {
        self.base
            .lua()
            .and_then(|lua| synced_env(lua).ok().map(|env| env.fallbacks.text_commands().clone()))
            .unwrap_or_default()
    }

    pub fn fallback_names(&self) -> Vec<String> {
        self.base
            .lua()
            .and_then(|lua| synced_env(lua).ok().map(|env| env.fallbacks.chain_names()))
            .unwrap_or_default()
    }

    pub fn is_watched(&self, kind: DefKind, id: i32) -> bool {
        self.base
            .lua()
            .and_then(|lua| synced_env(lua).ok().map(|env| env.watch.get(kind, id)))
            .unwrap_or(false)
    }

    pub fn game_frame(&self, frame: u64) {
        self.set_frame(frame);
        let _ = self.base.call_in::<_, ()>(CallIn::GameFrame, frame);
    }

    /// `CommandFallback(unitID, unitDefID, unitTeam, cmdID, cmdParams, cmdOptions, cmdTag)`
    /// returning `used, remove`.
    pub fn command_fallback(&self, unit: &UnitRef, cmd: &Command) -> CommandFallbackResult {
        let outcome = self.base.call_in::<_, (Option<bool>, Option<bool>)>(
            CallIn::CommandFallback,
            (
                unit.id,
                unit.def_id,
                unit.team,
                cmd.id,
                cmd.params.clone(),
                cmd.options,
                cmd.tag,
            ),
        );
        match outcome {
            CallOutcome::Returned((used, remove)) => CommandFallbackResult {
                used: used.unwrap_or(false),
                remove: remove.unwrap_or(true),
            },
            CallOutcome::Missing | CallOutcome::Failed => CommandFallbackResult {
                used: false,
                remove: true,
            },
        }
    }

    pub fn allow_command(&self, unit: &UnitRef, cmd: &Command, from_synced: bool) -> bool {
        self.base
            .call_in(
                CallIn::AllowCommand,
                (
                    unit.id,
                    unit.def_id,
                    unit.team,
                    cmd.id,
                    cmd.params.clone(),
                    cmd.options,
                    cmd.tag,
                    from_synced,
                ),
            )
            .allowed()
    }

    /// `AllowUnitCreation(unitDefID, builderID, builderTeam, x, y, z, facing)`
    pub fn allow_unit_creation(
        &self,
        unit_def_id: i32,
        builder: Option<&UnitRef>,
        build: Option<&BuildInfo>,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowUnitCreation,
                (
                    unit_def_id,
                    builder.map(|b| b.id),
                    builder.map(|b| b.team),
                    build.map(|b| b.pos.x),
                    build.map(|b| b.pos.y),
                    build.map(|b| b.pos.z),
                    build.map(|b| b.facing),
                ),
            )
            .allowed()
    }

    pub fn allow_unit_transfer(&self, unit: &UnitRef, new_team: i32, capture: bool) -> bool {
        self.base
            .call_in(
                CallIn::AllowUnitTransfer,
                (unit.id, unit.def_id, unit.team, new_team, capture),
            )
            .allowed()
    }

    pub fn allow_unit_build_step(&self, builder: &UnitRef, unit: &UnitRef, part: f32) -> bool {
        self.base
            .call_in(
                CallIn::AllowUnitBuildStep,
                (builder.id, builder.team, unit.id, unit.def_id, part),
            )
            .allowed()
    }

    pub fn allow_unit_transport(&self, transporter: &UnitRef, transportee: &UnitRef) -> bool {
        self.base
            .call_in(
                CallIn::AllowUnitTransport,
                (
                    transporter.id,
                    transporter.def_id,
                    transporter.team,
                    transportee.id,
                    transportee.def_id,
                    transportee.team,
                ),
            )
            .allowed()
    }

    pub fn allow_unit_cloak(&self, unit: &UnitRef, enemy: Option<&UnitRef>) -> bool {
        self.base
            .call_in(CallIn::AllowUnitCloak, (unit.id, enemy.map(|e| e.id)))
            .allowed()
    }

    pub fn allow_unit_decloak(
        &self,
        unit: &UnitRef,
        object_id: Option<u32>,
        weapon: Option<&WeaponRef>,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowUnitDecloak,
                (unit.id, object_id, weapon.map(|w| w.num)),
            )
            .allowed()
    }

    pub fn allow_feature_creation(&self, feature_def_id: i32, ally_team: i32, pos: Float3) -> bool {
        self.base
            .call_in(
                CallIn::AllowFeatureCreation,
                (feature_def_id, ally_team, pos.x, pos.y, pos.z),
            )
            .allowed()
    }

    pub fn allow_feature_build_step(
        &self,
        builder: &UnitRef,
        feature: &FeatureRef,
        part: f32,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowFeatureBuildStep,
                (builder.id, builder.team, feature.id, feature.def_id, part),
            )
            .allowed()
    }

    pub fn allow_resource_level(&self, team: i32, resource: &str, level: f32) -> bool {
        self.base
            .call_in(CallIn::AllowResourceLevel, (team, resource, level))
            .allowed()
    }

    pub fn allow_resource_transfer(
        &self,
        old_team: i32,
        new_team: i32,
        resource: &str,
        amount: f32,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowResourceTransfer,
                (old_team, new_team, resource, amount),
            )
            .allowed()
    }

    pub fn allow_direct_unit_control(&self, player_id: i32, unit: &UnitRef) -> bool {
        self.base
            .call_in(
                CallIn::AllowDirectUnitControl,
                (unit.id, unit.def_id, unit.team, player_id),
            )
            .allowed()
    }

    pub fn allow_builder_hold_fire(&self, unit: &UnitRef, action: i32) -> bool {
        self.base
            .call_in(CallIn::AllowBuilderHoldFire, (unit.id, unit.def_id, action))
            .allowed()
    }

    pub fn allow_start_position(
        &self,
        player_id: i32,
        team_id: i32,
        ready_state: u8,
        clamped: Float3,
        raw_pick: Float3,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowStartPosition,
                (
                    player_id,
                    team_id,
                    ready_state,
                    clamped.x,
                    clamped.y,
                    clamped.z,
                    raw_pick.x,
                    raw_pick.y,
                    raw_pick.z,
                ),
            )
            .allowed()
    }

    /// Returns true when terraforming for `build` should stop.
    pub fn terraform_complete(&self, unit: &UnitRef, build: &UnitRef) -> bool {
        self.base
            .call_in(
                CallIn::TerraformComplete,
                (
                    unit.id,
                    unit.def_id,
                    unit.team,
                    build.id,
                    build.def_id,
                    build.team,
                ),
            )
            .claimed()
    }

    pub fn move_ctrl_notify(&self, unit: &UnitRef, data: i32) -> bool {
        self.base
            .call_in(
                CallIn::MoveCtrlNotify,
                (unit.id, unit.def_id, unit.team, data),
            )
            .claimed()
    }

    /// `-1` leaves the decision to the engine, `0` skips the target check, `1` forces it.
    pub fn allow_weapon_target_check(
        &self,
        attacker_id: u32,
        weapon_num: u32,
        weapon_def_id: i32,
    ) -> i32 {
        match self.base.call_in::<_, (Option<bool>, Option<bool>)>(
            CallIn::AllowWeaponTargetCheck,
            (attacker_id, weapon_num, weapon_def_id),
        ) {
            CallOutcome::Missing => TARGET_CHECK_NO_OPINION,
            CallOutcome::Returned((_, Some(true))) | CallOutcome::Returned((None, _)) => {
                TARGET_CHECK_NO_OPINION
            }
            CallOutcome::Returned((Some(allow), _)) => i32::from(allow),
            CallOutcome::Failed => 0,
        }
    }

    pub fn allow_weapon_target(
        &self,
        attacker_id: u32,
        target_id: u32,
        weapon_num: u32,
        weapon_def_id: i32,
        priority: f32,
    ) -> WeaponTarget {
        match self.base.call_in::<_, (Option<bool>, Option<f32>)>(
            CallIn::AllowWeaponTarget,
            (attacker_id, target_id, weapon_num, weapon_def_id, priority),
        ) {
            CallOutcome::Missing => WeaponTarget {
                allowed: true,
                priority,
            },
            CallOutcome::Returned((allowed, new_priority)) => WeaponTarget {
                allowed: allowed.unwrap_or(true),
                priority: new_priority.unwrap_or(priority),
            },
            CallOutcome::Failed => WeaponTarget {
                allowed: false,
                priority,
            },
        }
    }

    pub fn allow_weapon_intercept_target(
        &self,
        interceptor: &UnitRef,
        weapon: &WeaponRef,
        target: &ProjectileRef,
    ) -> bool {
        self.base
            .call_in(
                CallIn::AllowWeaponInterceptTarget,
                (interceptor.id, weapon.num, target.id),
            )
            .allowed()
    }

    /// `UnitPreDamaged(unitID, unitDefID, unitTeam, damage, paralyzer, weaponDefID,
    /// projectileID, attackerID, attackerDefID, attackerTeam)` returning `newDamage, impulseMult`.
    pub fn unit_pre_damaged(&self, hit: &UnitDamage) -> PreDamaged {
        let outcome = self.base.call_in::<_, (Option<f32>, Option<f32>)>(
            CallIn::UnitPreDamaged,
            (
                hit.unit.id,
                hit.unit.def_id,
                hit.unit.team,
                hit.damage,
                hit.paralyzer,
                hit.weapon_def_id,
                hit.projectile_id,
                hit.attacker.map(|a| a.id),
                hit.attacker.map(|a| a.def_id),
                hit.attacker.map(|a| a.team),
            ),
        );
        pre_damaged(outcome, hit.damage)
    }

    pub fn feature_pre_damaged(&self, hit: &FeatureDamage) -> PreDamaged {
        let outcome = self.base.call_in::<_, (Option<f32>, Option<f32>)>(
            CallIn::FeaturePreDamaged,
            (
                hit.feature.id,
                hit.feature.def_id,
                hit.feature.ally_team,
                hit.damage,
                hit.weapon_def_id,
                hit.projectile_id,
                hit.attacker.map(|a| a.id),
                hit.attacker.map(|a| a.def_id),
                hit.attacker.map(|a| a.team),
            ),
        );
        pre_damaged(outcome, hit.damage)
    }

    /// Returns true when the shield should let the projectile through untouched.
    pub fn shield_pre_damaged(&self, hit: &ShieldHit) -> bool {
        self.base
            .call_in(
                CallIn::ShieldPreDamaged,
                (
                    hit.projectile.map(|p| p.id),
                    hit.projectile.and_then(|p| p.owner_id),
                    hit.shield_emitter.num,
                    hit.shield_carrier.id,
                    hit.bounce_projectile,
                    hit.beam_emitter.map(|w| w.num),
                    hit.beam_carrier.map(|u| u.id),
                    hit.start_pos.x,
                    hit.start_pos.y,
                    hit.start_pos.z,
                    hit.hit_pos.x,
                    hit.hit_pos.y,
                    hit.hit_pos.z,
                ),
            )
            .claimed()
    }

    /// Walks the fallback chain in registration order and stops at the first handler that
    /// claims the line.
    pub fn synced_action_fallback(&self, line: &str, player_id: i32) -> bool {
        let Some(lua) = self.base.lua() else {
            return false;
        };
        let snapshot = match synced_env(lua).and_then(|env| env.fallbacks.snapshot(lua)) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.base
                    .record_error(CallIn::SyncedActionFallback.name(), &err);
                return false;
            }
        };
        for entry in snapshot {
            let registered = synced_env(lua)
                .map(|env| env.fallbacks.is_registered(entry.id))
                .unwrap_or(false);
            if !registered {
                continue;
            }
            let label = format!("{}:{}", CallIn::SyncedActionFallback.name(), entry.name);
            let claimed = self
                .base
                .invoke::<_, Option<bool>>(&label, &entry.handler, (line, player_id))
                .claimed();
            if claimed {
                debug!(
                    "[Lockstep scripts] {} fallback '{}' claimed '{}'",
                    self.base.identity().name,
                    entry.name,
                    line
                );
                return true;
            }
        }
        false
    }

    /// `GotChatMsg(msg, playerID)`; unclaimed messages continue down the fallback chain.
    pub fn got_chat_msg(&self, msg: &str, player_id: i32) -> bool {
        if self
            .base
            .call_in::<_, Option<bool>>(CallIn::GotChatMsg, (msg, player_id))
            .claimed()
        {
            return true;
        }
        self.synced_action_fallback(msg, player_id)
    }

    pub fn recv_lua_msg(&self, msg: &str, player_id: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::RecvLuaMsg, (msg, player_id))
            .claimed()
    }
}

impl ScriptContext for DeterministicContext {
    fn kind(&self) -> ContextKind {
        self.base.kind()
    }

    fn identity(&self) -> &HandleIdentity {
        self.base.identity()
    }

    fn is_valid(&self) -> bool {
        self.base.lua().is_some()
    }

    fn lua(&self) -> Option<&Lua> {
        self.base.lua()
    }
}

fn pre_damaged(outcome: CallOutcome<(Option<f32>, Option<f32>)>, damage: f32) -> PreDamaged {
    match outcome {
        CallOutcome::Returned((new_damage, impulse_mult)) => {
            let new_damage = new_damage.unwrap_or(damage);
            let impulse_mult = impulse_mult.unwrap_or(1.0);
            PreDamaged {
                handled: new_damage == 0.0 && impulse_mult == 0.0,
                new_damage,
                impulse_mult,
            }
        }
        CallOutcome::Missing | CallOutcome::Failed => PreDamaged::unchanged(damage),
    }
}

fn interval_empty(name: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!("bad argument to '{name}' (interval is empty)"))
}

/// `math.random` over the session generator, with Lua's argument conventions.
fn synced_random(lua: &Lua, (m, n): (Option<f64>, Option<f64>)) -> mlua::Result<Value> {
    let session = context_env(lua)?.session.clone();
    match (m, n) {
        (None, None) => Ok(Value::Number(session.random_float())),
        (Some(upper), None) => {
            let upper = upper.floor() as i64;
            if upper < 1 {
                return Err(interval_empty("random"));
            }
            Ok(Value::Integer(session.random_range(1, upper) as mlua::Integer))
        }
        (Some(lower), Some(upper)) => {
            let (lower, upper) = (lower.floor() as i64, upper.floor() as i64);
            if lower > upper {
                return Err(interval_empty("random"));
            }
            Ok(Value::Integer(session.random_range(lower, upper) as mlua::Integer))
        }
        (None, Some(_)) => Err(mlua::Error::RuntimeError(
            "bad argument #1 to 'random' (number expected, got nil)".into(),
        )),
    }
}

fn param_text(value: Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Ok((n as i64).to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "SetGameParam: value must be a string or number, got {}",
            other.type_name()
        ))),
    }
}

fn install_synced_callouts(lua: &Lua) -> mlua::Result<()> {
    let math = lua.globals().get::<Table>("math")?;
    math.set("random", lua.create_function(synced_random)?)?;
    math.set(
        "randomseed",
        lua.create_function(|lua, seed: f64| {
            context_env(lua)?.session.reseed(seed.floor() as i64 as u64);
            Ok(())
        })?,
    )?;
    synced_iter::install(lua)?;

    let script = script_table(lua)?;

    script.set(
        "SendToUnsynced",
        lua.create_function(|lua, args: MultiValue| {
            let payload = encode_payload(args)?;
            let mut env = synced_env_mut(lua)?;
            let frame = env.frame;
            env.bridge.send(BridgeMessage { frame, payload });
            Ok(())
        })?,
    )?;

    script.set(
        "AddActionFallback",
        lua.create_function(
            |lua, (name, help, handler): (String, Option<String>, Function)| {
                synced_env_mut(lua)?.fallbacks.add(
                    lua,
                    &name,
                    help.as_deref().unwrap_or(""),
                    handler,
                )
            },
        )?,
    )?;

    script.set(
        "RemoveActionFallback",
        lua.create_function(|lua, name: String| Ok(synced_env_mut(lua)?.fallbacks.remove(&name)))?,
    )?;

    script.set(
        "GetTextCommands",
        lua.create_function(|lua, ()| {
            let commands = synced_env(lua)?.fallbacks.text_commands().clone();
            lua.create_table_from(commands)
        })?,
    )?;

    for (kind, suffix) in [
        (DefKind::Unit, "UnitDef"),
        (DefKind::Feature, "FeatureDef"),
        (DefKind::Weapon, "WeaponDef"),
    ] {
        script.set(
            format!("GetWatch{suffix}"),
            lua.create_function(move |lua, id: i32| Ok(synced_env(lua)?.watch.get(kind, id)))?,
        )?;
        script.set(
            format!("SetWatch{suffix}"),
            lua.create_function(move |lua, (id, watch): (i32, bool)| {
                synced_env_mut(lua)?.watch.set(kind, id, watch);
                Ok(())
            })?,
        )?;
    }

    script.set(
        "SetGameParam",
        lua.create_function(|lua, (key, value): (String, Value)| {
            let value = param_text(value)?;
            context_env(lua)?.session.set_game_param(key, value);
            Ok(())
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::bridge;
    use serde_json::json;

    fn limits() -> ScriptLimits {
        ScriptLimits {
            synced_instruction_budget: 1_000_000,
            unsynced_budget_ms: 1_000,
            instruction_interval: 1_000,
            bridge_capacity: 64,
        }
    }

    fn synced(source: &str, session: Session) -> (DeterministicContext, crate::bridge::BridgeReceiver) {
        let (tx, rx) = bridge(64);
        let ctx = DeterministicContext::new(
            HandleIdentity {
                name: "rules".into(),
                order: 0,
            },
            limits(),
            CapabilityGate::default(),
            session,
            SharedErrors::default(),
            tx,
        )
        .expect("context");
        ctx.exec_chunk("rules.lua", source).expect("load");
        (ctx, rx)
    }

    fn unit(id: u32) -> UnitRef {
        UnitRef {
            id,
            def_id: 10,
            team: 1,
        }
    }

    #[test]
    fn fallback_chain_stops_at_first_claim() {
        let (ctx, _rx) = synced(
            r#"
            calls = {}
            for _, name in ipairs({ "A", "B", "C", "D" }) do
                Script.AddActionFallback(name, name .. " help", function(line)
                    calls[#calls + 1] = name
                    return name == "C"
                end)
            end
        "#,
            Session::new(1),
        );
        assert!(ctx.synced_action_fallback("/anything", 0));
        let calls: Vec<String> = ctx.lua().expect("lua").globals().get("calls").expect("calls");
        assert_eq!(calls, vec!["A", "B", "C"]);
    }

    #[test]
    fn handler_may_unregister_itself_and_others_mid_dispatch() {
        let (ctx, _rx) = synced(
            r#"
            calls = {}
            Script.AddActionFallback("A", "", function()
                calls[#calls + 1] = "A"
                Script.RemoveActionFallback("A")
                Script.RemoveActionFallback("B")
                return false
            end)
            Script.AddActionFallback("B", "", function() calls[#calls + 1] = "B" return false end)
            Script.AddActionFallback("C", "", function() calls[#calls + 1] = "C" return false end)
        "#,
            Session::new(1),
        );
        assert!(!ctx.synced_action_fallback("/x", 2));
        let calls: Vec<String> = ctx.lua().expect("lua").globals().get("calls").expect("calls");
        assert_eq!(calls, vec!["A", "C"]);
        assert_eq!(ctx.fallback_names(), vec!["C"]);
        assert_eq!(ctx.text_commands().len(), 1);
    }

    #[test]
    fn failing_handler_counts_as_unclaimed() {
        let (ctx, _rx) = synced(
            r#"
            Script.AddActionFallback("broken", "", function() error("bad handler") end)
            Script.AddActionFallback("ally", "", function(line) return line:sub(1, 5) == "/ally" end)
        "#,
            Session::new(1),
        );
        assert!(ctx.synced_action_fallback("/ally 2", 0));
        assert!(!ctx.synced_action_fallback("/enemy", 0));
    }

    #[test]
    fn synced_random_matches_across_instances() {
        let source = r#"
            function GameFrame(n)
                local values = {}
                for i = 1, 8 do values[i] = math.random(1, 100) end
                values[9] = math.random(6)
                values[10] = math.random()
                Script.SendToUnsynced("rolls", values)
            end
        "#;
        let (a, rx_a) = synced(source, Session::new(42));
        let (b, rx_b) = synced(source, Session::new(42));
        for frame in 1..=5 {
            a.game_frame(frame);
            b.game_frame(frame);
        }
        let sent_a = rx_a.drain();
        let sent_b = rx_b.drain();
        assert_eq!(sent_a.len(), 5);
        assert_eq!(sent_a, sent_b);
        assert_eq!(sent_a[4].frame, 5);
    }

    #[test]
    fn random_rejects_empty_intervals() {
        let (ctx, _rx) = synced("", Session::new(3));
        let lua = ctx.lua().expect("lua");
        let (zero_ok, reversed_ok): (bool, bool) = lua
            .load("return pcall(math.random, 0), pcall(math.random, 5, 1)")
            .eval()
            .expect("eval");
        assert!(!zero_ok);
        assert!(!reversed_ok);
    }

    #[test]
    fn randomseed_resets_the_shared_stream() {
        let (ctx, _rx) = synced("", Session::new(3));
        let lua = ctx.lua().expect("lua");
        let same: bool = lua
            .load(
                r#"
                math.randomseed(77)
                local a = { math.random(1000), math.random(1000), math.random(1000) }
                math.randomseed(77)
                local b = { math.random(1000), math.random(1000), math.random(1000) }
                return a[1] == b[1] and a[2] == b[2] and a[3] == b[3]
            "#,
            )
            .eval()
            .expect("eval");
        assert!(same);
    }

    #[test]
    fn pre_damage_rewrites_damage_and_impulse() {
        let (ctx, _rx) = synced(
            r#"
            function UnitPreDamaged(unitID, unitDefID, unitTeam, damage, paralyzer, weaponDefID, projectileID, attackerID)
                if attackerID == nil then return 0, 0 end
                return damage * 0.5, 2
            end
        "#,
            Session::new(1),
        );
        let mut hit = UnitDamage {
            unit: unit(1),
            attacker: Some(unit(2)),
            damage: 100.0,
            weapon_def_id: 3,
            projectile_id: -1,
            paralyzer: false,
        };
        let adjusted = ctx.unit_pre_damaged(&hit);
        assert_eq!(adjusted.new_damage, 50.0);
        assert_eq!(adjusted.impulse_mult, 2.0);
        assert!(!adjusted.handled);

        hit.attacker = None;
        assert!(ctx.unit_pre_damaged(&hit).handled);
    }

    #[test]
    fn erroring_authorization_denies() {
        let (ctx, _rx) = synced(
            r#"
            function AllowUnitTransfer(unitID, unitDefID, oldTeam, newTeam, capture)
                return not capture
            end
            function AllowResourceTransfer() error("boom") end
        "#,
            Session::new(1),
        );
        assert!(ctx.allow_unit_transfer(&unit(1), 2, false));
        assert!(!ctx.allow_unit_transfer(&unit(1), 2, true));
        assert!(!ctx.allow_resource_transfer(0, 1, "metal", 50.0));
        assert!(ctx.allow_resource_level(0, "energy", 10.0));
    }

    #[test]
    fn weapon_targeting_outputs() {
        let (ctx, _rx) = synced(
            r#"
            function AllowWeaponTarget(attackerID, targetID, weaponNum, weaponDefID, priority)
                if targetID == 9 then return false, priority end
                return true, priority * 2
            end
            function AllowWeaponTargetCheck(attackerID, weaponNum, weaponDefID)
                if weaponDefID == 1 then return false, true end
                return weaponDefID == 2
            end
        "#,
            Session::new(1),
        );
        let target = ctx.allow_weapon_target(1, 4, 0, 5, 1.5);
        assert!(target.allowed);
        assert_eq!(target.priority, 3.0);
        assert!(!ctx.allow_weapon_target(1, 9, 0, 5, 1.5).allowed);
        assert_eq!(ctx.allow_weapon_target_check(1, 0, 1), TARGET_CHECK_NO_OPINION);
        assert_eq!(ctx.allow_weapon_target_check(1, 0, 2), 1);
        assert_eq!(ctx.allow_weapon_target_check(1, 0, 3), 0);
    }

    #[test]
    fn command_fallback_defaults_to_removal() {
        let (ctx, _rx) = synced("", Session::new(1));
        let cmd = Command {
            id: 35_000,
            params: vec![1.0, 2.0],
            options: 0,
            tag: 7,
        };
        let result = ctx.command_fallback(&unit(1), &cmd);
        assert!(!result.used);
        assert!(result.remove);
    }

    #[test]
    fn watch_flags_are_per_definition_kind() {
        let (ctx, _rx) = synced(
            r#"
            Script.SetWatchUnitDef(12, true)
            Script.SetWatchWeaponDef(4, true)
            Script.SetWatchWeaponDef(4, false)
            watched = Script.GetWatchUnitDef(12)
        "#,
            Session::new(1),
        );
        assert!(ctx.is_watched(DefKind::Unit, 12));
        assert!(!ctx.is_watched(DefKind::Feature, 12));
        assert!(!ctx.is_watched(DefKind::Weapon, 4));
        let watched: bool = ctx.lua().expect("lua").globals().get("watched").expect("watched");
        assert!(watched);
    }

    #[test]
    fn game_params_are_written_as_text() {
        let session = Session::new(1);
        let (ctx, _rx) = synced(
            r#"
            Script.SetGameParam("mode", "koth")
            Script.SetGameParam("limit", 30)
            Script.SetGameParam("ratio", 0.25)
            ok = not pcall(Script.SetGameParam, "bad", {})
        "#,
            session.clone(),
        );
        assert_eq!(session.game_param("mode").as_deref(), Some("koth"));
        assert_eq!(session.game_param("limit").as_deref(), Some("30"));
        assert_eq!(session.game_param("ratio").as_deref(), Some("0.25"));
        let ok: bool = ctx.lua().expect("lua").globals().get("ok").expect("ok");
        assert!(ok);
    }

    #[test]
    fn send_to_unsynced_tags_messages_with_the_frame() {
        let (ctx, rx) = synced(
            r#"function GameFrame(n) Script.SendToUnsynced("tick", n) end"#,
            Session::new(1),
        );
        ctx.game_frame(3);
        let sent = rx.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame, 3);
        assert_eq!(sent[0].payload[0], json!("tick"));
    }
}
