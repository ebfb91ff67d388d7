mod deterministic;
mod presentation;
pub(crate) mod synced_iter;

pub use deterministic::{DefKind, DeterministicContext};
pub use presentation::PresentationContext;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bevy::log::{error, info, warn};
use mlua::{
    ChunkMode, FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions, LuaSerdeExt,
    MultiValue, StdLib, Table, Value, VmState,
};
use serde::Serialize;

use crate::callins::{CallIn, ContextKind};
use crate::config::ScriptLimits;
use crate::errors::{LoadError, ScriptError, ScriptErrors};
use crate::permissions::{CapabilityGate, Permissions, TeamOverride};
use crate::session::Session;

pub type SharedErrors = Rc<RefCell<ScriptErrors>>;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct HandleIdentity {
    pub name: String,
    pub order: i32,
}

/// The capability subset shared by both kinds of context.
pub trait ScriptContext {
    fn kind(&self) -> ContextKind;
    fn identity(&self) -> &HandleIdentity;
    fn is_valid(&self) -> bool;
    fn lua(&self) -> Option<&Lua>;
}

/// Installed as app data in every state. Call-outs reach their owning context through it.
pub(crate) struct ContextEnv {
    pub gate: CapabilityGate,
    pub session: Session,
    pub call_depth: u32,
    pub call_permissions: Option<Permissions>,
    pub team_overrides: Vec<TeamOverride>,
}

pub(crate) enum CallOutcome<R> {
    /// The script does not define the call-in (or the state is gone).
    Missing,
    Returned(R),
    /// A script error was caught and recorded.
    Failed,
}

impl CallOutcome<Option<bool>> {
    /// Authorization result: undefined call-ins and `nil` allow, errors deny.
    pub fn allowed(self) -> bool {
        match self {
            CallOutcome::Missing => true,
            CallOutcome::Returned(value) => value.unwrap_or(true),
            CallOutcome::Failed => false,
        }
    }

    pub fn claimed(self) -> bool {
        matches!(self, CallOutcome::Returned(Some(true)))
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextStack {
    pub context: ContextKind,
    pub call_depth: u32,
    pub team_overrides: usize,
    pub memory_bytes: usize,
    pub balanced: bool,
}

pub(crate) struct LuaContext {
    kind: ContextKind,
    identity: HandleIdentity,
    limits: ScriptLimits,
    errors: SharedErrors,
    frame: Cell<u64>,
    lua: Option<Lua>,
}

impl LuaContext {
    pub fn new(
        kind: ContextKind,
        identity: HandleIdentity,
        limits: ScriptLimits,
        gate: CapabilityGate,
        session: Session,
        errors: SharedErrors,
    ) -> Result<Self, LoadError> {
        let libs = match kind {
            ContextKind::Deterministic => {
                StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::JIT
            }
            ContextKind::Presentation => {
                StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::OS
            }
        };
        let environment_error = |err: mlua::Error| LoadError::Environment {
            context: kind,
            message: err.to_string(),
        };
        let lua = Lua::new_with(libs, LuaOptions::new()).map_err(environment_error)?;
        lua.set_app_data(ContextEnv {
            gate,
            session,
            call_depth: 0,
            call_permissions: None,
            team_overrides: Vec::new(),
        });
        install_common_callouts(&lua, kind, &identity.name).map_err(environment_error)?;
        Ok(Self {
            kind,
            identity,
            limits,
            errors,
            frame: Cell::new(0),
            lua: Some(lua),
        })
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn identity(&self) -> &HandleIdentity {
        &self.identity
    }

    pub fn lua(&self) -> Option<&Lua> {
        self.lua.as_ref()
    }

    pub fn set_frame(&self, frame: u64) {
        self.frame.set(frame);
    }

    pub fn exec_chunk(&self, chunk: &str, source: &str) -> Result<(), LoadError> {
        let Some(lua) = self.lua.as_ref() else {
            return Err(LoadError::Chunk {
                context: self.kind,
                chunk: chunk.to_string(),
                message: "state already closed".to_string(),
            });
        };
        self.guarded(lua, || {
            lua.load(source)
                .set_name(chunk)
                .set_mode(ChunkMode::Text)
                .exec()
        })
        .map_err(|err| LoadError::Chunk {
            context: self.kind,
            chunk: chunk.to_string(),
            message: err.to_string(),
        })
    }

    pub fn initialize(&self) -> Result<(), LoadError> {
        let Some(lua) = self.lua.as_ref() else {
            return Ok(());
        };
        let func = match lua.globals().get::<Value>(CallIn::Initialize.name()) {
            Ok(Value::Function(func)) => func,
            _ => return Ok(()),
        };
        self.guarded(lua, || func.call::<()>(()))
            .map_err(|err| LoadError::Initialize {
                context: self.kind,
                message: err.to_string(),
            })
    }

    pub fn call_in<A, R>(&self, call_in: CallIn, args: A) -> CallOutcome<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        if !call_in.supported_by(self.kind) {
            return CallOutcome::Missing;
        }
        let Some(lua) = self.lua.as_ref() else {
            return CallOutcome::Missing;
        };
        let func = match lua.globals().get::<Value>(call_in.name()) {
            Ok(Value::Function(func)) => func,
            Ok(_) => return CallOutcome::Missing,
            Err(err) => {
                self.record_error(call_in.name(), &err);
                return CallOutcome::Failed;
            }
        };
        self.invoke(call_in.name(), &func, args)
    }

    /// Runs a script function under the call frame and execution budget of a call-in.
    pub fn invoke<A, R>(&self, label: &str, func: &Function, args: A) -> CallOutcome<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let Some(lua) = self.lua.as_ref() else {
            return CallOutcome::Missing;
        };
        match self.guarded(lua, || func.call::<R>(args)) {
            Ok(value) => CallOutcome::Returned(value),
            Err(err) => {
                self.record_error(label, &err);
                CallOutcome::Failed
            }
        }
    }

    fn guarded<R>(&self, lua: &Lua, f: impl FnOnce() -> mlua::Result<R>) -> mlua::Result<R> {
        let outermost = enter_call(lua)?;
        if outermost {
            self.install_budget_hook(lua);
        }
        let result = f();
        if outermost {
            lua.remove_hook();
        }
        leave_call(lua);
        result
    }

    fn install_budget_hook(&self, lua: &Lua) {
        let interval = self.limits.instruction_interval.max(1);
        match self.kind {
            ContextKind::Deterministic => {
                let budget = self.limits.synced_instruction_budget;
                let executed = Cell::new(0u64);
                lua.set_hook(
                    HookTriggers::new().every_nth_instruction(interval),
                    move |_lua, _debug| {
                        let total = executed.get().saturating_add(interval as u64);
                        executed.set(total);
                        if total > budget {
                            return Err(mlua::Error::RuntimeError(format!(
                                "Script instruction budget exceeded ({budget} instructions)"
                            )));
                        }
                        Ok(VmState::Continue)
                    },
                );
            }
            ContextKind::Presentation => {
                let started = Instant::now();
                let max_duration = Duration::from_millis(self.limits.unsynced_budget_ms);
                let budget_ms = self.limits.unsynced_budget_ms;
                lua.set_hook(
                    HookTriggers::new().every_nth_instruction(interval),
                    move |_lua, _debug| {
                        if started.elapsed() >= max_duration {
                            return Err(mlua::Error::RuntimeError(format!(
                                "Script execution budget exceeded ({budget_ms}ms)"
                            )));
                        }
                        Ok(VmState::Continue)
                    },
                );
            }
        }
    }

    pub fn record_error(&self, label: &str, err: &mlua::Error) {
        warn!(
            "[Lockstep scripts] {} ({}) {} failed at frame {}: {}",
            self.identity.name,
            self.kind.label(),
            label,
            self.frame.get(),
            err
        );
        self.errors.borrow_mut().push(ScriptError {
            handle: self.identity.name.clone(),
            context: self.kind,
            call_in: label.to_string(),
            error_message: err.to_string(),
            frame: self.frame.get(),
        });
    }

    /// Verifies that no call frame or `CallAsTeam` scope outlived its dispatch. Unbalanced state
    /// is reported and reset.
    pub fn check_stack(&self) -> Option<ContextStack> {
        let lua = self.lua.as_ref()?;
        let memory_bytes = lua.used_memory();
        let mut env = lua.app_data_mut::<ContextEnv>()?;
        let balanced = env.call_depth == 0 && env.team_overrides.is_empty();
        let report = ContextStack {
            context: self.kind,
            call_depth: env.call_depth,
            team_overrides: env.team_overrides.len(),
            memory_bytes,
            balanced,
        };
        if !balanced {
            error!(
                "[Lockstep scripts] {} ({}) stack unbalanced after dispatch: depth {}, {} team override(s)",
                self.identity.name,
                self.kind.label(),
                env.call_depth,
                env.team_overrides.len()
            );
            env.call_depth = 0;
            env.call_permissions = None;
            env.team_overrides.clear();
        }
        Some(report)
    }

    /// Closes the state. `Shutdown` runs first unless the handle is being freed from inside its
    /// own dispatch.
    pub fn kill(&mut self, in_free_handler: bool) {
        if self.lua.is_none() {
            return;
        }
        if !in_free_handler {
            let _ = self.call_in::<_, ()>(CallIn::Shutdown, ());
        }
        self.lua = None;
    }
}

fn enter_call(lua: &Lua) -> mlua::Result<bool> {
    let mut env = context_env_mut(lua)?;
    env.call_depth += 1;
    let outermost = env.call_depth == 1;
    if outermost {
        env.call_permissions = Some(env.gate.snapshot());
    }
    Ok(outermost)
}

fn leave_call(lua: &Lua) {
    if let Some(mut env) = lua.app_data_mut::<ContextEnv>() {
        env.call_depth = env.call_depth.saturating_sub(1);
        if env.call_depth == 0 {
            env.call_permissions = None;
        }
    }
}

fn context_env_mut(lua: &Lua) -> mlua::Result<mlua::AppDataRefMut<'_, ContextEnv>> {
    lua.app_data_mut::<ContextEnv>()
        .ok_or_else(|| mlua::Error::RuntimeError("script context is not attached".to_string()))
}

pub(crate) fn context_env(lua: &Lua) -> mlua::Result<mlua::AppDataRef<'_, ContextEnv>> {
    lua.app_data_ref::<ContextEnv>()
        .ok_or_else(|| mlua::Error::RuntimeError("script context is not attached".to_string()))
}

/// Permissions as seen by call-outs: the snapshot taken when the current call-in started (the
/// live gate outside of one), narrowed by any active `CallAsTeam` scopes.
pub(crate) fn effective_permissions(lua: &Lua) -> mlua::Result<Permissions> {
    let env = context_env(lua)?;
    let base = env.call_permissions.unwrap_or_else(|| env.gate.snapshot());
    Ok(env
        .team_overrides
        .iter()
        .fold(base, |perms, scope| perms.with_team_override(scope)))
}

pub(crate) fn script_table(lua: &Lua) -> mlua::Result<Table> {
    lua.globals().get::<Table>("Script")
}

fn parse_team_override(value: &Value) -> mlua::Result<TeamOverride> {
    match value {
        Value::Integer(team) => Ok(TeamOverride::single_team(*team as i32)),
        Value::Number(team) => Ok(TeamOverride::single_team(*team as i32)),
        Value::Table(spec) => Ok(TeamOverride {
            ctrl: spec.get::<Option<i32>>("ctrl")?,
            read: spec.get::<Option<i32>>("read")?,
            read_ally: spec.get::<Option<i32>>("readAlly")?,
            select: spec.get::<Option<i32>>("select")?,
        }),
        other => Err(mlua::Error::RuntimeError(format!(
            "CallAsTeam: expected a team id or a table, got {}",
            other.type_name()
        ))),
    }
}

fn value_to_log_text(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

fn install_common_callouts(lua: &Lua, kind: ContextKind, handle: &str) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["dofile", "loadfile"] {
        globals.set(name, Value::Nil)?;
    }
    if kind == ContextKind::Deterministic {
        // Compiled traces may round differently per CPU and skip count hooks.
        lua.load("jit.off() jit = nil")
            .set_name("synced_environment")
            .exec()?;
        for name in ["collectgarbage", "gcinfo"] {
            globals.set(name, Value::Nil)?;
        }
    } else {
        // Presentation keeps the wall clock only.
        let os = globals.get::<Table>("os")?;
        for name in ["exit", "execute", "remove", "rename", "getenv", "tmpname"] {
            os.set(name, Value::Nil)?;
        }
    }

    let prefix = format!("{handle}/{}", kind.label());
    globals.set(
        "print",
        lua.create_function(move |_, args: MultiValue| {
            let text = args
                .iter()
                .map(value_to_log_text)
                .collect::<Vec<_>>()
                .join("\t");
            info!("[Lockstep scripts] {prefix}: {text}");
            Ok(())
        })?,
    )?;

    let script = lua.create_table()?;

    script.set(
        "GetPermissions",
        lua.create_function(|lua, ()| lua.to_value(&effective_permissions(lua)?))?,
    )?;

    script.set(
        "CallAsTeam",
        lua.create_function(|lua, (team, func, args): (Value, Function, MultiValue)| {
            let scope = parse_team_override(&team)?;
            context_env_mut(lua)?.team_overrides.push(scope);
            let result = func.call::<MultiValue>(args);
            if let Some(mut env) = lua.app_data_mut::<ContextEnv>() {
                env.team_overrides.pop();
            }
            result
        })?,
    )?;

    script.set(
        "GetGameParam",
        lua.create_function(|lua, key: String| Ok(context_env(lua)?.session.game_param(&key)))?,
    )?;

    script.set(
        "GetGameParams",
        lua.create_function(|lua, ()| {
            let params = context_env(lua)?.session.game_params();
            lua.create_table_from(params)
        })?,
    )?;

    script.set(
        "LoadStringData",
        lua.create_function(|lua, code: String| {
            match lua
                .load(code)
                .set_name("LoadStringData")
                .set_mode(ChunkMode::Text)
                .into_function()
            {
                Ok(func) => Ok((Some(func), None)),
                Err(err) => Ok((None, Some(err.to_string()))),
            }
        })?,
    )?;

    globals.set("Script", script)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Permission;

    fn context(kind: ContextKind, gate: CapabilityGate) -> LuaContext {
        LuaContext::new(
            kind,
            HandleIdentity {
                name: "test".into(),
                order: 0,
            },
            ScriptLimits {
                synced_instruction_budget: 200_000,
                unsynced_budget_ms: 1_000,
                instruction_interval: 1_000,
                bridge_capacity: 64,
            },
            gate,
            Session::new(1),
            SharedErrors::default(),
        )
        .expect("context")
    }

    #[test]
    fn missing_and_failing_callins_are_distinguished() {
        let ctx = context(ContextKind::Deterministic, CapabilityGate::default());
        ctx.exec_chunk("t", "function AllowUnitCloak() error('nope') end")
            .expect("load");
        assert!(ctx
            .call_in::<_, Option<bool>>(CallIn::AllowUnitTransport, ())
            .allowed());
        assert!(!ctx
            .call_in::<_, Option<bool>>(CallIn::AllowUnitCloak, (1, 2))
            .allowed());
        let errors = ctx.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.last().map(|e| e.call_in.as_str()), Some("AllowUnitCloak"));
    }

    #[test]
    fn callins_of_the_other_context_are_never_run() {
        let ctx = context(ContextKind::Presentation, CapabilityGate::default());
        ctx.exec_chunk("t", "function AllowUnitCloak() return false end")
            .expect("load");
        assert!(matches!(
            ctx.call_in::<_, Option<bool>>(CallIn::AllowUnitCloak, (1, 2)),
            CallOutcome::Missing
        ));
    }

    #[test]
    fn runaway_synced_script_hits_instruction_budget() {
        let ctx = context(ContextKind::Deterministic, CapabilityGate::default());
        ctx.exec_chunk("t", "function GameFrame() while true do end end")
            .expect("load");
        assert!(matches!(
            ctx.call_in::<_, ()>(CallIn::GameFrame, 1),
            CallOutcome::Failed
        ));
        let report = ctx.check_stack().expect("report");
        assert!(report.balanced);
    }

    #[test]
    fn permissions_are_frozen_for_the_duration_of_a_callin() {
        let gate = CapabilityGate::default();
        let ctx = context(ContextKind::Deterministic, gate.clone());
        let writer = gate.clone();
        let lua = ctx.lua().expect("lua").clone();
        lua.globals()
            .set(
                "ChangeTeam",
                lua.create_function(move |_, team: i32| {
                    writer.set(Permission::CtrlTeam(team));
                    Ok(())
                })
                .expect("fn"),
            )
            .expect("set");
        ctx.exec_chunk(
            "t",
            r#"
            function AllowUnitTransfer()
                local before = Script.GetPermissions().controlTeam
                ChangeTeam(5)
                return Script.GetPermissions().controlTeam == before
            end
        "#,
        )
        .expect("load");
        gate.set(Permission::CtrlTeam(1));
        let unchanged = ctx
            .call_in::<_, Option<bool>>(CallIn::AllowUnitTransfer, ())
            .allowed();
        assert!(unchanged);
        assert_eq!(gate.snapshot().control_team, 5);
    }

    #[test]
    fn call_as_team_scopes_and_restores() {
        let gate = CapabilityGate::default();
        gate.set(Permission::CtrlTeam(0));
        let ctx = context(ContextKind::Presentation, gate);
        let lua = ctx.lua().expect("lua");
        let (inside, after): (i32, i32) = lua
            .load(
                r#"
                local inside = Script.CallAsTeam({ ctrl = 3 }, function()
                    return Script.GetPermissions().controlTeam
                end)
                pcall(Script.CallAsTeam, 4, function() error("fail inside") end)
                return inside, Script.GetPermissions().controlTeam
            "#,
            )
            .eval()
            .expect("eval");
        assert_eq!(inside, 3);
        assert_eq!(after, 0);
        assert!(ctx.check_stack().expect("report").balanced);
    }

    #[test]
    fn load_string_data_rejects_bad_code() {
        let ctx = context(ContextKind::Presentation, CapabilityGate::default());
        let lua = ctx.lua().expect("lua");
        let (ok, failed): (i32, bool) = lua
            .load(
                r#"
                local f = Script.LoadStringData("return 40 + 2")
                local g, err = Script.LoadStringData("return +")
                return f(), g == nil and type(err) == "string"
            "#,
            )
            .eval()
            .expect("eval");
        assert_eq!(ok, 42);
        assert!(failed);
    }

    #[test]
    fn deterministic_state_has_no_filesystem_or_gc_access() {
        let ctx = context(ContextKind::Deterministic, CapabilityGate::default());
        let lua = ctx.lua().expect("lua");
        let absent: bool = lua
            .load("return dofile == nil and loadfile == nil and collectgarbage == nil and os == nil and io == nil and jit == nil")
            .eval()
            .expect("eval");
        assert!(absent);
    }
}
