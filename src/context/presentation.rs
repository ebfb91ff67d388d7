use mlua::Lua;

use super::{ContextStack, HandleIdentity, LuaContext, ScriptContext, SharedErrors};
use crate::bridge::{decode_payload, BridgeMessage};
use crate::callins::{CallIn, ContextKind};
use crate::config::ScriptLimits;
use crate::errors::LoadError;
use crate::permissions::CapabilityGate;
use crate::session::Session;

/// Per-peer script state. Nothing it does feeds back into the simulation; its only input from
/// the deterministic side is the bridge.
pub struct PresentationContext {
    base: LuaContext,
}

impl PresentationContext {
    pub(crate) fn new(
        identity: HandleIdentity,
        limits: ScriptLimits,
        gate: CapabilityGate,
        session: Session,
        errors: SharedErrors,
    ) -> Result<Self, LoadError> {
        let base = LuaContext::new(
            ContextKind::Presentation,
            identity,
            limits,
            gate,
            session,
            errors,
        )?;
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
    }

    /// Returns true when the script drew the unit itself and the engine should skip it.
    pub fn draw_unit(&self, unit_id: u32, draw_mode: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::DrawUnit, (unit_id, draw_mode))
            .claimed()
    }

    pub fn draw_feature(&self, feature_id: u32, draw_mode: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::DrawFeature, (feature_id, draw_mode))
            .claimed()
    }

    pub fn draw_shield(&self, unit_id: u32, weapon_num: u32, draw_mode: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::DrawShield, (unit_id, weapon_num, draw_mode))
            .claimed()
    }

    pub fn draw_projectile(&self, projectile_id: u32, draw_mode: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::DrawProjectile, (projectile_id, draw_mode))
            .claimed()
    }

    /// Delivers one bridge message as `RecvFromSynced(...)`. Without a handler the message is
    /// discarded.
    pub fn recv_from_synced(&self, message: &BridgeMessage) {
        let Some(lua) = self.base.lua() else {
            return;
        };
        let args = match decode_payload(lua, &message.payload) {
            Ok(args) => args,
            Err(err) => {
                self.base.record_error(CallIn::RecvFromSynced.name(), &err);
                return;
            }
        };
        let _ = self.base.call_in::<_, ()>(CallIn::RecvFromSynced, args);
    }

    pub fn got_chat_msg(&self, msg: &str, player_id: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::GotChatMsg, (msg, player_id))
            .claimed()
    }

    pub fn recv_lua_msg(&self, msg: &str, player_id: i32) -> bool {
        self.base
            .call_in::<_, Option<bool>>(CallIn::RecvLuaMsg, (msg, player_id))
            .claimed()
    }
}

impl ScriptContext for PresentationContext {
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
