use crate::bridge::BridgeStats;
use crate::callins::{FeatureDamage, PreDamaged, ShieldHit, UnitDamage, TARGET_CHECK_NO_OPINION};
use crate::coordinator::Coordinator;

/// Every script handle loaded into the engine, in dispatch order: ascending `order`, ties kept
/// in insertion order.
#[derive(Default)]
pub struct ScriptHandles {
    handles: Vec<Coordinator>,
}

impl ScriptHandles {
    pub fn insert(&mut self, coordinator: Coordinator) {
        let index = self
            .handles
            .partition_point(|handle| handle.order() <= coordinator.order());
        self.handles.insert(index, coordinator);
    }

    pub fn get(&self, name: &str) -> Option<&Coordinator> {
        self.handles.iter().find(|handle| handle.name() == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Coordinator> {
        let index = self.handles.iter().position(|handle| handle.name() == name)?;
        Some(self.handles.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coordinator> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Authorization across handles: the first deny wins.
    pub fn allow_all(&self, mut ask: impl FnMut(&Coordinator) -> bool) -> bool {
        self.handles.iter().all(|handle| ask(handle))
    }

    /// Stops at the first handle that reports the call-in handled.
    pub fn first_handled(&self, mut ask: impl FnMut(&Coordinator) -> bool) -> bool {
        self.handles.iter().any(|handle| ask(handle))
    }

    pub fn got_chat_msg(&self, msg: &str, player_id: i32) -> bool {
        self.first_handled(|handle| handle.got_chat_msg(msg, player_id))
    }

    pub fn recv_lua_msg(&self, msg: &str, player_id: i32) -> bool {
        self.first_handled(|handle| handle.recv_lua_msg(msg, player_id))
    }

    pub fn synced_action_fallback(&self, line: &str, player_id: i32) -> bool {
        self.first_handled(|handle| handle.synced_action_fallback(line, player_id))
    }

    pub fn draw_unit(&self, unit_id: u32, draw_mode: i32) -> bool {
        self.first_handled(|handle| handle.draw_unit(unit_id, draw_mode))
    }

    pub fn draw_feature(&self, feature_id: u32, draw_mode: i32) -> bool {
        self.first_handled(|handle| handle.draw_feature(feature_id, draw_mode))
    }

    pub fn draw_shield(&self, unit_id: u32, weapon_num: u32, draw_mode: i32) -> bool {
        self.first_handled(|handle| handle.draw_shield(unit_id, weapon_num, draw_mode))
    }

    pub fn draw_projectile(&self, projectile_id: u32, draw_mode: i32) -> bool {
        self.first_handled(|handle| handle.draw_projectile(projectile_id, draw_mode))
    }

    pub fn shield_pre_damaged(&self, hit: &ShieldHit) -> bool {
        self.first_handled(|handle| handle.shield_pre_damaged(hit))
    }

    /// The first handle with an opinion decides.
    pub fn allow_weapon_target_check(
        &self,
        attacker_id: u32,
        weapon_num: u32,
        weapon_def_id: i32,
    ) -> i32 {
        self.handles
            .iter()
            .map(|handle| handle.allow_weapon_target_check(attacker_id, weapon_num, weapon_def_id))
            .find(|&decision| decision != TARGET_CHECK_NO_OPINION)
            .unwrap_or(TARGET_CHECK_NO_OPINION)
    }

    /// Each handle sees the damage as adjusted by the handles before it; impulse multipliers
    /// compound. A handle that fully handles the hit ends the chain.
    pub fn unit_pre_damaged(&self, hit: &UnitDamage) -> PreDamaged {
        let mut current = *hit;
        chain_pre_damage(&self.handles, hit.damage, |handle, damage| {
            current.damage = damage;
            handle.unit_pre_damaged(&current)
        })
    }

    pub fn feature_pre_damaged(&self, hit: &FeatureDamage) -> PreDamaged {
        let mut current = *hit;
        chain_pre_damage(&self.handles, hit.damage, |handle, damage| {
            current.damage = damage;
            handle.feature_pre_damaged(&current)
        })
    }

    pub fn game_frame(&mut self, frame: u64) {
        for handle in &mut self.handles {
            handle.game_frame(frame);
        }
    }

    pub fn drain_bridges(&self) -> usize {
        self.handles.iter().map(Coordinator::drain_bridge).sum()
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.handles
            .iter()
            .map(Coordinator::bridge_stats)
            .fold(BridgeStats::default(), |total, stats| BridgeStats {
                sent: total.sent + stats.sent,
                dropped: total.dropped + stats.dropped,
                delivered: total.delivered + stats.delivered,
                pending: total.pending + stats.pending,
            })
    }

    pub fn error_count(&self) -> u64 {
        self.handles.iter().map(|handle| handle.errors().total).sum()
    }

    /// Closes every handle, highest order first.
    pub fn kill_all(&mut self, in_free_handler: bool) {
        for handle in self.handles.iter_mut().rev() {
            handle.kill_lua(in_free_handler);
        }
    }
}

fn chain_pre_damage(
    handles: &[Coordinator],
    damage: f32,
    mut ask: impl FnMut(&Coordinator, f32) -> PreDamaged,
) -> PreDamaged {
    let mut result = PreDamaged::unchanged(damage);
    for handle in handles {
        let step = ask(handle, result.new_damage);
        result = PreDamaged {
            handled: step.handled,
            new_damage: step.new_damage,
            impulse_mult: result.impulse_mult * step.impulse_mult,
        };
        if step.handled {
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callins::UnitRef;
    use crate::config::{HandleConfig, MessageRouting, ScriptLimits};
    use crate::session::Session;

    fn handle(name: &str, order: i32, session: &Session, synced: &str, unsynced: &str) -> Coordinator {
        let mut coordinator = Coordinator::new(name, order, session.clone()).with_config(HandleConfig {
            limits: ScriptLimits {
                synced_instruction_budget: 1_000_000,
                unsynced_budget_ms: 1_000,
                instruction_interval: 1_000,
                bridge_capacity: 64,
            },
            chat_routing: MessageRouting::ShortCircuit,
            lua_msg_routing: MessageRouting::Broadcast,
        });
        coordinator.init_sources(synced, unsynced).expect("load");
        coordinator
    }

    fn hit(damage: f32) -> UnitDamage {
        UnitDamage {
            unit: UnitRef {
                id: 1,
                def_id: 2,
                team: 0,
            },
            attacker: None,
            damage,
            weapon_def_id: 0,
            projectile_id: -1,
            paralyzer: false,
        }
    }

    #[test]
    fn handles_dispatch_in_ascending_order_with_stable_ties() {
        let session = Session::new(1);
        let mut handles = ScriptHandles::default();
        handles.insert(handle("widgets", 200, &session, "", ""));
        handles.insert(handle("rules", 0, &session, "", ""));
        handles.insert(handle("gaia", 200, &session, "", ""));
        handles.insert(handle("gadgets", 100, &session, "", ""));
        let names: Vec<&str> = handles.iter().map(Coordinator::name).collect();
        assert_eq!(names, vec!["rules", "gadgets", "widgets", "gaia"]);
        assert!(handles.remove("gadgets").is_some());
        assert_eq!(handles.len(), 3);
    }

    #[test]
    fn handled_chat_short_circuits_later_handles() {
        let session = Session::new(1);
        let mut handles = ScriptHandles::default();
        handles.insert(handle(
            "rules",
            0,
            &session,
            r#"function GotChatMsg(msg) Script.SetGameParam("rules_saw", msg) return msg == "/rules" end"#,
            "",
        ));
        handles.insert(handle(
            "widgets",
            10,
            &session,
            "",
            r#"seen = 0 function GotChatMsg() seen = seen + 1 return true end"#,
        ));
        assert!(handles.got_chat_msg("/rules", 0));
        assert!(handles.got_chat_msg("hello", 0));
        let seen: i32 = handles
            .get("widgets")
            .and_then(Coordinator::unsynced_context)
            .and_then(|ctx| crate::context::ScriptContext::lua(ctx))
            .expect("widgets state")
            .globals()
            .get("seen")
            .expect("seen");
        assert_eq!(seen, 1);
        assert_eq!(session.game_param("rules_saw").as_deref(), Some("hello"));
    }

    #[test]
    fn pre_damage_is_chained_through_handles() {
        let session = Session::new(1);
        let mut handles = ScriptHandles::default();
        handles.insert(handle(
            "armor",
            0,
            &session,
            "function UnitPreDamaged(u, d, t, damage) return damage / 2, 2 end",
            "",
        ));
        handles.insert(handle(
            "shields",
            1,
            &session,
            "function UnitPreDamaged(u, d, t, damage) if damage < 30 then return 0, 0 end return damage - 10, 1.5 end",
            "",
        ));
        let result = handles.unit_pre_damaged(&hit(100.0));
        assert_eq!(result.new_damage, 40.0);
        assert_eq!(result.impulse_mult, 3.0);
        assert!(!result.handled);

        let absorbed = handles.unit_pre_damaged(&hit(40.0));
        assert!(absorbed.handled);
        assert_eq!(absorbed.new_damage, 0.0);
    }

    #[test]
    fn first_deny_wins() {
        let session = Session::new(1);
        let mut handles = ScriptHandles::default();
        handles.insert(handle("open", 0, &session, "", ""));
        handles.insert(handle(
            "strict",
            1,
            &session,
            "function AllowUnitTransfer(u, d, old, new, capture) return not capture end",
            "",
        ));
        let unit = UnitRef {
            id: 4,
            def_id: 1,
            team: 0,
        };
        assert!(handles.allow_all(|h| h.allow_unit_transfer(&unit, 1, false)));
        assert!(!handles.allow_all(|h| h.allow_unit_transfer(&unit, 1, true)));
    }

    #[test]
    fn kill_all_closes_handles_in_reverse_order() {
        let session = Session::new(1);
        let mut handles = ScriptHandles::default();
        for (name, order) in [("first", 0), ("second", 1)] {
            handles.insert(handle(
                name,
                order,
                &session,
                &format!(
                    r#"function Shutdown()
                        local prior = Script.GetGameParam("closed")
                        Script.SetGameParam("closed", prior and (prior .. ",{name}") or "{name}")
                    end"#
                ),
                "",
            ));
        }
        handles.kill_all(false);
        assert_eq!(session.game_param("closed").as_deref(), Some("second,first"));
        assert!(handles.iter().all(|h| !h.is_valid()));
    }
}
