use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

pub const NO_ACCESS_TEAM: i32 = -1;
pub const ALL_ACCESS_TEAM: i32 = -2;

/// Field names match what `Script.GetPermissions()` hands to scripts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub global_control: bool,
    pub global_read: bool,
    pub control_team: i32,
    pub read_team: i32,
    pub read_ally_team: i32,
    pub select_team: i32,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            global_control: false,
            global_read: false,
            control_team: NO_ACCESS_TEAM,
            read_team: NO_ACCESS_TEAM,
            read_ally_team: NO_ACCESS_TEAM,
            select_team: NO_ACCESS_TEAM,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    FullCtrl(bool),
    FullRead(bool),
    CtrlTeam(i32),
    ReadTeam(i32),
    ReadAllyTeam(i32),
    SelectTeam(i32),
}

impl Permissions {
    pub fn apply(&mut self, permission: Permission) {
        match permission {
            Permission::FullCtrl(value) => self.global_control = value,
            Permission::FullRead(value) => self.global_read = value,
            Permission::CtrlTeam(team) => self.control_team = team,
            Permission::ReadTeam(team) => self.read_team = team,
            Permission::ReadAllyTeam(team) => self.read_ally_team = team,
            Permission::SelectTeam(team) => self.select_team = team,
        }
    }

    pub fn with_team_override(mut self, team: &TeamOverride) -> Self {
        if let Some(ctrl) = team.ctrl {
            self.control_team = ctrl;
        }
        if let Some(read) = team.read {
            self.read_team = read;
        }
        if let Some(read_ally) = team.read_ally {
            self.read_ally_team = read_ally;
        }
        if let Some(select) = team.select {
            self.select_team = select;
        }
        self
    }
}

/// Scoped team permissions pushed by `Script.CallAsTeam`. Unset fields keep the gate's value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeamOverride {
    pub ctrl: Option<i32>,
    pub read: Option<i32>,
    pub read_ally: Option<i32>,
    pub select: Option<i32>,
}

impl TeamOverride {
    pub fn single_team(team: i32) -> Self {
        Self {
            ctrl: Some(team),
            read: Some(team),
            read_ally: None,
            select: Some(team),
        }
    }
}

/// The permission set shared by both contexts of a handle. There is exactly one cell, so a
/// reader in either context can never see a half-applied change.
#[derive(Clone, Default)]
pub struct CapabilityGate {
    inner: Arc<RwLock<Permissions>>,
}

impl CapabilityGate {
    pub fn set(&self, permission: Permission) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.apply(permission);
    }

    pub fn snapshot(&self) -> Permissions {
        *self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn shares_state_with(&self, other: &CapabilityGate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
