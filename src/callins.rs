use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Deterministic,
    Presentation,
}

impl ContextKind {
    pub fn label(self) -> &'static str {
        match self {
            ContextKind::Deterministic => "synced",
            ContextKind::Presentation => "unsynced",
        }
    }
}

/// Every entry point the engine may invoke into a script handle. `supported_by` is the routing
/// table: a call-in is only ever dispatched into the contexts that support it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallIn {
    Initialize,
    Shutdown,
    GameFrame,
    CommandFallback,
    AllowCommand,
    AllowUnitCreation,
    AllowUnitTransfer,
    AllowUnitBuildStep,
    AllowUnitTransport,
    AllowUnitCloak,
    AllowUnitDecloak,
    AllowFeatureCreation,
    AllowFeatureBuildStep,
    AllowResourceLevel,
    AllowResourceTransfer,
    AllowDirectUnitControl,
    AllowBuilderHoldFire,
    AllowStartPosition,
    TerraformComplete,
    MoveCtrlNotify,
    AllowWeaponTargetCheck,
    AllowWeaponTarget,
    AllowWeaponInterceptTarget,
    UnitPreDamaged,
    FeaturePreDamaged,
    ShieldPreDamaged,
    SyncedActionFallback,
    GotChatMsg,
    RecvLuaMsg,
    DrawUnit,
    DrawFeature,
    DrawShield,
    DrawProjectile,
    RecvFromSynced,
}

impl CallIn {
    pub fn name(self) -> &'static str {
        match self {
            CallIn::Initialize => "Initialize",
            CallIn::Shutdown => "Shutdown",
            CallIn::GameFrame => "GameFrame",
            CallIn::CommandFallback => "CommandFallback",
            CallIn::AllowCommand => "AllowCommand",
            CallIn::AllowUnitCreation => "AllowUnitCreation",
            CallIn::AllowUnitTransfer => "AllowUnitTransfer",
            CallIn::AllowUnitBuildStep => "AllowUnitBuildStep",
            CallIn::AllowUnitTransport => "AllowUnitTransport",
            CallIn::AllowUnitCloak => "AllowUnitCloak",
            CallIn::AllowUnitDecloak => "AllowUnitDecloak",
            CallIn::AllowFeatureCreation => "AllowFeatureCreation",
            CallIn::AllowFeatureBuildStep => "AllowFeatureBuildStep",
            CallIn::AllowResourceLevel => "AllowResourceLevel",
            CallIn::AllowResourceTransfer => "AllowResourceTransfer",
            CallIn::AllowDirectUnitControl => "AllowDirectUnitControl",
            CallIn::AllowBuilderHoldFire => "AllowBuilderHoldFire",
            CallIn::AllowStartPosition => "AllowStartPosition",
            CallIn::TerraformComplete => "TerraformComplete",
            CallIn::MoveCtrlNotify => "MoveCtrlNotify",
            CallIn::AllowWeaponTargetCheck => "AllowWeaponTargetCheck",
            CallIn::AllowWeaponTarget => "AllowWeaponTarget",
            CallIn::AllowWeaponInterceptTarget => "AllowWeaponInterceptTarget",
            CallIn::UnitPreDamaged => "UnitPreDamaged",
            CallIn::FeaturePreDamaged => "FeaturePreDamaged",
            CallIn::ShieldPreDamaged => "ShieldPreDamaged",
            CallIn::SyncedActionFallback => "SyncedActionFallback",
            CallIn::GotChatMsg => "GotChatMsg",
            CallIn::RecvLuaMsg => "RecvLuaMsg",
            CallIn::DrawUnit => "DrawUnit",
            CallIn::DrawFeature => "DrawFeature",
            CallIn::DrawShield => "DrawShield",
            CallIn::DrawProjectile => "DrawProjectile",
            CallIn::RecvFromSynced => "RecvFromSynced",
        }
    }

    pub fn supported_by(self, kind: ContextKind) -> bool {
        match self {
            CallIn::Initialize | CallIn::Shutdown | CallIn::GotChatMsg | CallIn::RecvLuaMsg => true,
            CallIn::DrawUnit
            | CallIn::DrawFeature
            | CallIn::DrawShield
            | CallIn::DrawProjectile
            | CallIn::RecvFromSynced => kind == ContextKind::Presentation,
            _ => kind == ContextKind::Deterministic,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct Float3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitRef {
    pub id: u32,
    pub def_id: i32,
    pub team: i32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureRef {
    pub id: u32,
    pub def_id: i32,
    pub ally_team: i32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeaponRef {
    pub num: u32,
    pub def_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectileRef {
    pub id: u32,
    pub owner_id: Option<u32>,
    pub weapon_def_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BuildInfo {
    pub pos: Float3,
    pub facing: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Command {
    pub id: i32,
    pub params: Vec<f32>,
    pub options: u8,
    pub tag: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct UnitDamage {
    pub unit: UnitRef,
    pub attacker: Option<UnitRef>,
    pub damage: f32,
    pub weapon_def_id: i32,
    pub projectile_id: i32,
    pub paralyzer: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FeatureDamage {
    pub feature: FeatureRef,
    pub attacker: Option<UnitRef>,
    pub damage: f32,
    pub weapon_def_id: i32,
    pub projectile_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ShieldHit {
    pub projectile: Option<ProjectileRef>,
    pub shield_emitter: WeaponRef,
    pub shield_carrier: UnitRef,
    pub bounce_projectile: bool,
    pub beam_emitter: Option<WeaponRef>,
    pub beam_carrier: Option<UnitRef>,
    pub start_pos: Float3,
    pub hit_pos: Float3,
}

/// Result of a pre-damage call-in. `handled` means the hit was absorbed entirely (both outputs
/// rewritten to zero).
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct PreDamaged {
    pub handled: bool,
    pub new_damage: f32,
    pub impulse_mult: f32,
}

impl PreDamaged {
    pub fn unchanged(damage: f32) -> Self {
        Self {
            handled: false,
            new_damage: damage,
            impulse_mult: 1.0,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct WeaponTarget {
    pub allowed: bool,
    pub priority: f32,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandFallbackResult {
    /// Whether the script consumed the command.
    pub used: bool,
    /// Whether the command should be removed from the unit's queue.
    pub remove: bool,
}

/// Sentinel returned by `AllowWeaponTargetCheck` when the script has no opinion.
pub const TARGET_CHECK_NO_OPINION: i32 = -1;
