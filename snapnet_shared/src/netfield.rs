//! NetField tables.
//!
//! A table is an ordered list of `(field, bits, kind)` descriptors. The delta
//! codec walks it in order and truncates after the last changed field, so the
//! order is part of the wire format: reordering a table breaks compatibility.
//! Fields that change every frame come first.
//!
//! Fields are addressed through typed accessor enums ([`EntityField`],
//! [`PlayerField`]) instead of byte offsets. Every accessor moves a raw `u32`:
//! float fields carry their IEEE bits, integer fields their two's-complement
//! bits. Which one a field holds is implied by its [`FieldKind`].

use std::fmt;
use std::sync::OnceLock;

use crate::state::{
    CameraFlags as CameraFlagBits, EntityFlags, EntityState, PlayerState, PmFlags as PmFlagBits,
    GENTITYNUM_BITS, MAX_FRAMEINFOS,
    NUM_BONE_CONTROLLERS, NUM_SURFACE_BYTES,
};

/// Quantization applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer of `|bits|` bits, or a float when `bits == 0`, with a zero test.
    Regular,
    /// Angle in degrees packed into `|bits|` bits.
    Angle,
    /// Animation time, scale depends on the protocol.
    AnimTime,
    /// Animation weight in `0..=1`.
    AnimWeight,
    /// Model scale in `0..=16`.
    Scale,
    /// Alpha in `0..=1`.
    Alpha,
    /// World coordinate, 1/16 unit.
    Coord,
    /// World coordinate with the extended range.
    CoordExtra,
    /// Reduced precision coordinate for velocities.
    Velocity,
    /// Exact integer, no zero test.
    Simple,
}

impl FieldKind {
    /// Whether the accessor carries float bits.
    pub fn is_float(self, bits: i32) -> bool {
        match self {
            FieldKind::Regular => bits == 0,
            FieldKind::Simple => false,
            _ => true,
        }
    }
}

/// One field descriptor.
#[derive(Debug, Clone, Copy)]
pub struct NetField<F> {
    pub field: F,
    pub bits: i32,
    pub kind: FieldKind,
}

impl<F> NetField<F> {
    pub const fn new(field: F, bits: i32, kind: FieldKind) -> Self {
        Self { field, bits, kind }
    }
}

/// Raw access to the fields of a replicated struct.
pub trait FieldAccess: Clone {
    type Field: Copy + fmt::Display;

    /// Name used in error messages.
    const TABLE: &'static str;

    fn get(&self, field: Self::Field) -> u32;
    fn set(&mut self, field: Self::Field, raw: u32);
}

fn float(v: f32) -> u32 {
    v.to_bits()
}

fn unfloat(raw: u32) -> f32 {
    f32::from_bits(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityField {
    EType,
    EFlags,
    TrType,
    TrTime,
    TrBase(usize),
    TrDelta(usize),
    Origin(usize),
    Angles(usize),
    BoneTag(usize),
    BoneAngle(usize, usize),
    FrameIndex(usize),
    FrameTime(usize),
    FrameWeight(usize),
    ActionWeight,
    Scale,
    Alpha,
    RenderFx,
    Surface(usize),
    Parent,
    TagNum,
    Solid,
    ModelIndex,
    SkinNum,
    LoopSound,
    GroundEntityNum,
    ClientNum,
}

impl fmt::Display for EntityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use EntityField::*;
        match self {
            EType => write!(f, "eType"),
            EFlags => write!(f, "eFlags"),
            TrType => write!(f, "pos.trType"),
            TrTime => write!(f, "pos.trTime"),
            TrBase(i) => write!(f, "pos.trBase[{i}]"),
            TrDelta(i) => write!(f, "pos.trDelta[{i}]"),
            Origin(i) => write!(f, "origin[{i}]"),
            Angles(i) => write!(f, "angles[{i}]"),
            BoneTag(i) => write!(f, "bone_tag[{i}]"),
            BoneAngle(b, i) => write!(f, "bone_angles[{b}][{i}]"),
            FrameIndex(i) => write!(f, "frameInfo[{i}].index"),
            FrameTime(i) => write!(f, "frameInfo[{i}].time"),
            FrameWeight(i) => write!(f, "frameInfo[{i}].weight"),
            ActionWeight => write!(f, "actionWeight"),
            Scale => write!(f, "scale"),
            Alpha => write!(f, "alpha"),
            RenderFx => write!(f, "renderfx"),
            Surface(i) => write!(f, "surfaces[{i}]"),
            Parent => write!(f, "parent"),
            TagNum => write!(f, "tag_num"),
            Solid => write!(f, "solid"),
            ModelIndex => write!(f, "modelindex"),
            SkinNum => write!(f, "skinNum"),
            LoopSound => write!(f, "loopSound"),
            GroundEntityNum => write!(f, "groundEntityNum"),
            ClientNum => write!(f, "clientNum"),
        }
    }
}

impl FieldAccess for EntityState {
    type Field = EntityField;
    const TABLE: &'static str = "entityState";

    fn get(&self, field: EntityField) -> u32 {
        use EntityField::*;
        match field {
            EType => self.e_type as u32,
            EFlags => self.e_flags.bits(),
            TrType => self.pos.tr_type as u32,
            TrTime => self.pos.tr_time as u32,
            TrBase(i) => float(self.pos.tr_base[i]),
            TrDelta(i) => float(self.pos.tr_delta[i]),
            Origin(i) => float(self.origin[i]),
            Angles(i) => float(self.angles[i]),
            BoneTag(i) => self.bone_tag[i] as i32 as u32,
            BoneAngle(b, i) => float(self.bone_angles[b][i]),
            FrameIndex(i) => self.frame_info[i].index as u32,
            FrameTime(i) => float(self.frame_info[i].time),
            FrameWeight(i) => float(self.frame_info[i].weight),
            ActionWeight => float(self.action_weight),
            Scale => float(self.scale),
            Alpha => float(self.alpha),
            RenderFx => self.renderfx as u32,
            Surface(i) => self.surfaces[i] as u32,
            Parent => self.parent as u32,
            TagNum => self.tag_num as u32,
            Solid => self.solid as u32,
            ModelIndex => self.modelindex as u32,
            SkinNum => self.skin_num as u32,
            LoopSound => self.loop_sound as u32,
            GroundEntityNum => self.ground_entity_num as u32,
            ClientNum => self.client_num as u32,
        }
    }

    fn set(&mut self, field: EntityField, raw: u32) {
        use EntityField::*;
        match field {
            EType => self.e_type = raw as u8,
            EFlags => self.e_flags = EntityFlags::from_bits_retain(raw),
            TrType => self.pos.tr_type = raw as u8,
            TrTime => self.pos.tr_time = raw as i32,
            TrBase(i) => self.pos.tr_base[i] = unfloat(raw),
            TrDelta(i) => self.pos.tr_delta[i] = unfloat(raw),
            Origin(i) => self.origin[i] = unfloat(raw),
            Angles(i) => self.angles[i] = unfloat(raw),
            BoneTag(i) => self.bone_tag[i] = raw as i32 as i8,
            BoneAngle(b, i) => self.bone_angles[b][i] = unfloat(raw),
            FrameIndex(i) => self.frame_info[i].index = raw as i32,
            FrameTime(i) => self.frame_info[i].time = unfloat(raw),
            FrameWeight(i) => self.frame_info[i].weight = unfloat(raw),
            ActionWeight => self.action_weight = unfloat(raw),
            Scale => self.scale = unfloat(raw),
            Alpha => self.alpha = unfloat(raw),
            RenderFx => self.renderfx = raw as i32,
            Surface(i) => self.surfaces[i] = raw as u8,
            Parent => self.parent = raw as u16,
            TagNum => self.tag_num = raw as u16,
            Solid => self.solid = raw as i32,
            ModelIndex => self.modelindex = raw as u16,
            SkinNum => self.skin_num = raw as u8,
            LoopSound => self.loop_sound = raw as u16,
            GroundEntityNum => self.ground_entity_num = raw as u16,
            ClientNum => self.client_num = raw as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerField {
    CommandTime,
    PmType,
    PmFlags,
    PmTime,
    BobCycle,
    Origin(usize),
    Velocity(usize),
    Gravity,
    Speed,
    DeltaAngles(usize),
    GroundEntityNum,
    EFlags,
    ViewAngles(usize),
    ViewHeight,
    LeanAngle,
    Fov,
    CameraAngles(usize),
    CameraOrigin(usize),
    CameraOffset(usize),
    CameraPosOfs(usize),
    CameraTime,
    CameraFlags,
    ClientNum,
}

impl fmt::Display for PlayerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PlayerField::*;
        match self {
            CommandTime => write!(f, "commandTime"),
            PmType => write!(f, "pm_type"),
            PmFlags => write!(f, "pm_flags"),
            PmTime => write!(f, "pm_time"),
            BobCycle => write!(f, "bobCycle"),
            Origin(i) => write!(f, "origin[{i}]"),
            Velocity(i) => write!(f, "velocity[{i}]"),
            Gravity => write!(f, "gravity"),
            Speed => write!(f, "speed"),
            DeltaAngles(i) => write!(f, "delta_angles[{i}]"),
            GroundEntityNum => write!(f, "groundEntityNum"),
            EFlags => write!(f, "eFlags"),
            ViewAngles(i) => write!(f, "viewangles[{i}]"),
            ViewHeight => write!(f, "viewheight"),
            LeanAngle => write!(f, "fLeanAngle"),
            Fov => write!(f, "fov"),
            CameraAngles(i) => write!(f, "camera_angles[{i}]"),
            CameraOrigin(i) => write!(f, "camera_origin[{i}]"),
            CameraOffset(i) => write!(f, "camera_offset[{i}]"),
            CameraPosOfs(i) => write!(f, "camera_posofs[{i}]"),
            CameraTime => write!(f, "camera_time"),
            CameraFlags => write!(f, "camera_flags"),
            ClientNum => write!(f, "clientNum"),
        }
    }
}

impl FieldAccess for PlayerState {
    type Field = PlayerField;
    const TABLE: &'static str = "playerState";

    fn get(&self, field: PlayerField) -> u32 {
        use PlayerField::*;
        match field {
            CommandTime => self.command_time as u32,
            PmType => self.pm_type as u32,
            PmFlags => self.pm_flags.bits(),
            PmTime => self.pm_time as i32 as u32,
            BobCycle => self.bob_cycle as u32,
            Origin(i) => float(self.origin[i]),
            Velocity(i) => float(self.velocity[i]),
            Gravity => self.gravity as i32 as u32,
            Speed => self.speed as i32 as u32,
            DeltaAngles(i) => self.delta_angles[i] as i32 as u32,
            GroundEntityNum => self.ground_entity_num as u32,
            EFlags => self.e_flags.bits(),
            ViewAngles(i) => float(self.viewangles[i]),
            ViewHeight => self.viewheight as i32 as u32,
            LeanAngle => float(self.lean_angle),
            Fov => float(self.fov),
            CameraAngles(i) => float(self.camera_angles[i]),
            CameraOrigin(i) => float(self.camera_origin[i]),
            CameraOffset(i) => float(self.camera_offset[i]),
            CameraPosOfs(i) => float(self.camera_posofs[i]),
            CameraTime => float(self.camera_time),
            CameraFlags => self.camera_flags.bits(),
            ClientNum => self.client_num as u32,
        }
    }

    fn set(&mut self, field: PlayerField, raw: u32) {
        use PlayerField::*;
        match field {
            CommandTime => self.command_time = raw as i32,
            PmType => self.pm_type = raw as u8,
            PmFlags => self.pm_flags = PmFlagBits::from_bits_retain(raw),
            PmTime => self.pm_time = raw as i32 as i16,
            BobCycle => self.bob_cycle = raw as u8,
            Origin(i) => self.origin[i] = unfloat(raw),
            Velocity(i) => self.velocity[i] = unfloat(raw),
            Gravity => self.gravity = raw as i32 as i16,
            Speed => self.speed = raw as i32 as i16,
            DeltaAngles(i) => self.delta_angles[i] = raw as i32 as i16,
            GroundEntityNum => self.ground_entity_num = raw as u16,
            EFlags => self.e_flags = EntityFlags::from_bits_retain(raw),
            ViewAngles(i) => self.viewangles[i] = unfloat(raw),
            ViewHeight => self.viewheight = raw as i32 as i8,
            LeanAngle => self.lean_angle = unfloat(raw),
            Fov => self.fov = unfloat(raw),
            CameraAngles(i) => self.camera_angles[i] = unfloat(raw),
            CameraOrigin(i) => self.camera_origin[i] = unfloat(raw),
            CameraOffset(i) => self.camera_offset[i] = unfloat(raw),
            CameraPosOfs(i) => self.camera_posofs[i] = unfloat(raw),
            CameraTime => self.camera_time = unfloat(raw),
            CameraFlags => self.camera_flags = CameraFlagBits::from_bits_retain(raw),
            ClientNum => self.client_num = raw as u8,
        }
    }
}

const ENT_BITS: i32 = GENTITYNUM_BITS as i32;

/// Entity layout shared by both protocol families; they differ in the
/// coordinate kind and bone angle width.
fn entity_table(coord: FieldKind, bone_angle_bits: i32) -> Vec<NetField<EntityField>> {
    use EntityField::*;
    use FieldKind as K;

    let mut t = vec![NetField::new(TrTime, 32, K::Regular)];
    for i in 0..3 {
        t.push(NetField::new(TrBase(i), 0, coord));
    }
    for i in 0..3 {
        t.push(NetField::new(Origin(i), 0, coord));
    }
    for i in 0..3 {
        t.push(NetField::new(Angles(i), 12, K::Angle));
    }
    for i in 0..4 {
        t.push(NetField::new(FrameTime(i), 15, K::AnimTime));
        t.push(NetField::new(FrameWeight(i), 8, K::AnimWeight));
        t.push(NetField::new(FrameIndex(i), -12, K::Regular));
    }
    t.push(NetField::new(ActionWeight, 8, K::AnimWeight));
    t.push(NetField::new(EType, 8, K::Simple));
    t.push(NetField::new(EFlags, 16, K::Regular));
    t.push(NetField::new(TrType, 8, K::Simple));
    for i in 0..3 {
        t.push(NetField::new(TrDelta(i), -17, K::Velocity));
    }
    for i in 4..MAX_FRAMEINFOS {
        t.push(NetField::new(FrameTime(i), 15, K::AnimTime));
        t.push(NetField::new(FrameWeight(i), 8, K::AnimWeight));
        t.push(NetField::new(FrameIndex(i), -12, K::Regular));
    }
    for b in 0..NUM_BONE_CONTROLLERS {
        for i in 0..3 {
            t.push(NetField::new(BoneAngle(b, i), bone_angle_bits, K::Angle));
        }
    }
    for b in 0..NUM_BONE_CONTROLLERS {
        t.push(NetField::new(BoneTag(b), -8, K::Regular));
    }
    t.push(NetField::new(Scale, 10, K::Scale));
    t.push(NetField::new(Alpha, 8, K::Alpha));
    t.push(NetField::new(RenderFx, 32, K::Regular));
    for i in 0..NUM_SURFACE_BYTES {
        t.push(NetField::new(Surface(i), 8, K::Regular));
    }
    t.push(NetField::new(Parent, ENT_BITS, K::Regular));
    t.push(NetField::new(TagNum, 10, K::Regular));
    t.push(NetField::new(Solid, 32, K::Regular));
    t.push(NetField::new(ModelIndex, 10, K::Regular));
    t.push(NetField::new(SkinNum, 8, K::Regular));
    t.push(NetField::new(LoopSound, 10, K::Regular));
    t.push(NetField::new(GroundEntityNum, ENT_BITS, K::Regular));
    t.push(NetField::new(ClientNum, 8, K::Regular));
    t
}

fn player_table(camera_coord: FieldKind) -> Vec<NetField<PlayerField>> {
    use FieldKind as K;
    use PlayerField::*;

    let mut t = vec![
        NetField::new(CommandTime, 32, K::Regular),
        NetField::new(Origin(0), 0, K::Coord),
        NetField::new(Origin(1), 0, K::Coord),
        NetField::new(BobCycle, 8, K::Regular),
        NetField::new(Velocity(0), -17, K::Velocity),
        NetField::new(Velocity(1), -17, K::Velocity),
        NetField::new(ViewAngles(1), 16, K::Angle),
        NetField::new(ViewAngles(0), 16, K::Angle),
        NetField::new(Origin(2), 0, K::Coord),
        NetField::new(Velocity(2), -17, K::Velocity),
        NetField::new(PmTime, -16, K::Regular),
        NetField::new(EFlags, 16, K::Regular),
        NetField::new(PmFlags, 16, K::Regular),
        NetField::new(PmType, 8, K::Simple),
        NetField::new(Gravity, -16, K::Regular),
        NetField::new(Speed, -16, K::Regular),
        NetField::new(DeltaAngles(1), -16, K::Regular),
        NetField::new(DeltaAngles(0), -16, K::Regular),
        NetField::new(DeltaAngles(2), -16, K::Regular),
        NetField::new(GroundEntityNum, ENT_BITS, K::Regular),
        NetField::new(ViewAngles(2), 16, K::Angle),
        NetField::new(ViewHeight, -8, K::Regular),
        NetField::new(LeanAngle, 0, K::Regular),
        NetField::new(Fov, 0, K::Regular),
    ];
    for i in 0..3 {
        t.push(NetField::new(CameraAngles(i), 16, K::Angle));
    }
    for i in 0..3 {
        t.push(NetField::new(CameraOrigin(i), 0, camera_coord));
    }
    for i in 0..3 {
        t.push(NetField::new(CameraOffset(i), 0, K::Regular));
    }
    for i in 0..3 {
        t.push(NetField::new(CameraPosOfs(i), 0, camera_coord));
    }
    t.push(NetField::new(CameraTime, 0, K::Regular));
    t.push(NetField::new(CameraFlags, 16, K::Regular));
    t.push(NetField::new(ClientNum, 8, K::Regular));
    t
}

/// Entity table for protocols 6 and 8.
pub fn legacy_entity_fields() -> &'static [NetField<EntityField>] {
    static TABLE: OnceLock<Vec<NetField<EntityField>>> = OnceLock::new();
    TABLE.get_or_init(|| entity_table(FieldKind::Coord, 12))
}

/// Entity table for protocols 15 to 17.
pub fn modern_entity_fields() -> &'static [NetField<EntityField>] {
    static TABLE: OnceLock<Vec<NetField<EntityField>>> = OnceLock::new();
    TABLE.get_or_init(|| entity_table(FieldKind::CoordExtra, -13))
}

pub fn legacy_player_fields() -> &'static [NetField<PlayerField>] {
    static TABLE: OnceLock<Vec<NetField<PlayerField>>> = OnceLock::new();
    TABLE.get_or_init(|| player_table(FieldKind::Coord))
}

pub fn modern_player_fields() -> &'static [NetField<PlayerField>] {
    static TABLE: OnceLock<Vec<NetField<PlayerField>>> = OnceLock::new();
    TABLE.get_or_init(|| player_table(FieldKind::CoordExtra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CameraFlags, PmFlags};

    #[test]
    fn tables_fit_in_a_byte_count() {
        assert!(legacy_entity_fields().len() <= 255);
        assert!(modern_entity_fields().len() <= 255);
        assert!(legacy_player_fields().len() <= 255);
        assert!(modern_player_fields().len() <= 255);
    }

    #[test]
    fn entity_tables_cover_every_field_once() {
        let table = legacy_entity_fields();
        let mut names: Vec<String> = table.iter().map(|f| f.field.to_string()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        // trTime, trBase, origin, angles, frame infos, actionWeight, eType,
        // eFlags, trType, trDelta, bones, scale, alpha, renderfx, surfaces and
        // the eight associative fields.
        assert_eq!(total, 1 + 3 + 3 + 3 + MAX_FRAMEINFOS * 3 + 4 + 3 + 20 + 3 + 32 + 8);
    }

    #[test]
    fn accessors_roundtrip_raw_bits() {
        let mut es = EntityState::default();
        for f in legacy_entity_fields() {
            let raw = if f.kind.is_float(f.bits) {
                1.5f32.to_bits()
            } else {
                3
            };
            es.set(f.field, raw);
            assert_eq!(es.get(f.field), raw, "{}", f.field);
        }

        let mut ps = PlayerState::default();
        for f in legacy_player_fields() {
            let raw = if f.kind.is_float(f.bits) {
                (-2.25f32).to_bits()
            } else {
                5
            };
            ps.set(f.field, raw);
            assert_eq!(ps.get(f.field), raw, "{}", f.field);
        }
    }

    #[test]
    fn families_differ_only_in_kinds() {
        let legacy = legacy_entity_fields();
        let modern = modern_entity_fields();
        assert_eq!(legacy.len(), modern.len());
        assert!(legacy
            .iter()
            .zip(modern)
            .all(|(a, b)| a.field == b.field));
        assert_eq!(modern[1].kind, FieldKind::CoordExtra);
    }

    #[test]
    fn flags_survive_accessors() {
        let mut ps = PlayerState::default();
        ps.set(PlayerField::PmFlags, PmFlags::FROZEN.bits());
        assert!(ps.pm_flags.contains(PmFlags::FROZEN));
        ps.set(PlayerField::CameraFlags, CameraFlags::CAMERA_CUT_BIT.bits());
        assert!(ps.camera_flags.contains(CameraFlags::CAMERA_CUT_BIT));
    }
}
