//! Replicated state types.
//!
//! These are plain value types. The wire layer never hands out partially
//! decoded states: a decode either produces a complete value or an error.

use bitflags::bitflags;

use crate::math::Vec3;

/// Bits needed to address any entity slot.
pub const GENTITYNUM_BITS: u32 = 10;
pub const MAX_GENTITIES: usize = 1 << GENTITYNUM_BITS;
/// "No entity". Also the wire terminator of an entity list and the number a
/// removed entity decodes to.
pub const ENTITYNUM_NONE: u16 = (MAX_GENTITIES - 1) as u16;
pub const ENTITYNUM_WORLD: u16 = (MAX_GENTITIES - 2) as u16;

pub const MAX_FRAMEINFOS: usize = 16;
pub const NUM_BONE_CONTROLLERS: usize = 5;
pub const NUM_SURFACE_BYTES: usize = 32;
pub const MAX_STATS: usize = 32;
pub const MAX_MAP_AREA_BYTES: usize = 32;

bitflags! {
    /// Entity flags shared by entity and player states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityFlags: u32 {
        const DEAD = 1 << 0;
        const NODRAW = 1 << 1;
        /// Toggled whenever the origin changes discontinuously.
        const TELEPORT_BIT = 1 << 2;
        const EVERYFRAME = 1 << 3;
        const ANTISBJUICE = 1 << 4;
    }
}

bitflags! {
    /// Player movement flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PmFlags: u32 {
        const DUCKED = 1 << 0;
        const JUMP_HELD = 1 << 1;
        const TIME_LAND = 1 << 2;
        const TIME_KNOCKBACK = 1 << 3;
        /// Spectating another client; never predicted.
        const FOLLOW = 1 << 4;
        const NO_PREDICTION = 1 << 5;
        /// Movement locked by the server (intermission, cinematics).
        const FROZEN = 1 << 6;
        const RESPAWNED = 1 << 7;
    }
}

bitflags! {
    /// Snapshot flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SnapFlags: u8 {
        const RATE_DELAYED = 1 << 0;
        const NOT_ACTIVE = 1 << 1;
        /// Toggled on every server restart.
        const SERVERCOUNT = 1 << 2;
    }
}

bitflags! {
    /// User command buttons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const ATTACK_PRIMARY = 1 << 0;
        const ATTACK_SECONDARY = 1 << 1;
        const RUN = 1 << 2;
        const USE = 1 << 3;
        const LEAN_LEFT = 1 << 4;
        const LEAN_RIGHT = 1 << 5;
        const TALK = 1 << 6;
        const ANY = 1 << 15;
    }
}

bitflags! {
    /// Camera flags carried in the player state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CameraFlags: u32 {
        const ANGLES_ALLOW_OFFSET = 1 << 0;
        const POSITION_ALLOW_OFFSET = 1 << 1;
        /// Toggled on a hard camera cut; suppresses blending for a frame.
        const CAMERA_CUT_BIT = 1 << 7;
    }
}

/// Movement type stored in [`PlayerState::pm_type`].
pub mod pm_type {
    pub const NORMAL: u8 = 0;
    pub const NOCLIP: u8 = 1;
    pub const SPECTATOR: u8 = 2;
    pub const DEAD: u8 = 3;
    pub const INTERMISSION: u8 = 4;
}

/// Parametric motion used by movers and projectiles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Trajectory {
    pub tr_type: u8,
    pub tr_time: i32,
    pub tr_base: Vec3,
    pub tr_delta: Vec3,
}

/// One animation channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInfo {
    /// Animation index; travels as a signed 12-bit value, so -1 (no
    /// animation) survives and the usable range is `-2048..=2047`.
    pub index: i32,
    pub time: f32,
    pub weight: f32,
}

/// Networked entity state.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub number: u16,
    pub e_type: u8,
    pub e_flags: EntityFlags,
    pub pos: Trajectory,
    pub origin: Vec3,
    pub angles: Vec3,
    pub bone_tag: [i8; NUM_BONE_CONTROLLERS],
    pub bone_angles: [Vec3; NUM_BONE_CONTROLLERS],
    pub frame_info: [FrameInfo; MAX_FRAMEINFOS],
    pub action_weight: f32,
    pub scale: f32,
    pub alpha: f32,
    pub renderfx: i32,
    pub surfaces: [u8; NUM_SURFACE_BYTES],
    pub parent: u16,
    pub tag_num: u16,
    pub solid: i32,
    pub modelindex: u16,
    pub skin_num: u8,
    pub loop_sound: u16,
    pub ground_entity_num: u16,
    pub client_num: u8,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            number: 0,
            e_type: 0,
            e_flags: EntityFlags::empty(),
            pos: Trajectory::default(),
            origin: Vec3::ZERO,
            angles: Vec3::ZERO,
            bone_tag: [0; NUM_BONE_CONTROLLERS],
            bone_angles: [Vec3::ZERO; NUM_BONE_CONTROLLERS],
            frame_info: [FrameInfo::default(); MAX_FRAMEINFOS],
            action_weight: 0.0,
            scale: 0.0,
            alpha: 0.0,
            renderfx: 0,
            surfaces: [0; NUM_SURFACE_BYTES],
            parent: 0,
            tag_num: 0,
            solid: 0,
            modelindex: 0,
            skin_num: 0,
            loop_sound: 0,
            ground_entity_num: 0,
            client_num: 0,
        }
    }
}

impl EntityState {
    /// A zeroed state carrying only `number`.
    pub fn with_number(number: u16) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }
}

/// Authoritative per-client simulation state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerState {
    pub command_time: i32,
    pub pm_type: u8,
    pub pm_flags: PmFlags,
    pub pm_time: i16,
    pub bob_cycle: u8,
    pub origin: Vec3,
    pub velocity: Vec3,
    pub gravity: i16,
    pub speed: i16,
    pub delta_angles: [i16; 3],
    pub ground_entity_num: u16,
    pub e_flags: EntityFlags,
    pub viewangles: Vec3,
    pub viewheight: i8,
    pub lean_angle: f32,
    pub fov: f32,
    pub camera_angles: Vec3,
    pub camera_origin: Vec3,
    pub camera_offset: Vec3,
    pub camera_posofs: Vec3,
    pub camera_time: f32,
    pub camera_flags: CameraFlags,
    pub client_num: u8,
    pub stats: [i16; MAX_STATS],
}

impl PlayerState {
    /// Entity the player stands on, if any.
    pub fn ground_entity(&self) -> Option<u16> {
        (self.ground_entity_num != ENTITYNUM_NONE).then_some(self.ground_entity_num)
    }
}

/// One physics tick of client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserCommand {
    pub server_time: i32,
    pub buttons: Buttons,
    /// View angles as 16-bit short angles.
    pub angles: [u16; 3],
    pub forward: i8,
    pub right: i8,
    pub up: i8,
}

/// Eye offset and look angles sent alongside user commands.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UserEyes {
    pub ofs: [i8; 3],
    pub angles: [f32; 2],
}

/// A sound started or stopped by the server in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSound {
    pub stop: bool,
    pub entity: u16,
    pub channel: u8,
    pub sound_index: u16,
    pub origin: Option<Vec3>,
    pub volume: Option<f32>,
}
