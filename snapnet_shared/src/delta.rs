//! Field delta codec.
//!
//! Encodes the difference between two values of the same replicated struct
//! against a [`NetField`] table:
//!
//! ```text
//! has_delta:1 [lc:8 { changed:1 [payload] } * lc]
//! ```
//!
//! `lc` is one past the last field that differs. Fields from `lc` onward are
//! never written and the decoder copies them from the base value, which makes
//! the table order part of the protocol.
//!
//! The same module carries the entity envelope (number, remove bit), the
//! player stats mask, the keyed user command delta and the eye delta.

use crate::error::{NetError, NetResult};
use crate::msg::{BitReader, BitWriter};
use crate::netfield::{EntityField, FieldAccess, FieldKind, NetField, PlayerField};
use crate::math::Vec3;
use crate::state::{
    Buttons, EntityState, PlayerState, ServerSound, UserCommand, UserEyes, MAX_GENTITIES,
    MAX_STATS,
};

const FLOAT_INT_BITS: u32 = 13;
const FLOAT_INT_BIAS: i32 = 1 << (FLOAT_INT_BITS - 1);

/// Fixed-point steps per world unit for coordinates.
const COORD_SCALE: f32 = 16.0;
const COORD_BITS: u32 = 19;
const COORD_EXTRA_BITS: u32 = 22;
/// Width of the relative coordinate payload.
const SMALL_COORD_BITS: i32 = -7;
/// Fixed-point steps per unit/second for velocities.
const VELOCITY_SCALE: f32 = 8.0;
const SCALE_RANGE: f32 = 16.0;

const SOUND_COUNT_BITS: u32 = 7;
const SOUND_CHANNEL_BITS: u32 = 7;
const SOUND_INDEX_BITS: u32 = 9;
/// Sounds one snapshot can carry.
pub const MAX_SERVER_SOUNDS: usize = (1 << SOUND_COUNT_BITS) - 1;

/// Per-family quantization choices, supplied by the protocol strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecRules {
    /// Fixed-point steps per second for animation times.
    pub anim_time_scale: f32,
    /// Animation times may be sent as "previous plus the frame delta".
    pub anim_time_reuse: bool,
    /// Coordinates may be sent relative to the base value.
    pub delta_coords: bool,
}

/// A delta codec bound to one protocol family's tables and rules.
#[derive(Debug, Clone, Copy)]
pub struct DeltaCodec {
    entity_fields: &'static [NetField<EntityField>],
    player_fields: &'static [NetField<PlayerField>],
    entity_num_bits: u32,
    rules: CodecRules,
    /// Interpolation delta announced in the gamestate, in seconds.
    time_delta: f32,
}

/// One past the index of the last field that differs, 0 when equal.
pub fn last_changed<T: FieldAccess>(table: &[NetField<T::Field>], from: &T, to: &T) -> usize {
    table
        .iter()
        .rposition(|f| from.get(f.field) != to.get(f.field))
        .map_or(0, |i| i + 1)
}

fn signed_limit(v: i64, bits: u32) -> i64 {
    let lim = 1i64 << (bits - 1);
    v.clamp(-lim, lim - 1)
}

fn unsigned_limit(v: i64, bits: u32) -> i64 {
    v.clamp(0, (1i64 << bits) - 1)
}

fn unit_max(bits: i32) -> f32 {
    ((1u64 << bits.unsigned_abs()) - 1) as f32
}

fn coord_bits(kind: FieldKind) -> u32 {
    if kind == FieldKind::CoordExtra {
        COORD_EXTRA_BITS
    } else {
        COORD_BITS
    }
}

pub fn pack_coord(v: f32) -> i64 {
    (v * COORD_SCALE).round() as i64
}

pub fn pack_angle(v: f32, bits: i32) -> i64 {
    (v * (1u64 << bits.unsigned_abs()) as f32 / 360.0) as i64
}

pub fn unpack_angle(packed: i64, bits: i32) -> f32 {
    packed as f32 * 360.0 / (1u64 << bits.unsigned_abs()) as f32
}

impl DeltaCodec {
    pub fn new(
        entity_fields: &'static [NetField<EntityField>],
        player_fields: &'static [NetField<PlayerField>],
        entity_num_bits: u32,
        rules: CodecRules,
    ) -> Self {
        Self {
            entity_fields,
            player_fields,
            entity_num_bits,
            rules,
            time_delta: 0.0,
        }
    }

    /// Binds the interpolation delta used by animation time reuse.
    pub fn with_time_delta(mut self, time_delta: f32) -> Self {
        self.time_delta = time_delta;
        self
    }

    pub fn entity_num_bits(&self) -> u32 {
        self.entity_num_bits
    }

    pub fn rules(&self) -> CodecRules {
        self.rules
    }

    pub fn entity_fields(&self) -> &'static [NetField<EntityField>] {
        self.entity_fields
    }

    pub fn player_fields(&self) -> &'static [NetField<PlayerField>] {
        self.player_fields
    }

    fn pack_anim_time(&self, v: f32) -> i64 {
        (v * self.rules.anim_time_scale).round() as i64
    }

    /// Writes the field list; returns the `lc` that went on the wire.
    pub fn write_fields<T: FieldAccess>(
        &self,
        w: &mut BitWriter,
        table: &[NetField<T::Field>],
        from: &T,
        to: &T,
    ) -> NetResult<usize> {
        let lc = last_changed(table, from, to);
        if lc == 0 {
            w.write_bool(false)?;
            return Ok(0);
        }
        w.write_bool(true)?;
        w.write_byte(lc as u8)?;
        for f in &table[..lc] {
            let old = from.get(f.field);
            let new = to.get(f.field);
            if old == new {
                w.write_bool(false)?;
                continue;
            }
            w.write_bool(true)?;
            self.write_value(w, f.kind, f.bits, old, new)?;
        }
        Ok(lc)
    }

    /// Reads a field list written by [`DeltaCodec::write_fields`] on top of `from`.
    pub fn read_fields<T: FieldAccess>(
        &self,
        r: &mut BitReader<'_>,
        table: &[NetField<T::Field>],
        from: &T,
    ) -> NetResult<T> {
        let mut to = from.clone();
        if !r.read_bool()? {
            return Ok(to);
        }
        let lc = r.read_byte()? as usize;
        if lc > table.len() {
            return Err(NetError::malformed(
                T::TABLE,
                format!("field count {lc} exceeds table size {}", table.len()),
            ));
        }
        for f in &table[..lc] {
            if r.read_bool()? {
                let raw = self.read_value(r, f.kind, f.bits, from.get(f.field))?;
                to.set(f.field, raw);
            }
        }
        Ok(to)
    }

    fn write_value(
        &self,
        w: &mut BitWriter,
        kind: FieldKind,
        bits: i32,
        old: u32,
        new: u32,
    ) -> NetResult<()> {
        let v = f32::from_bits(new);
        match kind {
            FieldKind::Regular if bits == 0 => write_float_value(w, v),
            FieldKind::Regular => {
                if new == 0 {
                    w.write_bool(false)
                } else {
                    w.write_bool(true)?;
                    w.write_number(new as i32 as i64, bits)
                }
            }
            FieldKind::Simple => w.write_number(new as i32 as i64, bits),
            FieldKind::Angle => w.write_number(pack_angle(v, bits), bits),
            FieldKind::AnimTime => {
                let width = bits.unsigned_abs();
                let packed = unsigned_limit(self.pack_anim_time(v), width);
                if self.rules.anim_time_reuse {
                    let reused = self.pack_anim_time(f32::from_bits(old))
                        + self.pack_anim_time(self.time_delta);
                    if reused == packed {
                        return w.write_bool(true);
                    }
                    w.write_bool(false)?;
                }
                w.write_bits(packed as u64, width)
            }
            FieldKind::AnimWeight | FieldKind::Alpha => {
                let packed = (v.clamp(0.0, 1.0) * unit_max(bits)).round() as i64;
                w.write_bits(packed as u64, bits.unsigned_abs())
            }
            FieldKind::Scale => {
                let packed = (v.clamp(0.0, SCALE_RANGE) / SCALE_RANGE * unit_max(bits)).round();
                w.write_bits(packed as u64, bits.unsigned_abs())
            }
            FieldKind::Coord | FieldKind::CoordExtra => {
                let width = coord_bits(kind);
                let packed = signed_limit(pack_coord(v), width);
                if self.rules.delta_coords {
                    let delta = packed - pack_coord(f32::from_bits(old));
                    if delta == signed_limit(delta, SMALL_COORD_BITS.unsigned_abs()) {
                        w.write_bool(true)?;
                        return w.write_number(delta, SMALL_COORD_BITS);
                    }
                    w.write_bool(false)?;
                }
                w.write_number(packed, -(width as i32))
            }
            FieldKind::Velocity => {
                let width = bits.unsigned_abs();
                let packed = signed_limit((v * VELOCITY_SCALE).round() as i64, width);
                w.write_number(packed, -(width as i32))
            }
        }
    }

    fn read_value(
        &self,
        r: &mut BitReader<'_>,
        kind: FieldKind,
        bits: i32,
        old: u32,
    ) -> NetResult<u32> {
        let raw = match kind {
            FieldKind::Regular if bits == 0 => read_float_value(r)?.to_bits(),
            FieldKind::Regular => {
                if r.read_bool()? {
                    r.read_number(bits)? as u32
                } else {
                    0
                }
            }
            FieldKind::Simple => r.read_number(bits)? as u32,
            FieldKind::Angle => unpack_angle(r.read_number(bits)?, bits).to_bits(),
            FieldKind::AnimTime => {
                let reused = self.rules.anim_time_reuse && r.read_bool()?;
                let packed = if reused {
                    self.pack_anim_time(f32::from_bits(old)) + self.pack_anim_time(self.time_delta)
                } else {
                    r.read_bits(bits.unsigned_abs())? as i64
                };
                (packed as f32 / self.rules.anim_time_scale).to_bits()
            }
            FieldKind::AnimWeight | FieldKind::Alpha => {
                let packed = r.read_bits(bits.unsigned_abs())?;
                (packed as f32 / unit_max(bits)).to_bits()
            }
            FieldKind::Scale => {
                let packed = r.read_bits(bits.unsigned_abs())?;
                (packed as f32 * SCALE_RANGE / unit_max(bits)).to_bits()
            }
            FieldKind::Coord | FieldKind::CoordExtra => {
                let packed = if self.rules.delta_coords && r.read_bool()? {
                    pack_coord(f32::from_bits(old)) + r.read_number(SMALL_COORD_BITS)?
                } else {
                    r.read_number(-(coord_bits(kind) as i32))?
                };
                (packed as f32 / COORD_SCALE).to_bits()
            }
            FieldKind::Velocity => {
                let packed = r.read_number(-(bits.unsigned_abs() as i32))?;
                (packed as f32 / VELOCITY_SCALE).to_bits()
            }
        };
        Ok(raw)
    }

    pub fn write_entity_number(&self, w: &mut BitWriter, number: u16) -> NetResult<()> {
        w.write_bits(number as u64, self.entity_num_bits)
    }

    /// Reads an entity number, rejecting anything outside the entity space.
    pub fn read_entity_number(&self, r: &mut BitReader<'_>) -> NetResult<u16> {
        let number = r.read_bits(self.entity_num_bits)?;
        if number >= MAX_GENTITIES as u64 {
            return Err(NetError::EntityNumberOutOfRange(number as u32));
        }
        Ok(number as u16)
    }

    /// Writes the entity list terminator.
    pub fn write_entity_end(&self, w: &mut BitWriter) -> NetResult<()> {
        self.write_entity_number(w, (MAX_GENTITIES - 1) as u16)
    }

    /// Writes `to` as a delta from `from`.
    ///
    /// An unchanged entity writes nothing unless `force` is set; the reader
    /// then carries it over from the previous frame.
    pub fn write_entity(
        &self,
        w: &mut BitWriter,
        from: &EntityState,
        to: &EntityState,
        force: bool,
    ) -> NetResult<()> {
        if !force && last_changed(self.entity_fields, from, to) == 0 {
            return Ok(());
        }
        self.write_entity_number(w, to.number)?;
        w.write_bool(false)?;
        self.write_fields(w, self.entity_fields, from, to)?;
        Ok(())
    }

    pub fn write_entity_removal(&self, w: &mut BitWriter, number: u16) -> NetResult<()> {
        self.write_entity_number(w, number)?;
        w.write_bool(true)
    }

    /// Reads the body of an entity record whose number was already read.
    /// `None` means the entity was removed.
    pub fn read_entity(
        &self,
        r: &mut BitReader<'_>,
        from: &EntityState,
        number: u16,
    ) -> NetResult<Option<EntityState>> {
        if r.read_bool()? {
            return Ok(None);
        }
        let mut to = self.read_fields(r, self.entity_fields, from)?;
        to.number = number;
        Ok(Some(to))
    }

    pub fn write_player(
        &self,
        w: &mut BitWriter,
        from: &PlayerState,
        to: &PlayerState,
    ) -> NetResult<()> {
        self.write_fields(w, self.player_fields, from, to)?;

        let mask = (0..MAX_STATS)
            .filter(|&i| from.stats[i] != to.stats[i])
            .fold(0u32, |m, i| m | 1 << i);
        if mask == 0 {
            return w.write_bool(false);
        }
        w.write_bool(true)?;
        w.write_bits(mask as u64, MAX_STATS as u32)?;
        for i in 0..MAX_STATS {
            if mask & (1 << i) != 0 {
                w.write_short(to.stats[i])?;
            }
        }
        Ok(())
    }

    pub fn read_player(&self, r: &mut BitReader<'_>, from: &PlayerState) -> NetResult<PlayerState> {
        let mut to = self.read_fields(r, self.player_fields, from)?;
        if r.read_bool()? {
            let mask = r.read_bits(MAX_STATS as u32)? as u32;
            for i in 0..MAX_STATS {
                if mask & (1 << i) != 0 {
                    to.stats[i] = r.read_short()?;
                }
            }
        }
        Ok(to)
    }

    /// Writes the snapshot's sound list. An empty list costs one bit.
    pub fn write_sounds(&self, w: &mut BitWriter, sounds: &[ServerSound]) -> NetResult<()> {
        if sounds.is_empty() {
            return w.write_bool(false);
        }
        if sounds.len() > MAX_SERVER_SOUNDS {
            return Err(NetError::malformed("sounds", format!("{} sounds", sounds.len())));
        }
        w.write_bool(true)?;
        w.write_bits(sounds.len() as u64, SOUND_COUNT_BITS)?;
        for s in sounds {
            w.write_bool(s.stop)?;
            self.write_entity_number(w, s.entity)?;
            w.write_bits(s.channel as u64, SOUND_CHANNEL_BITS)?;
            w.write_bits(s.sound_index as u64, SOUND_INDEX_BITS)?;
            match s.origin {
                Some(o) => {
                    w.write_bool(true)?;
                    for i in 0..3 {
                        w.write_float(o[i])?;
                    }
                }
                None => w.write_bool(false)?,
            }
            match s.volume {
                Some(v) => {
                    w.write_bool(true)?;
                    w.write_float(v)?;
                }
                None => w.write_bool(false)?,
            }
        }
        Ok(())
    }

    pub fn read_sounds(&self, r: &mut BitReader<'_>) -> NetResult<Vec<ServerSound>> {
        if !r.read_bool()? {
            return Ok(Vec::new());
        }
        let count = r.read_bits(SOUND_COUNT_BITS)? as usize;
        let mut sounds = Vec::with_capacity(count);
        for _ in 0..count {
            let stop = r.read_bool()?;
            let entity = self.read_entity_number(r)?;
            let channel = r.read_bits(SOUND_CHANNEL_BITS)? as u8;
            let sound_index = r.read_bits(SOUND_INDEX_BITS)? as u16;
            let origin = if r.read_bool()? {
                Some(Vec3::new(r.read_float()?, r.read_float()?, r.read_float()?))
            } else {
                None
            };
            let volume = if r.read_bool()? {
                Some(r.read_float()?)
            } else {
                None
            };
            sounds.push(ServerSound {
                stop,
                entity,
                channel,
                sound_index,
                origin,
                volume,
            });
        }
        Ok(sounds)
    }
}

fn write_float_value(w: &mut BitWriter, v: f32) -> NetResult<()> {
    if v == 0.0 {
        return w.write_bool(false);
    }
    w.write_bool(true)?;
    let truncated = v as i32;
    if truncated as f32 == v && (-FLOAT_INT_BIAS..FLOAT_INT_BIAS).contains(&truncated) {
        w.write_bool(false)?;
        w.write_bits((truncated + FLOAT_INT_BIAS) as u64, FLOAT_INT_BITS)
    } else {
        w.write_bool(true)?;
        w.write_float(v)
    }
}

fn read_float_value(r: &mut BitReader<'_>) -> NetResult<f32> {
    if !r.read_bool()? {
        return Ok(0.0);
    }
    if r.read_bool()? {
        r.read_float()
    } else {
        let biased = r.read_bits(FLOAT_INT_BITS)? as i32;
        Ok((biased - FLOAT_INT_BIAS) as f32)
    }
}

fn write_keyed(w: &mut BitWriter, key: u32, old: u32, new: u32, bits: u32) -> NetResult<()> {
    if old == new {
        return w.write_bool(false);
    }
    w.write_bool(true)?;
    w.write_bits((new ^ key) as u64, bits)
}

fn read_keyed(r: &mut BitReader<'_>, key: u32, old: u32, bits: u32) -> NetResult<u32> {
    if !r.read_bool()? {
        return Ok(old);
    }
    let mask = ((1u64 << bits) - 1) as u32;
    Ok((r.read_bits(bits)? as u32 ^ key) & mask)
}

/// Writes `to` as a delta from `from`, obfuscated with `key`.
pub fn write_usercmd(
    w: &mut BitWriter,
    key: u32,
    from: &UserCommand,
    to: &UserCommand,
) -> NetResult<()> {
    let dt = to.server_time.wrapping_sub(from.server_time);
    if (0..256).contains(&dt) {
        w.write_bool(true)?;
        w.write_bits(dt as u64, 8)?;
    } else {
        w.write_bool(false)?;
        w.write_long(to.server_time)?;
    }

    if from.angles == to.angles
        && from.forward == to.forward
        && from.right == to.right
        && from.up == to.up
        && from.buttons == to.buttons
    {
        return w.write_bool(false);
    }
    w.write_bool(true)?;

    let key = key ^ to.server_time as u32;
    for i in 0..3 {
        write_keyed(w, key, from.angles[i] as u32, to.angles[i] as u32, 16)?;
    }
    write_keyed(w, key, from.forward as u8 as u32, to.forward as u8 as u32, 8)?;
    write_keyed(w, key, from.right as u8 as u32, to.right as u8 as u32, 8)?;
    write_keyed(w, key, from.up as u8 as u32, to.up as u8 as u32, 8)?;
    write_keyed(w, key, from.buttons.bits() as u32, to.buttons.bits() as u32, 16)
}

pub fn read_usercmd(r: &mut BitReader<'_>, key: u32, from: &UserCommand) -> NetResult<UserCommand> {
    let mut to = *from;
    to.server_time = if r.read_bool()? {
        from.server_time.wrapping_add(r.read_bits(8)? as i32)
    } else {
        r.read_long()?
    };

    if !r.read_bool()? {
        return Ok(to);
    }

    let key = key ^ to.server_time as u32;
    for i in 0..3 {
        to.angles[i] = read_keyed(r, key, from.angles[i] as u32, 16)? as u16;
    }
    to.forward = read_keyed(r, key, from.forward as u8 as u32, 8)? as u8 as i8;
    to.right = read_keyed(r, key, from.right as u8 as u32, 8)? as u8 as i8;
    to.up = read_keyed(r, key, from.up as u8 as u32, 8)? as u8 as i8;
    to.buttons = Buttons::from_bits_retain(read_keyed(r, key, from.buttons.bits() as u32, 16)? as u16);
    Ok(to)
}

pub fn write_eyes(w: &mut BitWriter, from: &UserEyes, to: &UserEyes) -> NetResult<()> {
    for i in 0..3 {
        if from.ofs[i] == to.ofs[i] {
            w.write_bool(false)?;
        } else {
            w.write_bool(true)?;
            w.write_number(to.ofs[i] as i64, -8)?;
        }
    }
    for i in 0..2 {
        if from.angles[i].to_bits() == to.angles[i].to_bits() {
            w.write_bool(false)?;
        } else {
            w.write_bool(true)?;
            w.write_float(to.angles[i])?;
        }
    }
    Ok(())
}

pub fn read_eyes(r: &mut BitReader<'_>, from: &UserEyes) -> NetResult<UserEyes> {
    let mut to = *from;
    for i in 0..3 {
        if r.read_bool()? {
            to.ofs[i] = r.read_number(-8)? as i8;
        }
    }
    for i in 0..2 {
        if r.read_bool()? {
            to.angles[i] = r.read_float()?;
        }
    }
    Ok(to)
}
