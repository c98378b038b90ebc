//! Player movement.
//!
//! The client replays user commands through the same routine the server uses,
//! so the routine must be deterministic: same state and command in, same
//! state out, bit for bit. Positions are snapped to the wire coordinate grid
//! and velocities to whole units after every command so that a state that
//! went through the delta codec replays exactly like the original.

use crate::math::{angle_subtract, short_to_angle, Vec3};
use crate::state::{
    pm_type, PlayerState, PmFlags, UserCommand, ENTITYNUM_NONE, ENTITYNUM_WORLD,
};

/// Longest step a single command may simulate.
pub const MAX_MOVE_MSEC: i32 = 200;
const GRID: f32 = 16.0;

/// Movement tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveParams {
    pub friction: f32,
    pub stop_speed: f32,
    pub accelerate: f32,
    pub air_accelerate: f32,
    pub jump_velocity: f32,
    pub floor_z: f32,
    /// Used when the player state carries no gravity.
    pub default_gravity: f32,
    /// Used when the player state carries no speed.
    pub default_speed: f32,
}

impl Default for MoveParams {
    fn default() -> Self {
        Self {
            friction: 6.0,
            stop_speed: 100.0,
            accelerate: 10.0,
            air_accelerate: 1.0,
            jump_velocity: 270.0,
            floor_z: 0.0,
            default_gravity: 800.0,
            default_speed: 320.0,
        }
    }
}

/// Advances a player state by one user command.
pub trait MovementSimulator: Send + Sync {
    fn simulate(&self, ps: &mut PlayerState, cmd: &UserCommand);
}

/// Walker on an infinite flat floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroundMovement {
    pub params: MoveParams,
}

impl GroundMovement {
    pub fn new(params: MoveParams) -> Self {
        Self { params }
    }

    fn update_view_angles(ps: &mut PlayerState, cmd: &UserCommand) {
        for i in 0..3 {
            let short = cmd.angles[i].wrapping_add(ps.delta_angles[i] as u16);
            ps.viewangles[i] = short_to_angle(short);
        }
        // keep pitch off the poles
        let pitch = angle_subtract(ps.viewangles.x, 0.0).clamp(-89.0, 89.0);
        ps.viewangles.x = pitch;
    }

    fn cmd_scale(&self, ps: &PlayerState, cmd: &UserCommand) -> f32 {
        let f = cmd.forward as f32;
        let r = cmd.right as f32;
        let u = cmd.up as f32;
        let max = f.abs().max(r.abs()).max(u.abs());
        if max == 0.0 {
            return 0.0;
        }
        let total = (f * f + r * r + u * u).sqrt();
        let speed = if ps.speed > 0 {
            ps.speed as f32
        } else {
            self.params.default_speed
        };
        speed * max / (127.0 * total)
    }

    fn friction(&self, vel: &mut Vec3, frametime: f32) {
        let speed = vel.len();
        if speed < 1.0 {
            vel.x = 0.0;
            vel.y = 0.0;
            return;
        }
        let control = speed.max(self.params.stop_speed);
        let drop = control * self.params.friction * frametime;
        let scale = (speed - drop).max(0.0) / speed;
        *vel = *vel * scale;
    }

    fn accelerate(vel: &mut Vec3, wishdir: Vec3, wishspeed: f32, accel: f32, frametime: f32) {
        let add = wishspeed - vel.dot(wishdir);
        if add <= 0.0 {
            return;
        }
        let step = (accel * frametime * wishspeed).min(add);
        *vel = vel.mul_add(wishdir, step);
    }
}

fn snap(v: f32, grid: f32) -> f32 {
    (v * grid).round() / grid
}

impl MovementSimulator for GroundMovement {
    fn simulate(&self, ps: &mut PlayerState, cmd: &UserCommand) {
        if cmd.server_time <= ps.command_time {
            return;
        }
        let msec = (cmd.server_time - ps.command_time).min(MAX_MOVE_MSEC);
        ps.command_time = cmd.server_time;

        if ps.pm_type == pm_type::INTERMISSION || ps.pm_flags.contains(PmFlags::FROZEN) {
            return;
        }
        Self::update_view_angles(ps, cmd);
        if ps.pm_type == pm_type::DEAD {
            return;
        }

        let frametime = msec as f32 / 1000.0;
        let yaw = ps.viewangles.y.to_radians();
        let forward = Vec3::new(yaw.cos(), yaw.sin(), 0.0);
        let right = Vec3::new(yaw.sin(), -yaw.cos(), 0.0);
        let scale = self.cmd_scale(ps, cmd);

        let wish = forward * cmd.forward as f32 + right * cmd.right as f32;
        let (wishdir, wishlen) = wish.normalize();
        let wishspeed = if wishlen > 0.0 { scale * wishlen } else { 0.0 };

        let mut vel = ps.velocity;
        let mut origin = ps.origin;
        let floor = self.params.floor_z;

        if ps.pm_type == pm_type::NOCLIP || ps.pm_type == pm_type::SPECTATOR {
            self.friction(&mut vel, frametime);
            Self::accelerate(&mut vel, wishdir, wishspeed, self.params.accelerate, frametime);
            origin = origin.mul_add(vel, frametime);
            ps.origin = Vec3::new(snap(origin.x, GRID), snap(origin.y, GRID), snap(origin.z, GRID));
            ps.velocity = Vec3::new(vel.x.round(), vel.y.round(), vel.z.round());
            ps.ground_entity_num = ENTITYNUM_NONE;
            return;
        }

        let mut on_ground = origin.z <= floor && vel.z <= 0.0;
        if cmd.up > 0 {
            if on_ground && !ps.pm_flags.contains(PmFlags::JUMP_HELD) {
                vel.z = self.params.jump_velocity;
                on_ground = false;
            }
            ps.pm_flags.insert(PmFlags::JUMP_HELD);
        } else {
            ps.pm_flags.remove(PmFlags::JUMP_HELD);
        }

        if on_ground {
            vel.z = 0.0;
            self.friction(&mut vel, frametime);
            Self::accelerate(&mut vel, wishdir, wishspeed, self.params.accelerate, frametime);
        } else {
            Self::accelerate(&mut vel, wishdir, wishspeed, self.params.air_accelerate, frametime);
            let gravity = if ps.gravity > 0 {
                ps.gravity as f32
            } else {
                self.params.default_gravity
            };
            vel.z -= gravity * frametime;
        }

        origin = origin.mul_add(vel, frametime);
        if origin.z <= floor {
            origin.z = floor;
            if vel.z < 0.0 {
                vel.z = 0.0;
            }
            on_ground = true;
        }

        if on_ground {
            if ps.ground_entity_num == ENTITYNUM_NONE {
                ps.ground_entity_num = ENTITYNUM_WORLD;
            }
            let horizontal = (vel.x * vel.x + vel.y * vel.y).sqrt();
            ps.bob_cycle = ps
                .bob_cycle
                .wrapping_add((horizontal * frametime) as u8);
        } else {
            ps.ground_entity_num = ENTITYNUM_NONE;
        }

        ps.origin = Vec3::new(snap(origin.x, GRID), snap(origin.y, GRID), snap(origin.z, GRID));
        ps.velocity = Vec3::new(vel.x.round(), vel.y.round(), vel.z.round());
    }
}
