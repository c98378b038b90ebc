//! Prediction and interpolation of the local player.
//!
//! Every frame the predictor produces the player state to render:
//! - With prediction off (or when the server froze the player) the state is
//!   interpolated between the current and next snapshot.
//! - Otherwise the newest authoritative state is taken as a base and every
//!   buffered user command the server has not yet applied is replayed
//!   through the shared movement routine.
//!
//! Differences between what was predicted last frame and what the replay
//! produces at the same command time are kept as a decaying view offset
//! instead of being snapped.

use snapnet_shared::math::{lerp_angle, Vec3};
use snapnet_shared::pmove::MovementSimulator;
use snapnet_shared::protocol::CMD_BACKUP;
use snapnet_shared::state::{
    CameraFlags, EntityFlags, EntityState, PlayerState, PmFlags, ENTITYNUM_WORLD,
};
use tracing::{debug, trace};

use crate::input::CommandBuffer;

/// A snapshot as seen by the predictor.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotView<'a> {
    pub message_num: i32,
    pub server_time: i32,
    pub ps: &'a PlayerState,
    /// Sorted by entity number.
    pub entities: &'a [EntityState],
}

impl<'a> SnapshotView<'a> {
    fn entity(&self, number: u16) -> Option<&'a EntityState> {
        self.entities
            .binary_search_by_key(&number, |e| e.number)
            .ok()
            .map(|i| &self.entities[i])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PredictionInput<'a> {
    pub current: SnapshotView<'a>,
    pub next: Option<SnapshotView<'a>>,
    pub commands: &'a CommandBuffer,
    /// Client's estimate of server time.
    pub time: i32,
}

pub struct Predictor {
    simulator: Box<dyn MovementSimulator>,
    predict: bool,
    error_decay: i32,

    predicted: PlayerState,
    valid: bool,
    physics_time: i32,
    frame_interpolation: f32,

    teleport_this_frame: bool,
    teleport_next_frame: bool,
    camera_cut_next_frame: bool,
    last_transition: Option<(i32, EntityFlags)>,

    predicted_error: Vec3,
    predicted_error_time: i32,
    last_time: i32,
}

fn toggled(a: EntityFlags, b: EntityFlags, bit: EntityFlags) -> bool {
    (a ^ b).intersects(bit)
}

impl Predictor {
    pub fn new(simulator: Box<dyn MovementSimulator>, predict: bool, error_decay_ms: u32) -> Self {
        Self {
            simulator,
            predict,
            error_decay: error_decay_ms as i32,
            predicted: PlayerState::default(),
            valid: false,
            physics_time: 0,
            frame_interpolation: 0.0,
            teleport_this_frame: false,
            teleport_next_frame: false,
            camera_cut_next_frame: false,
            last_transition: None,
            predicted_error: Vec3::ZERO,
            predicted_error_time: 0,
            last_time: 0,
        }
    }

    pub fn set_predict(&mut self, predict: bool) {
        self.predict = predict;
    }

    pub fn predicted(&self) -> &PlayerState {
        &self.predicted
    }

    pub fn physics_time(&self) -> i32 {
        self.physics_time
    }

    pub fn frame_interpolation(&self) -> f32 {
        self.frame_interpolation
    }

    pub fn teleport_this_frame(&self) -> bool {
        self.teleport_this_frame
    }

    pub fn teleport_next_frame(&self) -> bool {
        self.teleport_next_frame
    }

    pub fn camera_cut_next_frame(&self) -> bool {
        self.camera_cut_next_frame
    }

    pub fn predicted_error(&self) -> Vec3 {
        self.predicted_error
    }

    /// Forgets everything; the next update starts from the snapshot.
    pub fn reset(&mut self) {
        self.valid = false;
        self.last_transition = None;
        self.teleport_this_frame = false;
        self.teleport_next_frame = false;
        self.camera_cut_next_frame = false;
        self.predicted_error = Vec3::ZERO;
    }

    /// Render origin: predicted origin plus the decaying error offset.
    pub fn view_origin(&self, time: i32) -> Vec3 {
        if self.error_decay <= 0 {
            return self.predicted.origin;
        }
        let t = time - self.predicted_error_time;
        let f = (self.error_decay - t) as f32 / self.error_decay as f32;
        if f > 0.0 && f < 1.0 {
            self.predicted.origin.mul_add(self.predicted_error, f)
        } else {
            self.predicted.origin
        }
    }

    fn transition(&mut self, input: &PredictionInput<'_>) {
        let cur = input.current;
        let flags = cur.ps.e_flags;
        match self.last_transition {
            Some((msg, _)) if msg == cur.message_num => {}
            Some((_, old_flags)) => {
                self.teleport_this_frame = self.teleport_next_frame
                    || toggled(old_flags, flags, EntityFlags::TELEPORT_BIT);
                self.last_transition = Some((cur.message_num, flags));
            }
            None => {
                self.teleport_this_frame = true;
                self.last_transition = Some((cur.message_num, flags));
            }
        }

        match input.next {
            Some(next) => {
                self.teleport_next_frame =
                    toggled(flags, next.ps.e_flags, EntityFlags::TELEPORT_BIT);
                self.camera_cut_next_frame = (cur.ps.camera_flags ^ next.ps.camera_flags)
                    .contains(CameraFlags::CAMERA_CUT_BIT);
            }
            None => {
                self.teleport_next_frame = false;
                self.camera_cut_next_frame = false;
            }
        }
    }

    fn interpolation_fraction(&self, input: &PredictionInput<'_>) -> f32 {
        match input.next {
            Some(next) if next.server_time > input.current.server_time => {
                let span = (next.server_time - input.current.server_time) as f32;
                ((input.time - input.current.server_time) as f32 / span).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Produces the player state for this frame.
    pub fn update(&mut self, input: &PredictionInput<'_>) -> &PlayerState {
        self.transition(input);
        self.frame_interpolation = self.interpolation_fraction(input);

        let ps = input.current.ps;
        let frozen = ps.pm_flags.intersects(PmFlags::FROZEN | PmFlags::FOLLOW | PmFlags::NO_PREDICTION);
        if !self.predict || frozen {
            self.interpolate(input);
        } else {
            self.replay(input);
        }
        self.last_time = input.time;
        &self.predicted
    }

    fn interpolate(&mut self, input: &PredictionInput<'_>) {
        let cur = input.current;
        let mut out = cur.ps.clone();
        self.physics_time = cur.server_time;

        if let Some(next) = input.next.filter(|_| !self.teleport_next_frame) {
            let f = self.frame_interpolation;
            out.origin = cur.ps.origin + (next.ps.origin - cur.ps.origin) * f;
            out.velocity = cur.ps.velocity + (next.ps.velocity - cur.ps.velocity) * f;
            for i in 0..3 {
                out.viewangles[i] = lerp_angle(cur.ps.viewangles[i], next.ps.viewangles[i], f);
            }
            let from = cur.ps.bob_cycle as f32;
            let mut to = next.ps.bob_cycle as f32;
            if to < from {
                to += 256.0;
            }
            out.bob_cycle = (from + f * (to - from)) as u32 as u8;
        }

        self.predicted = out;
        self.valid = true;
    }

    fn replay(&mut self, input: &PredictionInput<'_>) {
        let cur = input.current;
        let cmds = input.commands;
        let current = cmds.cmd_number();

        let old = if self.valid {
            self.predicted.clone()
        } else {
            cur.ps.clone()
        };

        let oldest = current - CMD_BACKUP as i32 + 1;
        if let Some(oldest_cmd) = cmds.get(oldest) {
            if oldest_cmd.server_time > cur.ps.command_time && oldest_cmd.server_time < input.time {
                debug!(
                    oldest = oldest_cmd.server_time,
                    command_time = cur.ps.command_time,
                    "exceeded command backup"
                );
                return;
            }
        }
        let Some(latest) = cmds.get(current).copied() else {
            self.interpolate(input);
            return;
        };

        let base = match input.next {
            Some(next) if !self.teleport_next_frame && !self.teleport_this_frame => next,
            _ => cur,
        };
        self.predicted = base.ps.clone();
        self.physics_time = base.server_time;

        let mut moved = false;
        for n in oldest.max(1)..=current {
            let Some(cmd) = cmds.get(n) else {
                continue;
            };
            if cmd.server_time <= self.predicted.command_time {
                continue;
            }
            if cmd.server_time > latest.server_time {
                continue;
            }

            if self.predicted.command_time == old.command_time {
                if self.teleport_this_frame {
                    self.predicted_error = Vec3::ZERO;
                    self.teleport_this_frame = false;
                } else {
                    let delta = old.origin - self.predicted.origin;
                    if delta.len() > 0.1 {
                        self.decay_error(input.time);
                        self.predicted_error = self.predicted_error + delta;
                        self.predicted_error_time = self.last_time;
                        trace!(error = delta.len(), "prediction miss");
                    }
                }
            }

            self.simulator.simulate(&mut self.predicted, cmd);
            moved = true;
        }

        if !moved {
            trace!("not moved");
        }

        self.adjust_for_mover(input, base);
        self.valid = true;
    }

    fn decay_error(&mut self, time: i32) {
        if self.error_decay <= 0 {
            self.predicted_error = Vec3::ZERO;
            return;
        }
        let t = time - self.predicted_error_time;
        let f = (self.error_decay - t) as f32 / self.error_decay as f32;
        if f > 0.0 {
            self.predicted_error = self.predicted_error * f;
        } else {
            self.predicted_error = Vec3::ZERO;
        }
    }

    /// Pulls a player standing on a moving entity back along the mover's
    /// path, since the replay base is the next snapshot.
    fn adjust_for_mover(&mut self, input: &PredictionInput<'_>, base: SnapshotView<'_>) {
        let Some(next) = input.next else {
            return;
        };
        if base.message_num != next.message_num {
            return;
        }
        let Some(ground) = self.predicted.ground_entity() else {
            return;
        };
        if ground == ENTITYNUM_WORLD {
            return;
        }
        let (Some(cur_ent), Some(next_ent)) = (input.current.entity(ground), next.entity(ground))
        else {
            return;
        };
        let delta = next_ent.origin - cur_ent.origin;
        self.predicted.origin = self
            .predicted
            .origin
            .mul_add(delta, self.frame_interpolation - 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapnet_shared::math::angle_to_short;
    use snapnet_shared::pmove::GroundMovement;
    use snapnet_shared::state::{UserCommand, ENTITYNUM_NONE};

    fn predictor(predict: bool) -> Predictor {
        Predictor::new(Box::new(GroundMovement::default()), predict, 100)
    }

    fn walk(buf: &mut CommandBuffer, from: i32, to: i32, step: i32) {
        let mut t = from;
        while t <= to {
            buf.push(UserCommand {
                server_time: t,
                forward: 127,
                angles: [0, angle_to_short(0.0), 0],
                ..UserCommand::default()
            });
            t += step;
        }
    }

    fn standing(command_time: i32) -> PlayerState {
        PlayerState {
            command_time,
            ground_entity_num: ENTITYNUM_NONE,
            ..PlayerState::default()
        }
    }

    fn view<'a>(msg: i32, time: i32, ps: &'a PlayerState, ents: &'a [EntityState]) -> SnapshotView<'a> {
        SnapshotView {
            message_num: msg,
            server_time: time,
            ps,
            entities: ents,
        }
    }

    #[test]
    fn replays_commands_after_snapshot_time() {
        let mut buf = CommandBuffer::new();
        walk(&mut buf, 16, 320, 16);
        let ps = standing(160);

        let mut p = predictor(true);
        let input = PredictionInput {
            current: view(1, 160, &ps, &[]),
            next: None,
            commands: &buf,
            time: 320,
        };
        let out = p.update(&input).clone();
        assert_eq!(out.command_time, 320);
        assert!(out.origin.x > 0.0);
    }

    #[test]
    fn replay_is_deterministic() {
        let mut buf = CommandBuffer::new();
        walk(&mut buf, 16, 800, 16);
        let ps = standing(0);
        let input = PredictionInput {
            current: view(1, 0, &ps, &[]),
            next: None,
            commands: &buf,
            time: 800,
        };
        let a = predictor(true).update(&input).clone();
        let b = predictor(true).update(&input).clone();
        assert_eq!(a, b);
        assert_eq!(a.origin.x.to_bits(), b.origin.x.to_bits());
    }

    #[test]
    fn interpolates_without_prediction() {
        let buf = CommandBuffer::new();
        let mut a = standing(100);
        a.origin = Vec3::new(0.0, 0.0, 0.0);
        a.viewangles = Vec3::new(0.0, 350.0, 0.0);
        a.bob_cycle = 250;
        let mut b = standing(150);
        b.origin = Vec3::new(100.0, 0.0, 0.0);
        b.viewangles = Vec3::new(0.0, 10.0, 0.0);
        b.bob_cycle = 6;

        let mut p = predictor(false);
        let out = p
            .update(&PredictionInput {
                current: view(1, 100, &a, &[]),
                next: Some(view(2, 150, &b, &[])),
                commands: &buf,
                time: 125,
            })
            .clone();
        assert_eq!(out.origin.x, 50.0);
        // shortest way round through 0
        assert_eq!(out.viewangles.y, 360.0);
        // 250 -> 262 wraps to 0
        assert_eq!(out.bob_cycle, 0);
    }

    #[test]
    fn frozen_player_is_interpolated() {
        let mut buf = CommandBuffer::new();
        walk(&mut buf, 16, 320, 16);
        let mut ps = standing(0);
        ps.pm_flags = PmFlags::FROZEN;
        let mut p = predictor(true);
        let out = p
            .update(&PredictionInput {
                current: view(1, 0, &ps, &[]),
                next: None,
                commands: &buf,
                time: 320,
            })
            .clone();
        assert_eq!(out, ps);
    }

    #[test]
    fn teleport_flags_follow_toggles() {
        let buf = CommandBuffer::new();
        let a = standing(0);
        let mut b = standing(50);
        b.e_flags = EntityFlags::TELEPORT_BIT;
        b.camera_flags = CameraFlags::CAMERA_CUT_BIT;

        let mut p = predictor(false);
        p.update(&PredictionInput {
            current: view(1, 0, &a, &[]),
            next: Some(view(2, 50, &b, &[])),
            commands: &buf,
            time: 10,
        });
        assert!(p.teleport_next_frame());
        assert!(p.camera_cut_next_frame());

        p.update(&PredictionInput {
            current: view(2, 50, &b, &[]),
            next: None,
            commands: &buf,
            time: 60,
        });
        assert!(p.teleport_this_frame());
        assert!(!p.teleport_next_frame());
    }

    #[test]
    fn teleport_clears_prediction_error() {
        let mut buf = CommandBuffer::new();
        walk(&mut buf, 16, 160, 16);
        let mut p = predictor(true);

        let a = standing(0);
        p.update(&PredictionInput {
            current: view(1, 0, &a, &[]),
            next: None,
            commands: &buf,
            time: 160,
        });

        // server moved the player far away and toggled the teleport bit
        let mut b = standing(80);
        b.origin = Vec3::new(5000.0, 0.0, 0.0);
        b.e_flags = EntityFlags::TELEPORT_BIT;
        walk(&mut buf, 176, 176, 16);
        p.update(&PredictionInput {
            current: view(2, 80, &b, &[]),
            next: None,
            commands: &buf,
            time: 176,
        });
        assert_eq!(p.predicted_error(), Vec3::ZERO);
        assert!(p.predicted().origin.x > 5000.0);
    }

    #[test]
    fn misprediction_becomes_decaying_error() {
        let mut buf = CommandBuffer::new();
        walk(&mut buf, 16, 160, 16);
        let mut p = predictor(true);

        let a = standing(0);
        p.update(&PredictionInput {
            current: view(1, 0, &a, &[]),
            next: None,
            commands: &buf,
            time: 160,
        });
        let first = p.predicted().clone();

        // authoritative state at 160 differs by 8 units
        let mut b = first.clone();
        b.origin.y += 8.0;
        walk(&mut buf, 176, 176, 16);
        p.update(&PredictionInput {
            current: view(2, 160, &b, &[]),
            next: None,
            commands: &buf,
            time: 176,
        });
        let err = p.predicted_error();
        assert!((err.y + 8.0).abs() < 1e-3, "{err:?}");
        // the view is pulled back toward the old prediction, then settles
        assert!(p.view_origin(170).y < p.predicted().origin.y);
        assert_eq!(p.view_origin(1000), p.predicted().origin);
    }

    #[test]
    fn ground_mover_offsets_prediction() {
        let mut buf = CommandBuffer::new();
        buf.push(UserCommand {
            server_time: 100,
            ..UserCommand::default()
        });

        let mut mover_a = EntityState::with_number(40);
        mover_a.origin = Vec3::new(0.0, 0.0, 0.0);
        let mut mover_b = mover_a.clone();
        mover_b.origin = Vec3::new(32.0, 0.0, 0.0);
        let cur_ents = [mover_a];
        let next_ents = [mover_b];

        let mut cur = standing(50);
        cur.ground_entity_num = 40;
        let mut next = standing(100);
        next.ground_entity_num = 40;
        next.origin = Vec3::new(32.0, 0.0, 0.0);

        let mut p = predictor(true);
        // first update marks a teleport, settle on a second frame
        let input = PredictionInput {
            current: view(1, 50, &cur, &cur_ents),
            next: Some(view(2, 100, &next, &next_ents)),
            commands: &buf,
            time: 75,
        };
        p.update(&input);
        let out = p.update(&input).clone();
        // halfway between frames, half of the mover's travel is undone
        assert_eq!(out.origin.x, 16.0);
    }
}
