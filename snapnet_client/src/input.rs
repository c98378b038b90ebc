//! Input handling.
//!
//! In a real client this would integrate with windowing, raw mouse/keyboard
//! and action bindings. Here it turns a sampled [`InputState`] into a
//! [`UserCommand`] and keeps the last [`CMD_BACKUP`] commands for prediction
//! and retransmission.

use snapnet_shared::math::{angle_to_short, Vec3};
use snapnet_shared::protocol::CMD_BACKUP;
use snapnet_shared::state::{Buttons, UserCommand};

/// User input state at a moment in time. Axes are in `-1..=1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
    pub up: f32,
    pub buttons: Buttons,
    /// Absolute view angles in degrees.
    pub view_angles: Vec3,
}

fn axis(v: f32) -> i8 {
    (v.clamp(-1.0, 1.0) * 127.0).round() as i8
}

/// Turns sampled input into a command stamped with `server_time`.
pub fn build_command(server_time: i32, input: &InputState) -> UserCommand {
    UserCommand {
        server_time,
        buttons: input.buttons,
        angles: [
            angle_to_short(input.view_angles.x),
            angle_to_short(input.view_angles.y),
            angle_to_short(input.view_angles.z),
        ],
        forward: axis(input.forward),
        right: axis(input.right),
        up: axis(input.up),
    }
}

/// Ring of generated commands indexed by command number.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    cmds: Vec<UserCommand>,
    /// Number of the newest command; 0 before the first one.
    cmd_number: i32,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            cmds: vec![UserCommand::default(); CMD_BACKUP],
            cmd_number: 0,
        }
    }

    pub fn cmd_number(&self) -> i32 {
        self.cmd_number
    }

    pub fn push(&mut self, cmd: UserCommand) -> i32 {
        self.cmd_number += 1;
        let slot = self.cmd_number as usize % CMD_BACKUP;
        self.cmds[slot] = cmd;
        self.cmd_number
    }

    /// Command `number`, if it is still in the ring.
    pub fn get(&self, number: i32) -> Option<&UserCommand> {
        if number <= 0 || number > self.cmd_number || self.cmd_number - number >= CMD_BACKUP as i32 {
            return None;
        }
        Some(&self.cmds[number as usize % CMD_BACKUP])
    }

    /// Oldest command number still in the ring.
    pub fn oldest(&self) -> i32 {
        (self.cmd_number - CMD_BACKUP as i32 + 1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_are_scaled_and_clamped() {
        let cmd = build_command(
            100,
            &InputState {
                forward: 1.0,
                right: -2.0,
                up: 0.5,
                view_angles: Vec3::new(0.0, 90.0, 0.0),
                ..InputState::default()
            },
        );
        assert_eq!(cmd.server_time, 100);
        assert_eq!(cmd.forward, 127);
        assert_eq!(cmd.right, -127);
        assert_eq!(cmd.up, 64);
        assert_eq!(cmd.angles[1], 16384);
    }

    #[test]
    fn buffer_forgets_old_commands() {
        let mut buf = CommandBuffer::new();
        assert!(buf.get(1).is_none());
        for t in 1..=(CMD_BACKUP as i32 + 10) {
            buf.push(UserCommand {
                server_time: t,
                ..UserCommand::default()
            });
        }
        let newest = buf.cmd_number();
        assert_eq!(buf.get(newest).unwrap().server_time, newest);
        assert!(buf.get(newest - CMD_BACKUP as i32).is_none());
        assert_eq!(buf.oldest(), newest - CMD_BACKUP as i32 + 1);
        assert_eq!(buf.get(buf.oldest()).unwrap().server_time, buf.oldest());
        assert!(buf.get(newest + 1).is_none());
    }
}
