//! Snapshot history and entity baselines.
//!
//! Snapshots live in a [`PACKET_BACKUP`] deep ring keyed by message number.
//! Their entities are not stored inline: each snapshot points at a run of the
//! parse entity arena, which is shared by all frames and overwritten as new
//! frames arrive. A delta is only trusted when its base frame is still
//! resident and its entities have not been overwritten.

use std::fmt;

use snapnet_shared::delta::DeltaCodec;
use snapnet_shared::error::NetResult;
use snapnet_shared::msg::BitReader;
use snapnet_shared::protocol::{MAX_PARSE_ENTITIES, PACKET_BACKUP, PARSE_ENTITIES_MARGIN};
use snapnet_shared::ring::{ArenaRing, ParseIndex, SequenceRing};
use snapnet_shared::state::{EntityState, PlayerState, ServerSound, SnapFlags, MAX_GENTITIES};
use tracing::{debug, trace};

/// One received server frame.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub valid: bool,
    pub snap_flags: SnapFlags,
    pub server_time: i32,
    pub server_time_residual: u8,
    pub message_num: i32,
    /// Frame this one was delta compressed against, `None` for a full frame.
    pub delta_num: Option<i32>,
    pub area_mask: Vec<u8>,
    pub ps: PlayerState,
    pub first_entity: ParseIndex,
    pub num_entities: usize,
    /// Reliable server command sequence when the frame was built.
    pub server_command_num: i32,
    /// Round trip of the user command this frame acknowledges, if known.
    pub ping: Option<i32>,
    pub sounds: Vec<ServerSound>,
}

/// Why a delta snapshot cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaRejection {
    /// The base frame was never stored or has been invalidated.
    InvalidFrame,
    /// The base frame's slot now holds another message.
    FrameTooOld,
    /// The base frame's entities were overwritten in the parse arena.
    ParseEntitiesTooOld,
}

impl fmt::Display for DeltaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeltaRejection::InvalidFrame => "delta from invalid frame",
            DeltaRejection::FrameTooOld => "delta frame too old",
            DeltaRejection::ParseEntitiesTooOld => "delta parse entities too old",
        })
    }
}

/// Received frames, their entities and the per-entity baselines.
pub struct SnapshotHistory {
    frames: SequenceRing<Snapshot>,
    entities: ArenaRing<EntityState>,
    next_parse: ParseIndex,
    baselines: Vec<EntityState>,
    latest: Option<i32>,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self {
            frames: SequenceRing::new(PACKET_BACKUP),
            entities: ArenaRing::new(MAX_PARSE_ENTITIES),
            next_parse: ParseIndex::default(),
            baselines: (0..MAX_GENTITIES)
                .map(|n| EntityState::with_number(n as u16))
                .collect(),
            latest: None,
        }
    }

    /// Forgets every frame and baseline (new gamestate).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_baseline(&mut self, es: EntityState) {
        let n = es.number as usize;
        if n < MAX_GENTITIES {
            self.baselines[n] = es;
        }
    }

    pub fn baseline(&self, number: u16) -> &EntityState {
        &self.baselines[number as usize % MAX_GENTITIES]
    }

    pub fn frame(&self, message_num: i32) -> Option<&Snapshot> {
        self.frames.get(message_num)
    }

    /// The newest valid frame.
    pub fn current(&self) -> Option<&Snapshot> {
        self.latest
            .and_then(|n| self.frames.get(n))
            .filter(|s| s.valid)
    }

    pub fn next_parse_index(&self) -> ParseIndex {
        self.next_parse
    }

    /// Checks that `delta_num` is a usable base.
    pub fn check_delta(&self, delta_num: i32) -> Result<&Snapshot, DeltaRejection> {
        let Some(old) = self.frames.get(delta_num) else {
            return Err(if self.frames.capacity() as i64 <= self.distance_to(delta_num) {
                DeltaRejection::FrameTooOld
            } else {
                DeltaRejection::InvalidFrame
            });
        };
        if !old.valid {
            return Err(DeltaRejection::InvalidFrame);
        }
        if self.next_parse.since(old.first_entity) > MAX_PARSE_ENTITIES - PARSE_ENTITIES_MARGIN {
            return Err(DeltaRejection::ParseEntitiesTooOld);
        }
        Ok(old)
    }

    fn distance_to(&self, message_num: i32) -> i64 {
        self.latest
            .map_or(0, |l| l as i64 - message_num as i64)
    }

    /// Entities of `snap`, in ascending entity number order.
    pub fn entities<'a>(&'a self, snap: &Snapshot) -> impl Iterator<Item = &'a EntityState> + 'a {
        let first = snap.first_entity;
        (0..snap.num_entities).map(move |i| self.entities.get(first.offset(i)))
    }

    fn push_entity(&mut self, frame: &mut Snapshot, es: EntityState) {
        self.entities.set(self.next_parse, es);
        self.next_parse = self.next_parse.next();
        frame.num_entities += 1;
    }

    /// Reads the entity list of `frame`, merging it with the entities of
    /// `old` (the delta base) in ascending number order.
    ///
    /// Entities the server did not mention are carried over from `old`;
    /// entities new to the frame start from their baseline.
    pub fn read_entities(
        &mut self,
        r: &mut BitReader<'_>,
        codec: &DeltaCodec,
        old: Option<(ParseIndex, usize)>,
        frame: &mut Snapshot,
    ) -> NetResult<()> {
        frame.first_entity = self.next_parse;
        frame.num_entities = 0;

        let (old_first, old_count) = old.unwrap_or_default();
        let mut old_index = 0usize;
        let old_num = |h: &Self, i: usize| -> u32 {
            if i < old_count {
                h.entities.get(old_first.offset(i)).number as u32
            } else {
                u32::MAX
            }
        };

        loop {
            let new_num = codec.read_entity_number(r)?;
            if new_num as usize == MAX_GENTITIES - 1 {
                break;
            }
            let new_num32 = new_num as u32;

            while old_num(self, old_index) < new_num32 {
                let es = self.entities.get(old_first.offset(old_index)).clone();
                trace!(number = es.number, "unchanged");
                self.push_entity(frame, es);
                old_index += 1;
            }

            let base = if old_num(self, old_index) == new_num32 {
                let es = self.entities.get(old_first.offset(old_index)).clone();
                old_index += 1;
                es
            } else {
                self.baselines[new_num as usize].clone()
            };

            match codec.read_entity(r, &base, new_num)? {
                Some(es) => self.push_entity(frame, es),
                None => trace!(number = new_num, "removed"),
            }
        }

        while old_index < old_count {
            let es = self.entities.get(old_first.offset(old_index)).clone();
            self.push_entity(frame, es);
            old_index += 1;
        }
        Ok(())
    }

    /// Stores a parsed frame. Slots skipped since the previous frame are
    /// invalidated so nothing can delta against them later.
    pub fn store(&mut self, frame: Snapshot) {
        if !frame.valid {
            return;
        }
        let new_num = frame.message_num;
        let mut old_num = self.latest.map_or(new_num, |l| l + 1);
        if new_num - old_num >= PACKET_BACKUP as i32 {
            old_num = new_num - (PACKET_BACKUP as i32 - 1);
        }
        while old_num < new_num {
            if let Some(stale) = self.frames.slot_mut(old_num) {
                stale.valid = false;
            }
            old_num += 1;
        }
        debug!(
            message_num = new_num,
            delta_num = ?frame.delta_num,
            entities = frame.num_entities,
            "stored snapshot"
        );
        self.frames.insert(new_num, frame);
        self.latest = Some(new_num);
    }

    /// The frames bracketing `server_time`: the newest one at or before it
    /// and the oldest one after it.
    pub fn interpolation_pair(&self, server_time: i32) -> (Option<&Snapshot>, Option<&Snapshot>) {
        let Some(latest) = self.latest else {
            return (None, None);
        };
        let mut current: Option<&Snapshot> = None;
        let mut next: Option<&Snapshot> = None;
        for n in (latest - PACKET_BACKUP as i32 + 1..=latest).rev() {
            let Some(snap) = self.frames.get(n).filter(|s| s.valid) else {
                continue;
            };
            if self.next_parse.since(snap.first_entity) > MAX_PARSE_ENTITIES {
                break;
            }
            if snap.server_time <= server_time {
                current = Some(snap);
                break;
            }
            next = Some(snap);
        }
        (current, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapnet_shared::math::Vec3;
    use snapnet_shared::msg::BitWriter;
    use snapnet_shared::protocol::strategy_for;

    fn codec() -> DeltaCodec {
        strategy_for(8).unwrap().delta_codec(0.0)
    }

    fn entity(n: u16, x: f32) -> EntityState {
        let mut es = EntityState::with_number(n);
        es.origin = Vec3::new(x, 0.0, 0.0);
        es.modelindex = 1;
        es
    }

    fn frame(history: &mut SnapshotHistory, num: i32, old: Option<i32>, bytes: &[u8]) -> Snapshot {
        let old = old
            .and_then(|n| history.frame(n))
            .map(|s| (s.first_entity, s.num_entities));
        let mut snap = Snapshot {
            valid: true,
            message_num: num,
            server_time: num * 50,
            ..Snapshot::default()
        };
        history
            .read_entities(&mut BitReader::new(bytes), &codec(), old, &mut snap)
            .unwrap();
        snap
    }

    fn stored(history: &SnapshotHistory, num: i32) -> Vec<EntityState> {
        let snap = history.frame(num).unwrap().clone();
        history.entities(&snap).cloned().collect()
    }

    fn full_frame(ents: &[EntityState]) -> Vec<u8> {
        let c = codec();
        let mut w = BitWriter::new();
        for es in ents {
            c.write_entity(&mut w, &EntityState::with_number(es.number), es, true)
                .unwrap();
        }
        c.write_entity_end(&mut w).unwrap();
        w.finish().to_vec()
    }

    #[test]
    fn empty_delta_carries_every_old_entity() {
        let mut h = SnapshotHistory::new();
        let ents = [entity(3, 10.0), entity(8, 20.0), entity(500, 30.0)];
        let a = frame(&mut h, 1, None, &full_frame(&ents));
        h.store(a);

        let mut w = BitWriter::new();
        codec().write_entity_end(&mut w).unwrap();
        let b = frame(&mut h, 2, Some(1), &w.finish());
        h.store(b);

        assert_eq!(stored(&h, 2), ents.to_vec());
    }

    #[test]
    fn merge_handles_change_insert_and_removal() {
        let c = codec();
        let mut h = SnapshotHistory::new();
        let a_ents = [entity(3, 10.0), entity(8, 20.0), entity(12, 30.0)];
        let a = frame(&mut h, 1, None, &full_frame(&a_ents));
        h.store(a);

        // 3 unchanged (omitted), 5 new, 8 moved, 12 removed
        let mut w = BitWriter::new();
        c.write_entity(&mut w, h.baseline(5), &entity(5, 1.0), true)
            .unwrap();
        c.write_entity(&mut w, &a_ents[1], &entity(8, 25.0), false)
            .unwrap();
        c.write_entity_removal(&mut w, 12).unwrap();
        c.write_entity_end(&mut w).unwrap();
        let b = frame(&mut h, 2, Some(1), &w.finish());
        h.store(b);

        let got = stored(&h, 2);
        let numbers: Vec<u16> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![3, 5, 8]);
        assert_eq!(got[0], a_ents[0]);
        assert_eq!(got[1].origin.x, 1.0);
        assert_eq!(got[2].origin.x, 25.0);
    }

    #[test]
    fn removed_entity_reappears_from_baseline() {
        let c = codec();
        let mut h = SnapshotHistory::new();
        let base = entity(7, 42.0);
        h.set_baseline(base.clone());

        // full frame: 7 identical to its baseline, only the header goes out
        let mut w = BitWriter::new();
        c.write_entity(&mut w, &base, &base, true).unwrap();
        c.write_entity_end(&mut w).unwrap();
        let a = frame(&mut h, 1, None, &w.finish());
        h.store(a);
        assert_eq!(stored(&h, 1), vec![base.clone()]);

        let mut w = BitWriter::new();
        c.write_entity_removal(&mut w, 7).unwrap();
        c.write_entity_end(&mut w).unwrap();
        let b = frame(&mut h, 2, Some(1), &w.finish());
        h.store(b);
        assert!(stored(&h, 2).is_empty());

        let mut w = BitWriter::new();
        c.write_entity(&mut w, &base, &base, true).unwrap();
        c.write_entity_end(&mut w).unwrap();
        let d = frame(&mut h, 3, Some(2), &w.finish());
        h.store(d);
        assert_eq!(stored(&h, 3), vec![base]);
    }

    #[test]
    fn delta_checks() {
        let mut h = SnapshotHistory::new();
        let a = frame(&mut h, 1, None, &full_frame(&[]));
        h.store(a);
        assert!(h.check_delta(1).is_ok());
        assert_eq!(h.check_delta(2).unwrap_err(), DeltaRejection::InvalidFrame);

        let late = frame(&mut h, 40, None, &full_frame(&[]));
        h.store(late);
        // slot of frame 1 was skipped over by the gap
        assert_eq!(h.check_delta(1).unwrap_err(), DeltaRejection::InvalidFrame);
        assert_eq!(h.check_delta(8).unwrap_err(), DeltaRejection::FrameTooOld);
        assert!(h.check_delta(40).is_ok());
    }

    #[test]
    fn parse_entities_overrun_rejects_delta() {
        let mut h = SnapshotHistory::new();
        let many: Vec<EntityState> = (0..400).map(|n| entity(n, n as f32)).collect();
        let bytes = full_frame(&many);
        let a = frame(&mut h, 1, None, &bytes);
        h.store(a);
        for n in 2..=6 {
            let f = frame(&mut h, n, None, &bytes);
            h.store(f);
        }
        assert_eq!(
            h.check_delta(1).unwrap_err(),
            DeltaRejection::ParseEntitiesTooOld
        );
        assert!(h.check_delta(5).is_ok());
    }

    #[test]
    fn invalid_frames_are_not_stored() {
        let mut h = SnapshotHistory::new();
        h.store(Snapshot {
            valid: false,
            message_num: 3,
            ..Snapshot::default()
        });
        assert!(h.frame(3).is_none());
        assert!(h.current().is_none());
    }

    #[test]
    fn interpolation_pair_brackets_time() {
        let mut h = SnapshotHistory::new();
        for n in 1..=4 {
            let f = frame(&mut h, n, None, &full_frame(&[]));
            h.store(f);
        }
        // frames at 50, 100, 150, 200
        let (cur, next) = h.interpolation_pair(120);
        assert_eq!(cur.unwrap().message_num, 2);
        assert_eq!(next.unwrap().message_num, 3);

        let (cur, next) = h.interpolation_pair(500);
        assert_eq!(cur.unwrap().message_num, 4);
        assert!(next.is_none());

        let (cur, next) = h.interpolation_pair(10);
        assert!(cur.is_none());
        assert_eq!(next.unwrap().message_num, 1);
    }
}
