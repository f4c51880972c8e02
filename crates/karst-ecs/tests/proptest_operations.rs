//! Property tests for operation recording and replay.
//!
//! Random valid operations are generated, replayed against two equivalent
//! worlds, and the post-states are compared via their snapshot streams --
//! replay must be deterministic.

use karst_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C)]
struct Hp {
    value: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C)]
struct Score {
    value: i64,
}

#[derive(Debug, Clone)]
enum OpStep {
    Create(u32),
    AddHp(u32),
    SetHp(u32),
    RemoveHp,
    AddScoreBatch(i64),
    SelectCreated(u32),
    ClearThenCreate,
    ParentToCreated(u32),
    ReferenceCreated(u32),
    DestroyFirstSelected,
}

fn op_step_strategy() -> impl Strategy<Value = OpStep> {
    prop_oneof![
        (1..4u32).prop_map(OpStep::Create),
        any::<u32>().prop_map(OpStep::AddHp),
        any::<u32>().prop_map(OpStep::SetHp),
        Just(OpStep::RemoveHp),
        any::<i64>().prop_map(OpStep::AddScoreBatch),
        (0..8u32).prop_map(OpStep::SelectCreated),
        Just(OpStep::ClearThenCreate),
        (0..8u32).prop_map(OpStep::ParentToCreated),
        (0..8u32).prop_map(OpStep::ReferenceCreated),
        Just(OpStep::DestroyFirstSelected),
    ]
}

fn setup_world() -> World {
    let mut world = World::new();
    world.register_component::<Hp>().unwrap();
    world.register_component::<Score>().unwrap();
    world
}

/// Tracks enough state while recording to keep the operation valid by
/// construction: which components the current selection is known to carry,
/// whether any destroy may have left stale entities behind, and how large the
/// created-history is.
struct Recorder {
    op: Operation,
    selection_len: usize,
    created: usize,
    /// The selection was formed from fresh creations, so its component set
    /// is known exactly.
    selection_known: bool,
    selection_has_hp: bool,
    /// A destroy may have cascaded into the current selection.
    selection_stale: bool,
    /// No destroy has happened yet, so every created-history entry is alive.
    created_clean: bool,
}

impl Recorder {
    fn new() -> Self {
        let mut op = Operation::new();
        op.create_entity();
        Self {
            op,
            selection_len: 1,
            created: 1,
            selection_known: true,
            selection_has_hp: false,
            selection_stale: false,
            created_clean: true,
        }
    }

    fn fresh_batch(&mut self, count: u32) {
        self.op.create_entities(count);
        self.selection_len = count as usize;
        self.created += count as usize;
        self.selection_known = true;
        self.selection_has_hp = false;
        self.selection_stale = false;
    }

    fn usable_selection(&self) -> bool {
        self.selection_len > 0 && !self.selection_stale
    }

    fn apply(&mut self, schema: &Schema, step: &OpStep) {
        match step {
            OpStep::Create(count) => self.fresh_batch(*count),
            OpStep::AddHp(value) => {
                if self.usable_selection() && self.selection_known && !self.selection_has_hp {
                    self.op.add_component(schema, Hp { value: *value }).unwrap();
                    self.selection_has_hp = true;
                }
            }
            OpStep::SetHp(value) => {
                if self.usable_selection() && self.selection_known && self.selection_has_hp {
                    self.op.set_component(schema, Hp { value: *value }).unwrap();
                }
            }
            OpStep::RemoveHp => {
                if self.usable_selection() && self.selection_known && self.selection_has_hp {
                    self.op.remove_component::<Hp>(schema).unwrap();
                    self.selection_has_hp = false;
                }
            }
            OpStep::AddScoreBatch(value) => {
                self.fresh_batch(1);
                self.op.add_component(schema, Score { value: *value }).unwrap();
                self.op.add_component(schema, Hp { value: 1 }).unwrap();
                self.selection_has_hp = true;
            }
            OpStep::SelectCreated(offset) => {
                if self.created_clean && (*offset as usize) < self.created {
                    self.op.clear_selection();
                    self.op.select_created(*offset);
                    self.selection_len = 1;
                    // The re-selected entity's component set is unknown here,
                    // so later component commands are skipped.
                    self.selection_known = false;
                    self.selection_stale = false;
                }
            }
            OpStep::ClearThenCreate => {
                self.op.clear_selection();
                self.fresh_batch(1);
            }
            OpStep::ParentToCreated(offset) => {
                if self.usable_selection() && self.created_clean && (*offset as usize) < self.created {
                    self.op.set_parent_to_created(*offset);
                }
            }
            OpStep::ReferenceCreated(offset) => {
                if self.usable_selection() && self.created_clean && (*offset as usize) < self.created {
                    self.op.add_reference_to_created(*offset);
                }
            }
            OpStep::DestroyFirstSelected => {
                if self.usable_selection() {
                    self.op.destroy_selection_range(0, 1);
                    self.selection_len -= 1;
                    // The destroy cascades through children, so both the rest
                    // of the selection and the created-history may now hold
                    // dead entities.
                    self.selection_stale = true;
                    self.created_clean = false;
                }
            }
        }
    }
}

fn build_operation(schema: &Schema, steps: &[OpStep]) -> Operation {
    let mut recorder = Recorder::new();
    for step in steps {
        recorder.apply(schema, step);
    }
    recorder.op
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Replaying one operation against two equivalent worlds produces
    /// byte-identical snapshots.
    #[test]
    fn replay_is_deterministic(steps in prop::collection::vec(op_step_strategy(), 0..30)) {
        let mut world_a = setup_world();
        let mut world_b = setup_world();
        let op = build_operation(world_a.schema(), &steps);

        let created_a = op.replay(&mut world_a).unwrap();
        let created_b = op.replay(&mut world_b).unwrap();

        prop_assert_eq!(created_a, created_b);
        prop_assert_eq!(world_a.capture_snapshot(), world_b.capture_snapshot());
    }

    /// A replay that fails validation leaves the world byte-identical to its
    /// pre-replay state.
    #[test]
    fn failed_validation_mutates_nothing(hp in any::<u32>()) {
        let mut world = setup_world();
        let seeded = world.create_entity().unwrap();
        world.add_component(seeded, Hp { value: hp }).unwrap();
        let before = world.capture_snapshot();

        let mut op = Operation::new();
        op.create_entity();
        op.clear_selection();
        // Requires a selection; validation must fail before the create runs.
        op.set_parent(Entity::NULL);

        prop_assert!(op.replay(&mut world).is_err());
        prop_assert_eq!(world.capture_snapshot(), before);
    }

    /// Replaying the same recorded operation twice against one world creates
    /// a second batch of entities with the same shape.
    #[test]
    fn replay_twice_doubles_entities(count in 1..5u32, hp in any::<u32>()) {
        let mut world = setup_world();
        let mut op = Operation::new();
        op.create_entities(count);
        op.add_component(world.schema(), Hp { value: hp }).unwrap();

        let first = op.replay(&mut world).unwrap();
        let second = op.replay(&mut world).unwrap();

        prop_assert_eq!(first.len(), count as usize);
        prop_assert_eq!(second.len(), count as usize);
        prop_assert_eq!(world.entity_count(), 2 * count as usize);
        for entity in first.iter().chain(second.iter()) {
            prop_assert_eq!(world.get_component::<Hp>(*entity).unwrap(), &Hp { value: hp });
        }
    }
}
