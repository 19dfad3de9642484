#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use fabula_core::{CommandId, DeltaAspect, EventAspects, LogIndex, Mutation};
use fabula_prophet::{Story, StoryTelling};

#[derive(Arbitrary, Debug)]
enum RingOp {
    Push,
    RemoveFront,
    ExtractSuffixAt(u8),
    Lookup(u8),
}

fn story(id: u64) -> Story {
    Story::new(
        CommandId::new(id),
        EventAspects::command(
            CommandId::new(id),
            DeltaAspect::mutate(Mutation::set("r", id.to_string())),
        ),
        LogIndex::new(id),
        Vec::new(),
    )
}

fuzz_target!(|ops: Vec<RingOp>| {
    let mut ring = StoryTelling::new();
    let mut live: Vec<u64> = Vec::new();
    let mut next_id = 0u64;

    for op in ops {
        match op {
            RingOp::Push => {
                next_id += 1;
                ring.push_back(story(next_id)).expect("fresh id links");
                live.push(next_id);
            }
            RingOp::RemoveFront => {
                if let Some(first) = ring.first() {
                    let removed = ring.remove(first).expect("front is extractable");
                    live.retain(|id| *id != removed.command_id.0);
                }
            }
            RingOp::ExtractSuffixAt(pick) => {
                if !live.is_empty() {
                    let id = live[pick as usize % live.len()];
                    let handle = ring.lookup(CommandId::new(id)).expect("live story indexed");
                    let removed = ring.extract_chain(handle, None).expect("suffix extracts");
                    for story in removed {
                        live.retain(|id| *id != story.command_id.0);
                    }
                }
            }
            RingOp::Lookup(pick) => {
                if !live.is_empty() {
                    let id = live[pick as usize % live.len()];
                    assert!(ring.lookup(CommandId::new(id)).is_some());
                }
            }
        }

        // Ring traversal and index must agree with the model after every
        // operation.
        let traversal: Vec<u64> = ring.iter().map(|(_, s)| s.command_id.0).collect();
        assert_eq!(traversal, live);
        assert_eq!(ring.len(), live.len());
    }
});
