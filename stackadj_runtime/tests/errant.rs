mod common;

use common::*;
use stackadj_runtime::{AppLoc, Options, ShadowMemory, StackTracker};
use stackadj_types::region::RegionBounds;
use stackadj_types::shadow::ShadowState::{Defined, Unaddressable};

fn tracker(options: Options) -> StackTracker {
    StackTracker::new(options, &RecordingWorld::default()).unwrap()
}

const LOC: AppLoc = AppLoc { pc: 0x40_5000 };

#[test]
fn heap_stack_gets_a_new_top() {
    let t = tracker(Options::default());
    let regions = Regions {
        heap: vec![RegionBounds::new(0x60_0000, 0x1_0000)],
        ..Regions::default()
    };
    let mut h = Harness::new(0x60_8000).with_regions(regions);
    h.shadow.set_range(0x60_0000, 0x61_0000, Defined);

    let (_, mut env) = h.split();
    assert!(t
        .handle_push_to_addressable(LOC, 0x60_8000, 0x60_8000, 8, &mut env)
        .unwrap());

    assert_eq!(h.shadow.state_at(0x60_7000), Unaddressable);
    assert_eq!(h.shadow.state_at(0x60_7FF8), Unaddressable);
    assert_eq!(h.shadow.state_at(0x60_6FF8), Defined);
    // the pushed bytes stay addressable
    assert_eq!(h.shadow.state_at(0x60_8000), Defined);

    let stats = t.stats();
    assert_eq!((stats.push_addressable, stats.push_addressable_heap), (1, 1));
    assert_eq!(stats.push_addressable_mmap, 0);
    // a 64k stack is larger than the threshold
    assert_eq!(t.threshold(), 0x9000);
}

#[test]
fn small_mapping_clamps_to_base_and_lowers_threshold() {
    let t = tracker(Options::default());
    let mut h = Harness::new(0x70_0800).with_regions(Regions::mapping(0x70_0000, 0x1000));
    h.shadow.set_range(0x70_0000, 0x70_1000, Defined);

    let (_, mut env) = h.split();
    assert!(t
        .handle_push_to_addressable(LOC, 0x70_0800, 0x70_0800, 8, &mut env)
        .unwrap());

    assert!(h.states(0x70_0000, 0x70_0800).iter().all(|&s| s == Unaddressable));
    assert_eq!(h.shadow.state_at(0x70_0800), Defined);
    assert_eq!(t.stats().push_addressable_mmap, 1);
    assert_eq!(t.threshold(), 2048);
    assert_eq!(h.world.suspends.get(), 1);
}

#[test]
fn unknown_region_reports_and_pauses() {
    let t = tracker(Options {
        pause_at_unaddressable: true,
        ..Options::default()
    });
    let mut h = Harness::new(0x90_0000);
    h.shadow.set_range(0x8F_0000, 0x91_0000, Defined);
    let before = h.states(0x8F_0000, 0x91_0000);

    let (_, mut env) = h.split();
    assert!(!t
        .handle_push_to_addressable(LOC, 0x90_0000, 0x90_0000, 8, &mut env)
        .unwrap());

    assert_eq!(h.states(0x8F_0000, 0x91_0000), before);
    assert_eq!(h.world.waits.borrow().len(), 1);
    let stats = t.stats();
    assert_eq!(stats.push_addressable, 1);
    assert_eq!(stats.push_addressable_heap + stats.push_addressable_mmap, 0);
}

#[test]
fn unknown_region_without_pause() {
    let t = tracker(Options::default());
    let mut h = Harness::new(0x90_0000);
    let (_, mut env) = h.split();
    assert!(!t
        .handle_push_to_addressable(LOC, 0x90_0000, 0x90_0000, 8, &mut env)
        .unwrap());
    assert!(h.world.waits.borrow().is_empty());
}

#[test]
fn disabled_check_only_counts() {
    let t = tracker(Options {
        check_push: false,
        ..Options::default()
    });
    let mut h = Harness::new(0x70_0800).with_regions(Regions::mapping(0x70_0000, 0x1000));
    let (_, mut env) = h.split();
    assert!(!t
        .handle_push_to_addressable(LOC, 0x70_0800, 0x70_0800, 8, &mut env)
        .unwrap());
    assert_eq!(h.regions.queries.get(), 0);
    assert_eq!(h.shadow.allocated_blocks(), 0);
    assert_eq!(t.stats().push_addressable, 1);
    assert_eq!(t.threshold(), 0x9000);
}
