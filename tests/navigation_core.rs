//! End-to-end exercises of [`skirmish_nav::core::NavigationCore`]: command
//! application, movement toward a destination, and a save/restore round
//! trip — the externally observable surface, rather than any one module's
//! internals.

use skirmish_nav::command::Command;
use skirmish_nav::config::Config;
use skirmish_nav::core::NavigationCore;
use skirmish_nav::grid::MapResolution;
use skirmish_nav::math::Vec2;

fn small_map() -> MapResolution {
    MapResolution { chunks_wide: 2, chunks_high: 2, tile_cols: 16, tile_rows: 16, tile_size: 1.0 }
}

#[test]
fn an_agent_moves_toward_its_destination_and_arrives() {
    let mut core = NavigationCore::new(Config::default(), small_map(), Vec2::ZERO);
    core.push_command(Command::Add { uid: 1, pos: Vec2::new(1.0, 1.0), radius: 0.5, faction: 0 });
    core.push_command(Command::SetDest { uid: 1, target: Vec2::new(4.0, 1.0), attack: false });

    let mut arrived = false;
    for _ in 0..200 {
        core.tick();
        if core.still(1) {
            arrived = true;
            break;
        }
    }
    assert!(arrived, "agent never reached its destination");
    let m = core.movestate(1).unwrap();
    assert!((m.next_pos.x - 4.0).abs() < 1.0);
}

#[test]
fn stop_cancels_an_in_flight_move() {
    let mut core = NavigationCore::new(Config::default(), small_map(), Vec2::ZERO);
    core.push_command(Command::Add { uid: 1, pos: Vec2::ZERO, radius: 0.5, faction: 0 });
    core.push_command(Command::SetDest { uid: 1, target: Vec2::new(20.0, 20.0), attack: false });
    core.tick();
    core.tick();
    assert!(!core.still(1));

    core.push_command(Command::Stop { uid: 1 });
    core.tick();
    assert!(core.still(1));
    assert!(core.get_dest(1).is_none());
}

#[test]
fn save_and_restore_preserves_agent_positions_across_a_fresh_core() {
    let mut core = NavigationCore::new(Config::default(), small_map(), Vec2::ZERO);
    core.push_command(Command::Add { uid: 1, pos: Vec2::new(3.0, 4.0), radius: 0.5, faction: 0 });
    core.push_command(Command::Add { uid: 2, pos: Vec2::new(5.0, 5.0), radius: 0.5, faction: 1 });
    core.push_command(Command::SetDest { uid: 1, target: Vec2::new(10.0, 4.0), attack: false });
    for _ in 0..5 {
        core.tick();
    }

    let data = core.save_data();
    assert_eq!(data.agents.len(), 2);

    let mut restored = NavigationCore::new(Config::default(), small_map(), Vec2::ZERO);
    restored.restore(data);

    let original = core.movestate(1).unwrap();
    let loaded = restored.movestate(1).unwrap();
    assert!((original.next_pos.x - loaded.next_pos.x).abs() < 1e-4);
    assert!((original.next_pos.y - loaded.next_pos.y).abs() < 1e-4);
}

#[test]
fn make_flocks_groups_the_whole_selection_under_one_destination() {
    use skirmish_nav::formation::FormationType;

    let mut core = NavigationCore::new(Config::default(), small_map(), Vec2::ZERO);
    core.push_command(Command::Add { uid: 1, pos: Vec2::new(1.0, 1.0), radius: 0.5, faction: 0 });
    core.push_command(Command::Add { uid: 2, pos: Vec2::new(1.0, 2.0), radius: 0.5, faction: 0 });
    core.push_command(Command::MakeFlocks {
        selection: vec![1, 2],
        target: Vec2::new(8.0, 8.0),
        orientation: None,
        formation_type: FormationType::None,
        attack: false,
    });
    core.tick();

    assert_eq!(core.get_dest(1), core.get_dest(2));
    assert!(!core.still(1) && !core.still(2));
}
