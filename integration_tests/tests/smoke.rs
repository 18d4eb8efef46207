mod common;

use std::net::TcpStream;
use std::time::{Duration, Instant};

use common::{read_event, robot, world, ScriptedStore};
use dash_proto::ServerEvent;
use relay_core::{DashboardServer, ReconciliationEngine, SourceCapabilities, TickPump};

fn wait_for_clients(server: &DashboardServer, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.client_count() < count && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.client_count(), count, "clients never registered");
}

#[test]
fn tcp_clients_receive_world_baseline_and_updates() -> anyhow::Result<()> {
    let server = DashboardServer::start("127.0.0.1:0".parse()?, &world().payload(), 16)?;

    let mut first = TcpStream::connect(server.local_addr())?;
    first.set_read_timeout(Some(Duration::from_secs(5)))?;
    let ServerEvent::SetWorld(layout) = read_event(&mut first)? else {
        anyhow::bail!("first frame must be set_world");
    };
    assert_eq!(layout.grid.len(), 3);
    assert_eq!(layout.item_names, vec!["bolt".to_string(), "nut".to_string()]);
    wait_for_clients(&server, 1);

    let store = ScriptedStore::with_ticks(vec![
        (1, vec![robot(0, [1, 0], "R"), robot(1, [3, 1], "")]),
        (2, vec![robot(0, [2, 0], ""), robot(1, [3, 1], "")]),
    ]);
    let mut pump = TickPump::new(
        Box::new(store),
        None,
        SourceCapabilities::TICK_STREAM,
        ReconciliationEngine::new(world()),
    );
    pump.step(&server)?;

    let ServerEvent::Update(update) = read_event(&mut first)? else {
        anyhow::bail!("expected an update");
    };
    assert_eq!(update.t, 1);
    assert_eq!(update.robots.len(), 2);

    let mut second = TcpStream::connect(server.local_addr())?;
    second.set_read_timeout(Some(Duration::from_secs(5)))?;
    assert!(matches!(read_event(&mut second)?, ServerEvent::SetWorld(_)));
    let ServerEvent::Update(baseline) = read_event(&mut second)? else {
        anyhow::bail!("late joiner must get the full state");
    };
    assert_eq!(baseline.t, 1);
    assert_eq!(baseline.robots[0].path, Some(vec![[2, 0]]));
    wait_for_clients(&server, 2);

    pump.step(&server)?;
    for stream in [&mut first, &mut second] {
        let ServerEvent::Update(update) = read_event(stream)? else {
            anyhow::bail!("expected tick 2");
        };
        assert_eq!(update.t, 2);
        assert!(update.robots[0].path.is_none());
    }
    Ok(())
}
