use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thais_bridge::{
    BridgeError, ChannelConnection, Connection, ConnectionError, DecodeError, DispatchBridge,
    PacketIntent,
};
use thais_events::{ConnectionId, Priority};
use thais_scheduler::{Scheduler, SchedulerError};
use tokio::sync::watch;

/// Actions taken per connection, mutated only by fired callbacks
type World = HashMap<ConnectionId, u32>;

const PING: u8 = 0x01;
const ACTION: u8 = 0x02;
const LOGOUT: u8 = 0x03;
const BROKEN: u8 = 0x04;

/// `ACTION <delay>` schedules an action that replies with the new count
fn decode(packet: &[u8]) -> Result<Vec<PacketIntent<World>>, DecodeError> {
    let (&opcode, body) = packet.split_first().ok_or(DecodeError::Empty)?;
    match opcode {
        PING => Ok(vec![PacketIntent::immediate(|| Some(b"pong".to_vec()))]),
        ACTION => {
            let delay = *body.first().ok_or(DecodeError::Truncated {
                opcode,
                needed: 1,
                got: 0,
            })?;
            let intent = PacketIntent::delayed(
                i64::from(delay),
                Priority::NORMAL,
                |world: &mut World, ctx| {
                    let origin = ctx.origin().ok_or_else(|| anyhow::anyhow!("no origin"))?;
                    let count = world.entry(origin).or_default();
                    *count += 1;
                    Ok(Some(format!("done {count}").into_bytes()))
                },
            )
            .labelled("action");
            Ok(vec![intent])
        }
        LOGOUT => Ok(vec![PacketIntent::Disconnect]),
        BROKEN => Ok(vec![PacketIntent::delayed(-1, Priority::NORMAL, |_, _| Ok(None))]),
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

fn setup() -> (Scheduler<World>, DispatchBridge<World>) {
    let mut scheduler = Scheduler::new(World::new());
    let bridge = DispatchBridge::new(scheduler.handle(), Arc::new(decode));
    scheduler.subscribe(bridge.observer());
    (scheduler, bridge)
}

fn connect(
    bridge: &DispatchBridge<World>,
    raw: u64,
) -> (Arc<dyn Connection>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let (connection, rx) = ChannelConnection::new(ConnectionId::from_raw(raw));
    let connection: Arc<dyn Connection> = Arc::new(connection);
    bridge.register(Arc::clone(&connection));
    (connection, rx)
}

#[tokio::test(start_paused = true)]
async fn test_immediate_packet_replies_without_scheduling() {
    let (scheduler, bridge) = setup();
    let (conn, mut rx) = connect(&bridge, 1);

    let outcome = bridge.on_packet_received(&conn, &[PING]).unwrap();
    assert_eq!(outcome.immediate, 1);
    assert!(outcome.scheduled.is_empty());
    assert_eq!(rx.try_recv().unwrap(), b"pong".to_vec());
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_packet_reply_reaches_origin_after_firing() {
    let (mut scheduler, bridge) = setup();
    let (alice, mut alice_rx) = connect(&bridge, 1);
    let (_bob, mut bob_rx) = connect(&bridge, 2);

    let outcome = bridge.on_packet_received(&alice, &[ACTION, 20]).unwrap();
    assert_eq!(outcome.scheduled.len(), 1);
    assert!(alice_rx.try_recv().is_err());

    scheduler
        .fire_due(thais_events::LogicalTime::from_millis(20))
        .unwrap();
    assert_eq!(alice_rx.try_recv().unwrap(), b"done 1".to_vec());
    assert!(bob_rx.try_recv().is_err());
    assert_eq!(scheduler.world().get(&ConnectionId::from_raw(1)), Some(&1));
    assert_eq!(bridge.stats().delivered(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_output_for_closed_connection_is_dropped() {
    let (mut scheduler, bridge) = setup();
    let (conn, mut rx) = connect(&bridge, 7);

    bridge.on_packet_received(&conn, &[ACTION, 0]).unwrap();
    conn.close();
    scheduler.fire_due(scheduler.now()).unwrap();

    assert!(rx.try_recv().is_err());
    assert_eq!(bridge.stats().dropped(), 1);
    assert_eq!(scheduler.stats().faults, 0);
    assert_eq!(scheduler.stats().fired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_closed_cancels_its_pending_actions() {
    let (mut scheduler, bridge) = setup();
    let (leaving, _leaving_rx) = connect(&bridge, 1);
    let (staying, mut staying_rx) = connect(&bridge, 2);

    bridge.on_packet_received(&leaving, &[ACTION, 50]).unwrap();
    bridge.on_packet_received(&leaving, &[ACTION, 60]).unwrap();
    bridge.on_packet_received(&staying, &[ACTION, 50]).unwrap();

    let cancelled = bridge.on_connection_closed(ConnectionId::from_raw(1));
    assert_eq!(cancelled.len(), 2);
    assert!(bridge.registry().get(ConnectionId::from_raw(1)).is_none());
    assert!(!leaving.is_open());

    scheduler
        .fire_due(thais_events::LogicalTime::from_millis(100))
        .unwrap();
    assert_eq!(scheduler.world().get(&ConnectionId::from_raw(1)), None);
    assert_eq!(staying_rx.try_recv().unwrap(), b"done 1".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_decode_errors_never_reach_the_scheduler() {
    let (scheduler, bridge) = setup();
    let (conn, _rx) = connect(&bridge, 1);

    let err = bridge.on_packet_received(&conn, &[]).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Decode {
            source: DecodeError::Empty,
            ..
        }
    ));
    let err = bridge.on_packet_received(&conn, &[ACTION]).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Decode {
            source: DecodeError::Truncated { .. },
            ..
        }
    ));
    assert!(bridge.on_packet_received(&conn, &[0xEE]).is_err());

    assert_eq!(bridge.stats().decode_errors(), 3);
    assert_eq!(bridge.stats().packets(), 3);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.stats().scheduled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_failure_is_returned_to_caller() {
    let (_scheduler, bridge) = setup();
    let (conn, _rx) = connect(&bridge, 1);

    let err = bridge.on_packet_received(&conn, &[BROKEN]).unwrap_err();
    match err {
        BridgeError::Schedule { connection, source } => {
            assert_eq!(connection, ConnectionId::from_raw(1));
            assert_eq!(source, SchedulerError::InvalidDelay(-1));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_logout_closes_and_cancels() {
    let (scheduler, bridge) = setup();
    let (conn, _rx) = connect(&bridge, 3);

    bridge.on_packet_received(&conn, &[ACTION, 200]).unwrap();
    let outcome = bridge.on_packet_received(&conn, &[LOGOUT]).unwrap();
    assert!(outcome.disconnected);
    assert!(!conn.is_open());
    assert!(bridge.registry().is_empty());
    assert_eq!(scheduler.pending(), 0);
}

/// Claims to be open but every send fails
struct FlakyConnection {
    id: ConnectionId,
    attempts: AtomicUsize,
    open: AtomicBool,
}

impl Connection for FlakyConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, _bytes: &[u8]) -> Result<(), ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ConnectionError::Transport {
            id: self.id,
            reason: "broken pipe".into(),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_send_failures_are_counted_not_propagated() {
    let (mut scheduler, bridge) = setup();
    let flaky = Arc::new(FlakyConnection {
        id: ConnectionId::from_raw(9),
        attempts: AtomicUsize::new(0),
        open: AtomicBool::new(true),
    });
    let conn: Arc<dyn Connection> = flaky.clone();
    bridge.register(Arc::clone(&conn));

    bridge.on_packet_received(&conn, &[PING]).unwrap();
    bridge.on_packet_received(&conn, &[ACTION, 0]).unwrap();
    scheduler.fire_due(scheduler.now()).unwrap();

    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.stats().send_failures(), 2);
    assert_eq!(scheduler.stats().faults, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fifty_connections_each_get_their_own_reply() {
    let (mut scheduler, bridge) = setup();
    let clock = scheduler.clock();
    let (stop, stop_rx) = watch::channel(false);
    let dispatch = tokio::spawn(async move {
        scheduler.run(stop_rx).await.unwrap();
        scheduler
    });

    let mut clients = Vec::new();
    for raw in 1..=50u64 {
        let bridge = bridge.clone();
        clients.push(tokio::spawn(async move {
            let (conn, mut rx) = connect(&bridge, raw);
            bridge.on_packet_received(&conn, &[ACTION, 100]).unwrap();
            rx.recv().await
        }));
    }
    for client in clients {
        assert_eq!(client.await.unwrap(), Some(b"done 1".to_vec()));
    }

    tokio::time::sleep_until(clock.instant_at(thais_events::LogicalTime::from_millis(150))).await;
    stop.send(true).unwrap();
    let scheduler = dispatch.await.unwrap();

    assert_eq!(scheduler.world().len(), 50);
    assert!(scheduler.world().values().all(|&count| count == 1));
    assert_eq!(bridge.stats().delivered(), 50);
    assert_eq!(bridge.registry().len(), 50);
}
