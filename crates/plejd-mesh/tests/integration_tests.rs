//! Integration tests for the Plejd mesh bridge
//!
//! These tests drive the full stack (session task + bridge task) against
//! the in-memory fake transport with paused time:
//! - Inbound notifications to logical events
//! - Commands to encrypted frames, including coalescing and transitions
//! - Optimistic echo for plain switches
//! - Link loss, single-flight reconnect and queued delivery afterwards

use plejd_mesh::test_utils::{test_directory, test_key, FakeTransport, GATEWAY_ADDRESS};
use plejd_mesh::{
    start, BridgeEvent, BridgeHandle, MeshFrame, Opcode, PlejdConfig, PlejdConfigBuilder,
    PlejdError, StateUpdate, TurnOnOptions,
};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Helpers
// ============================================================================

async fn next_event(events: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for bridge event")
        .expect("bridge event channel closed")
}

async fn connected_bridge(
    config: PlejdConfig,
) -> (BridgeHandle, FakeTransport, broadcast::Receiver<BridgeEvent>) {
    let transport = FakeTransport::new();
    let handle = start(transport.clone(), test_directory(), test_key(), &config);
    let mut events = handle.subscribe();

    match next_event(&mut events).await {
        BridgeEvent::Connected { peer } => assert_eq!(peer, GATEWAY_ADDRESS),
        other => panic!("expected Connected, got {other:?}"),
    }
    // Let the post-connect drain pass run
    tokio::time::sleep(Duration::from_millis(10)).await;

    (handle, transport, events)
}

fn default_config() -> PlejdConfig {
    PlejdConfigBuilder::new()
        .reconnect_delay(Duration::from_secs(1))
        .build()
}

// ============================================================================
// Mesh → events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inbound_state_frame_has_no_brightness() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    let frame = hex::decode("050102009701").unwrap();
    assert!(transport.notify(&test_key(), &frame));

    assert_eq!(
        next_event(&mut events).await,
        BridgeEvent::StateChanged {
            unique_id: "light-kitchen".into(),
            state: StateUpdate {
                on: true,
                brightness: None,
                color_temp: None
            }
        }
    );

    let devices = handle.devices().await.unwrap();
    let kitchen = devices
        .iter()
        .find(|d| d.unique_id == "light-kitchen")
        .unwrap();
    assert!(kitchen.state.on);
}

#[tokio::test(start_paused = true)]
async fn test_button_and_scene_events() {
    let (_handle, transport, mut events) = connected_bridge(default_config()).await;

    transport.notify(&test_key(), &hex::decode("0001100016200100").unwrap());
    assert_eq!(
        next_event(&mut events).await,
        BridgeEvent::ButtonPressed {
            device_id: "remote-hall".into(),
            input_index: 1
        }
    );

    transport.notify(&test_key(), &hex::decode("020110002103").unwrap());
    assert_eq!(
        next_event(&mut events).await,
        BridgeEvent::SceneTriggered {
            scene_id: "scene-evening".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_stub_frames_dropped() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    transport.notify(&test_key(), &hex::decode("fa0110009701").unwrap());
    transport.notify(&test_key(), &[0x05, 0x01]);
    transport.notify(&test_key(), &hex::decode("0701100097").unwrap());

    // Only the registered, well-formed frame comes through
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::StateChanged { ref unique_id, .. } if unique_id == "switch-porch"
    ));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.unknown_addresses, 1);
    assert_eq!(stats.session.dropped_frames, 1);
}

// ============================================================================
// Commands → mesh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_switch_turn_off_single_frame_and_echo() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    handle.turn_off("switch-porch", None).await.unwrap();

    // Echoed before any write happens
    assert_eq!(
        next_event(&mut events).await,
        BridgeEvent::StateChanged {
            unique_id: "switch-porch".into(),
            state: StateUpdate::default()
        }
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    let frames = transport.data_frames(&test_key());
    assert_eq!(frames, vec![hex::decode("070110009700").unwrap()]);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_dims_coalesce() {
    let (handle, transport, _events) = connected_bridge(default_config()).await;

    for brightness in [100, 200] {
        handle
            .turn_on(
                "light-kitchen",
                TurnOnOptions {
                    brightness: Some(brightness),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        transport.data_frames(&test_key()),
        vec![MeshFrame::dim(5, 200).encode()]
    );

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.writes_sent, 1);
    assert_eq!(stats.commands_received, 2);
}

#[tokio::test(start_paused = true)]
async fn test_color_and_scene_commands() {
    let (handle, transport, _events) = connected_bridge(default_config()).await;

    handle
        .turn_on(
            "light-living",
            TurnOnOptions {
                brightness: Some(120),
                color_temp: Some(2700),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.trigger_scene("scene-evening").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        transport.data_frames(&test_key()),
        vec![
            MeshFrame::color_temperature(9, 2700).encode(),
            MeshFrame::scene(3).encode(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ids_rejected() {
    let (handle, _transport, _events) = connected_bridge(default_config()).await;

    assert!(matches!(
        handle.turn_on("ghost", TurnOnOptions::default()).await,
        Err(PlejdError::UnknownDevice(_))
    ));
    assert!(matches!(
        handle.trigger_scene("light-kitchen").await,
        Err(PlejdError::UnknownDevice(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transition_ramps_to_exact_target() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    // Kitchen reports on at level 50
    transport.notify(&test_key(), &hex::decode("05011000c8010032").unwrap());
    next_event(&mut events).await;

    handle
        .turn_on(
            "light-kitchen",
            TurnOnOptions {
                brightness: Some(200),
                transition: Some(Duration::from_secs(3)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let levels: Vec<u8> = transport
        .data_frames(&test_key())
        .iter()
        .map(|raw| {
            let frame = MeshFrame::decode(raw).unwrap();
            assert_eq!(frame.opcode, Opcode::Dim2Change);
            assert_eq!(frame.address, 5);
            frame.payload[1]
        })
        .collect();

    assert!(levels.len() >= 2 && levels.len() <= 15, "{levels:?}");
    assert!(levels.windows(2).all(|w| w[0] < w[1]), "{levels:?}");
    assert_eq!(levels.last(), Some(&200));
    assert!(levels[0] > 50);
}

#[tokio::test(start_paused = true)]
async fn test_new_command_cancels_transition() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    transport.notify(&test_key(), &hex::decode("05011000c8010010").unwrap());
    next_event(&mut events).await;

    handle
        .turn_on(
            "light-kitchen",
            TurnOnOptions {
                brightness: Some(250),
                transition: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.turn_off("light-kitchen", None).await.unwrap();
    transport.clear_writes();

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(
        transport.data_frames(&test_key()),
        vec![MeshFrame::state(5, false).encode()]
    );
}

// ============================================================================
// Link loss and recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_and_delivers_queued_commands() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    transport.drop_link();
    assert_eq!(next_event(&mut events).await, BridgeEvent::Reconnecting);

    // Accepted while the link is down; the echo is immediate
    handle.turn_off("switch-porch", None).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::StateChanged { .. }
    ));

    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::Connected { .. }
    ));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        transport.data_frames(&test_key()),
        vec![MeshFrame::state(7, false).encode()]
    );
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.session.reconnects_requested, 1);
    assert!(stats.session.reconnect_attempts >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_connected_write_triggers_single_reconnect() {
    let (handle, transport, mut events) = connected_bridge(default_config()).await;

    transport.fail_data_writes(Some("Not connected"));
    handle.turn_off("switch-porch", None).await.unwrap();
    next_event(&mut events).await; // echo

    assert_eq!(next_event(&mut events).await, BridgeEvent::Reconnecting);
    transport.fail_data_writes(None);

    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::Connected { .. }
    ));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.session.reconnects_requested, 1);
    assert_eq!(stats.write_failures, 1);
    assert_eq!(
        transport.data_frames(&test_key()),
        vec![MeshFrame::state(7, false).encode()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ping_mismatch_counts_single_failure() {
    let config = PlejdConfigBuilder::new()
        .ping_interval(Duration::from_secs(3))
        .build();
    let (handle, transport, _events) = connected_bridge(config).await;

    transport.set_ping_offset(0);
    tokio::time::sleep(Duration::from_millis(3100)).await;

    let stats = handle.stats().await.unwrap().session;
    assert_eq!(stats.ping_failures, 1);
    assert_eq!(stats.consecutive_failures, 1);
    assert_eq!(stats.reconnects_requested, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_session() {
    let (handle, transport, _events) = connected_bridge(default_config()).await;
    assert!(transport.is_connected());

    handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!transport.is_connected());
    assert!(matches!(
        handle.stats().await,
        Err(PlejdError::ChannelClosed)
    ));
}
