use automation_core::{
    ActuatorDevice, ArbitrationConfig, AutomationError, BlockRequest, Command, CommandSource, Room,
};
use device_core::{ChannelDriver, DeviceId, WriteRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn living_room() -> (Room, mpsc::Receiver<WriteRequest>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (write_tx, write_rx) = mpsc::channel(16);
    let room = Room::new("living room");
    for name in ["floor-lamp", "ceiling"] {
        let id = DeviceId::new(name);
        let driver = Arc::new(ChannelDriver::new(id.clone(), write_tx.clone()));
        room.add(ActuatorDevice::new(id, driver, &ArbitrationConfig::default()));
    }
    (room, write_rx)
}

fn drain(rx: &mut mpsc::Receiver<WriteRequest>) -> Vec<WriteRequest> {
    let mut writes = Vec::new();
    while let Ok(request) = rx.try_recv() {
        writes.push(request);
    }
    writes
}

#[tokio::test(start_paused = true)]
async fn test_set_all_reaches_every_device() {
    let (room, mut writes) = living_room();

    let parent = room.set_all(CommandSource::Api, true, "evening");

    let mut devices: Vec<String> = drain(&mut writes)
        .into_iter()
        .filter(|w| w.on)
        .map(|w| w.device.to_string())
        .collect();
    devices.sort();
    assert_eq!(devices, vec!["ceiling", "floor-lamp"]);
    assert!(parent.is_manual());

    let lamp = room.get(&DeviceId::new("floor-lamp")).unwrap();
    let last = lamp.recent_commands().pop().unwrap();
    assert_eq!(
        last.trace,
        "Api -> RoomSetAll(\"evening\") -> SetActuatorState(\"room living room\")"
    );
    // Api writes count as manual and block automatic control
    assert!(room.statuses().iter().all(|s| s.automatic_block_active));
}

#[tokio::test(start_paused = true)]
async fn test_block_and_lift_all() {
    let (room, mut writes) = living_room();
    let request = BlockRequest {
        duration: Some(Duration::from_secs(600)),
        ..Default::default()
    };

    room.block_all(CommandSource::Manual, request, "party");
    assert!(room.statuses().iter().all(|s| s.automatic_block_active));

    room.lift_all(CommandSource::Api, Some(false), "party over");
    assert!(room.statuses().iter().all(|s| !s.automatic_block_active));
    assert!(drain(&mut writes).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_to_unknown_device() {
    let (room, _writes) = living_room();
    let result = room.dispatch(
        &DeviceId::new("garage"),
        Command::set_actuator_state(CommandSource::Manual, true, "remote"),
    );
    assert!(matches!(result, Err(AutomationError::DeviceNotFound(id)) if id.as_str() == "garage"));

    assert!(room.remove(&DeviceId::new("ceiling")).is_some());
    assert_eq!(room.len(), 1);
}
