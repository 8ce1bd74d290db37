use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bleota_core::{
    Channel, FirmwareImage, OtaConfig, OtaEvent, OtaSession, OtaState, RecordingObserver,
    SessionOutcome, SimFault, SimulatedDevice,
};

fn image(len: usize) -> FirmwareImage {
    FirmwareImage::from_bytes((0..len).map(|i| (i * 31 % 256) as u8).collect::<Vec<_>>()).unwrap()
}

#[test]
fn full_update_over_small_mtu() {
    let firmware = image(10_000);
    let device = SimulatedDevice::new("sim").with_max_mtu(64);
    let observer = Arc::new(RecordingObserver::new());
    let mut session = OtaSession::with_observer(
        OtaConfig::default(),
        device.clone(),
        firmware.clone(),
        observer.clone(),
    );

    assert_eq!(session.run(), Ok(SessionOutcome::Completed));
    assert_eq!(device.received_image(), firmware.as_bytes());
    assert_eq!(device.negotiated_mtu(), 64);
    assert_eq!(device.notifying(), Channel::ALL.to_vec());
    assert!(observer.milestones().contains(&OtaEvent::MtuNegotiated {
        mtu: Some(64),
        packet_size: 61,
    }));

    let states = observer.states();
    assert_eq!(
        &states[..6],
        &[
            OtaState::Negotiating,
            OtaState::DiscoveringCapabilities,
            OtaState::EnablingNotifications,
            OtaState::AwaitingStartAck,
            OtaState::Packetizing,
            OtaState::Transferring,
        ]
    );
    assert_eq!(states.last(), Some(&OtaState::Completed));
}

#[test]
fn stop_handle_ends_stalled_session() {
    let device = SimulatedDevice::new("sim").with_fault(SimFault::IgnoreStart);
    let mut session = OtaSession::with_observer(
        OtaConfig::default(),
        device,
        image(100),
        Arc::new(RecordingObserver::new()),
    );
    let stop = session.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        stop.stop()
    });

    assert_eq!(session.run(), Ok(SessionOutcome::Stopped));
    assert_eq!(session.state(), OtaState::AwaitingStartAck);
    assert!(stopper.join().unwrap());
}

#[test]
fn strict_notifications_abort() {
    let device =
        SimulatedDevice::new("sim").with_fault(SimFault::NotificationFailure(Channel::Progress));
    let config = OtaConfig {
        strict_notifications: true,
        ..Default::default()
    };
    let mut session = OtaSession::with_observer(
        config,
        device,
        image(100),
        Arc::new(RecordingObserver::new()),
    );
    let err = session.run().unwrap_err();
    assert_eq!(err.code(), 33);
    assert_eq!(session.state(), OtaState::Failed);
}

#[test]
fn command_checksum_verification_accepts_valid_acks() {
    let firmware = image(5000);
    let device = SimulatedDevice::new("sim");
    let config = OtaConfig {
        verify_command_checksum: true,
        ..Default::default()
    };
    let mut session = OtaSession::with_observer(
        config,
        device.clone(),
        firmware.clone(),
        Arc::new(RecordingObserver::new()),
    );
    assert_eq!(session.run(), Ok(SessionOutcome::Completed));
    assert!(device.is_finished());
}
