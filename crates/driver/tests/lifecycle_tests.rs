//! Device lifecycle tests
//!
//! Reference counting, attach/detach, sessions and teardown ordering,
//! driven through `MockTransport` so every "hardware" completion lands
//! exactly when the test says.
//!
//! Run with: `cargo test -p driver --test lifecycle_tests`

use driver::device::DeviceParams;
use driver::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, bulk_only_endpoints, fx2_endpoints, wait_until,
};
use driver::transfer::CompletionQueue;
use driver::{
    AttachError, DeviceIdentity, DeviceManager, DeviceRef, EndpointDescriptor, EndpointTable,
    ManagerOptions, Minor, OpenError, TransferStatus, TransportError,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn manager() -> DeviceManager {
    DeviceManager::new(ManagerOptions::default()).unwrap()
}

fn attach(manager: &DeviceManager, identity: &str) -> (Minor, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let bound = manager
        .on_attach(
            DeviceIdentity::from(identity),
            &fx2_endpoints(),
            transport.clone(),
        )
        .unwrap();
    (bound.minor, transport)
}

/// A standalone device whose teardown bumps the returned counter
fn counted_device() -> (DeviceRef, Arc<AtomicUsize>) {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let counter = teardowns.clone();

    let device = DeviceRef::new(
        DeviceParams {
            identity: DeviceIdentity::from("test"),
            minor: Minor(192),
            node_name: "usb/osrfx20".to_string(),
            endpoints: EndpointTable::from_descriptors(&bulk_only_endpoints()).unwrap(),
            transport: Arc::new(MockTransport::new()),
            completions: CompletionQueue::spawn().unwrap(),
            read_timeout: Duration::from_millis(20),
        },
        Box::new(move |_: Minor| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    (device, teardowns)
}

// ============================================================================
// Reference counting
// ============================================================================

proptest! {
    #[test]
    fn prop_teardown_once_after_balanced_releases(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let (device, teardowns) = counted_device();
        let mut extra: Vec<DeviceRef> = Vec::new();

        for acquire in ops {
            if acquire {
                extra.push(device.acquire());
            } else if let Some(reference) = extra.pop() {
                reference.release();
            }
            prop_assert_eq!(teardowns.load(Ordering::SeqCst), 0);
            prop_assert_eq!(device.ref_count(), extra.len() + 1);
        }

        for reference in extra.drain(..) {
            reference.release();
            prop_assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        }

        device.release();
        prop_assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_clone_and_drop_count_like_acquire_and_release() {
    let (device, teardowns) = counted_device();

    let clone = device.clone();
    assert_eq!(device.ref_count(), 2);
    drop(clone);
    assert_eq!(device.ref_count(), 1);

    drop(device);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_references_released_from_many_threads() {
    let (device, teardowns) = counted_device();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let reference = device.acquire();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    reference.acquire().release();
                }
                reference.release();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    assert_eq!(device.ref_count(), 1);
    device.release();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Sessions and detach
// ============================================================================

#[test]
fn test_open_close_and_detach_each_move_count_by_one() {
    let manager = manager();
    let (minor, _transport) = attach(&manager, "1-4");

    let first = manager.open(minor).unwrap();
    assert_eq!(first.device().ref_count(), 2);

    let second = manager.open(minor).unwrap();
    assert_eq!(second.device().ref_count(), 3);
    assert_ne!(first.id(), second.id());

    second.close();
    assert_eq!(first.device().ref_count(), 2);

    // Detach gives up only the controller's own reference
    assert!(manager.on_detach(&DeviceIdentity::from("1-4")));
    assert_eq!(first.device().ref_count(), 1);
    assert!(!first.device().is_present());
    assert_eq!(manager.live_devices(), 1);

    first.close();
    assert_eq!(manager.live_devices(), 0);
}

#[test]
fn test_detach_then_last_close_tears_down() {
    let manager = manager();
    let (minor, transport) = attach(&manager, "1-4");
    let session = manager.open(minor).unwrap();

    manager.on_detach(&DeviceIdentity::from("1-4"));
    assert_eq!(manager.live_devices(), 1);
    assert!(transport.interrupt_pending());

    session.close();
    assert_eq!(manager.live_devices(), 0);

    // Teardown cancelled the switch poll and waited for it
    assert!(!transport.interrupt_pending());
    assert_eq!(transport.cancelled().len(), 1);
}

#[test]
fn test_detach_without_sessions_tears_down_immediately() {
    let manager = manager();
    attach(&manager, "1-4");

    assert!(manager.on_detach(&DeviceIdentity::from("1-4")));
    assert_eq!(manager.live_devices(), 0);
    assert!(manager.bound_devices().is_empty());

    // Nothing left to detach
    assert!(!manager.on_detach(&DeviceIdentity::from("1-4")));
}

#[test]
fn test_pending_write_defers_teardown_until_its_completion() {
    let manager = manager();
    let (minor, transport) = attach(&manager, "1-4");

    let mut session = manager.open(minor).unwrap();
    assert_eq!(session.write(b"loopback").unwrap(), 8);
    assert_eq!(session.device().ref_count(), 3);
    session.close();

    manager.on_detach(&DeviceIdentity::from("1-4"));

    // Only the in-flight write holds the device now
    assert_eq!(manager.live_devices(), 1);
    assert!(!manager.wait_idle(Duration::from_millis(50)));
    assert_eq!(transport.pending_writes(), 1);

    assert!(transport.complete_next_write(TransferStatus::Completed));
    assert!(manager.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert!(!transport.interrupt_pending());
}

#[test]
fn test_failed_write_completion_still_releases_device() {
    let manager = manager();
    let (minor, transport) = attach(&manager, "1-4");

    let mut session = manager.open(minor).unwrap();
    session.write(&[1, 2, 3]).unwrap();
    transport.complete_next_write(TransferStatus::Stall);

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        session.device().ref_count() == 2
    }));

    session.close();
    manager.on_detach(&DeviceIdentity::from("1-4"));
    assert!(manager.wait_idle(DEFAULT_TEST_TIMEOUT));
}

#[test]
fn test_detach_all_and_wait_idle() {
    let manager = manager();
    attach(&manager, "1-4");
    attach(&manager, "1-5");
    assert_eq!(manager.bound_devices().len(), 2);

    manager.detach_all();
    assert!(manager.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert!(manager.bound_devices().is_empty());
}

// ============================================================================
// Open
// ============================================================================

#[test]
fn test_open_unknown_minor_fails_without_touching_counts() {
    let manager = manager();
    let (minor, _transport) = attach(&manager, "1-4");
    let session = manager.open(minor).unwrap();
    let before = session.device().ref_count();

    let err = manager.open(Minor(250)).unwrap_err();
    assert_eq!(err, OpenError::NoSuchDevice(Minor(250)));
    assert_eq!(session.device().ref_count(), before);
}

#[test]
fn test_open_after_teardown_fails() {
    let manager = manager();
    let (minor, _transport) = attach(&manager, "1-4");
    manager.on_detach(&DeviceIdentity::from("1-4"));
    assert_eq!(manager.live_devices(), 0);

    assert_eq!(
        manager.open(minor).unwrap_err(),
        OpenError::NoSuchDevice(minor)
    );
}

#[test]
fn test_open_after_detach_with_session_still_open_fails() {
    let manager = manager();
    let (minor, _transport) = attach(&manager, "1-4");
    let session = manager.open(minor).unwrap();

    manager.on_detach(&DeviceIdentity::from("1-4"));
    assert!(manager.open(minor).is_err());
    assert_eq!(session.device().ref_count(), 1);
}

// ============================================================================
// Attach
// ============================================================================

#[test]
fn test_attach_assigns_minor_and_node_name() {
    let manager = manager();
    let transport = Arc::new(MockTransport::new());
    let bound = manager
        .on_attach(DeviceIdentity::from("1-4"), &fx2_endpoints(), transport)
        .unwrap();

    assert_eq!(bound.minor, Minor(192));
    assert_eq!(bound.node_name, "usb/osrfx20");
    assert_eq!(bound.endpoints.bulk_in.unwrap().address, 0x88);
    assert_eq!(bound.endpoints.bulk_out.unwrap().address, 0x06);
    assert_eq!(
        manager.minor_of(&DeviceIdentity::from("1-4")),
        Some(Minor(192))
    );
}

#[test]
fn test_minor_reused_only_after_teardown() {
    let manager = manager();
    let (first, _t1) = attach(&manager, "1-4");
    let session = manager.open(first).unwrap();
    manager.on_detach(&DeviceIdentity::from("1-4"));

    // Still held by the session, so the next attach gets a fresh minor
    let (second, _t2) = attach(&manager, "1-5");
    assert_ne!(second, first);

    session.close();
    let (third, _t3) = attach(&manager, "1-6");
    assert_eq!(third, first);
}

#[test]
fn test_attach_same_identity_twice_is_rejected() {
    let manager = manager();
    attach(&manager, "1-4");

    let err = manager
        .on_attach(
            DeviceIdentity::from("1-4"),
            &fx2_endpoints(),
            Arc::new(MockTransport::new()),
        )
        .unwrap_err();
    assert!(matches!(err, AttachError::AlreadyBound(ref id) if id == "1-4"));
    assert_eq!(manager.live_devices(), 1);
}

#[test]
fn test_attach_with_zero_packet_size_fails_before_allocating() {
    let manager = manager();
    let descriptors = vec![
        EndpointDescriptor::from_raw(0x88, 0x02, 0, 0),
        EndpointDescriptor::from_raw(0x06, 0x02, 512, 0),
    ];

    let err = manager
        .on_attach(
            DeviceIdentity::from("1-4"),
            &descriptors,
            Arc::new(MockTransport::new()),
        )
        .unwrap_err();
    assert!(matches!(err, AttachError::InvalidEndpoint { address: 0x88 }));
    assert_eq!(manager.live_devices(), 0);
}

#[test]
fn test_attach_unwinds_when_poll_cannot_be_armed() {
    let manager = manager();
    let transport = Arc::new(MockTransport::new());
    transport.fail_interrupt_submissions(TransportError::NoDevice);

    let err = manager
        .on_attach(DeviceIdentity::from("1-4"), &fx2_endpoints(), transport)
        .unwrap_err();
    assert!(matches!(
        err,
        AttachError::InterruptPoll(TransportError::NoDevice)
    ));
    assert_eq!(manager.live_devices(), 0);
    assert!(manager.bound_devices().is_empty());

    // The minor went back to the pool
    let (minor, _transport) = attach(&manager, "1-5");
    assert_eq!(minor, Minor(192));
}

#[test]
fn test_minor_pool_exhaustion() {
    let manager = DeviceManager::new(ManagerOptions::default()).unwrap();
    let mut transports = Vec::new();
    for n in 0..16 {
        transports.push(attach(&manager, &format!("1-{}", n)));
    }

    let err = manager
        .on_attach(
            DeviceIdentity::from("2-1"),
            &bulk_only_endpoints(),
            Arc::new(MockTransport::new()),
        )
        .unwrap_err();
    assert!(matches!(err, AttachError::NoMinorAvailable));
}
