use astbridge::callback::LineBuffer;
use astbridge::native::{AttrType, JournalingApi, LoopbackLibrary, NativeEvent};
use astbridge::{
    AstObject, Bridge, BridgeConfig, BridgeError, CallbackError, CallbackSlots, Channel, Frame,
    IntraMap, LockSet, Mapping, NativeHandle, OwnershipState, Sink, StatusCode, Transformer,
};
use crossbeam::channel;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn journaled() -> (Arc<LoopbackLibrary>, Arc<JournalingApi>, Bridge) {
    let lib = Arc::new(LoopbackLibrary::new());
    let journal = Arc::new(JournalingApi::new(lib.clone()));
    let bridge = Bridge::new(journal.clone(), BridgeConfig::default());
    (lib, journal, bridge)
}

struct Double;

impl Transformer for Double {
    fn transform(
        &self,
        npoint: usize,
        input: &[&[f64]],
        forward: bool,
        _ncoord_out: usize,
    ) -> Result<Vec<Vec<f64>>, CallbackError> {
        let factor = if forward { 2.0 } else { 0.5 };
        Ok(input
            .iter()
            .map(|row| row[..npoint].iter().map(|x| x * factor).collect())
            .collect())
    }
}

struct Panicking;

impl Transformer for Panicking {
    fn transform(
        &self,
        _npoint: usize,
        _input: &[&[f64]],
        _forward: bool,
        _ncoord_out: usize,
    ) -> Result<Vec<Vec<f64>>, CallbackError> {
        panic!("transformer gave up")
    }
}

struct DiskFull;

impl Sink for DiskFull {
    fn write_line(&mut self, _line: &str) -> Result<(), CallbackError> {
        Err("disk full".into())
    }
}

#[test]
fn test_lock_order_independent_of_call_site() {
    let (_lib, journal, bridge) = journaled();
    let channel = Channel::new(&bridge).unwrap();
    let zoom = Mapping::zoom(&bridge, 2, 4.0).unwrap();
    let x = channel.handle().unwrap();
    let y = zoom.handle().unwrap();

    journal.clear();
    let mut text = LineBuffer::new();
    assert_eq!(channel.write(&zoom, &mut text).unwrap(), 1);
    let written = journal.take_events();

    bridge
        .guarded("listed", &LockSet::of([x, y]), CallbackSlots::none(), |_| ())
        .unwrap();
    let listed = journal.locks();
    journal.clear();
    bridge
        .guarded("reversed", &LockSet::of([y, x]), CallbackSlots::none(), |_| ())
        .unwrap();
    let reversed = journal.locks();

    assert_eq!(listed, reversed);
    assert_eq!(listed.len(), 2);
    assert!(listed[0] < listed[1]);
    assert!(written
        .iter()
        .any(|event| matches!(event, NativeEvent::Call { name: "channel_write", .. })));

    // Disposed: refused before anything reaches the library
    assert!(channel.dispose().unwrap());
    journal.clear();
    let calls = bridge.stats().native_calls;
    assert!(matches!(
        channel.write(&zoom, &mut text),
        Err(BridgeError::DisposedObject)
    ));
    assert!(journal.events().is_empty());
    assert_eq!(bridge.stats().native_calls, calls);
}

#[test]
fn test_dispose_releases_exactly_once() {
    let (lib, journal, bridge) = journaled();
    let frame = Frame::new(&bridge, 2).unwrap();
    let handle = frame.handle().unwrap();

    assert!(frame.dispose().unwrap());
    for _ in 0..4 {
        assert!(!frame.dispose().unwrap());
        assert_eq!(frame.state(), OwnershipState::Released);
    }
    drop(frame);

    assert_eq!(journal.annuls(), vec![handle]);
    assert_eq!(lib.live_handles(), 0);
}

#[test]
fn test_locks_balanced_when_body_panics() {
    let (_lib, journal, bridge) = journaled();
    let a = Frame::new(&bridge, 1).unwrap();
    let b = Frame::new(&bridge, 3).unwrap();
    let set = LockSet::of([b.handle().unwrap(), a.handle().unwrap()]);

    journal.clear();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        bridge.guarded("explode", &set, CallbackSlots::none(), |_| -> () {
            panic!("body failed")
        })
    }));
    assert!(outcome.is_err());

    let locked = journal.locks();
    let mut unlocked = journal.unlocks();
    unlocked.reverse();
    assert_eq!(locked, set.as_slice());
    assert_eq!(unlocked, locked);

    // The bridge is usable again
    assert_eq!(a.naxes().unwrap(), 1);
}

#[test]
fn test_reversed_lock_sets_do_not_deadlock() {
    let bridge = Bridge::loopback();
    let a = Frame::new(&bridge, 2).unwrap();
    let b = Frame::new(&bridge, 2).unwrap();
    let handles = [a.handle().unwrap(), b.handle().unwrap()];

    let (done_tx, done_rx) = channel::unbounded();
    for reversed in [false, true] {
        let bridge = bridge.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            let (first, second): (NativeHandle, NativeHandle) = if reversed {
                (handles[1], handles[0])
            } else {
                (handles[0], handles[1])
            };
            for _ in 0..500 {
                bridge
                    .guarded(
                        "swap",
                        &LockSet::new().with(first).with(second),
                        CallbackSlots::none(),
                        |api| api.get_attr(first, "Naxes", AttrType::I),
                    )
                    .unwrap();
            }
            done.send(reversed).unwrap();
        });
    }

    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("guarded calls with reversed lock sets deadlocked");
    }
    assert_eq!(bridge.stats().native_calls, 2 + 1000);
}

#[test]
fn test_sequential_calls_reach_their_own_sink() {
    let bridge = Bridge::loopback();
    let channel = Channel::new(&bridge).unwrap();
    let zoom = Mapping::zoom(&bridge, 2, 4.0).unwrap();
    let frame = Frame::new(&bridge, 2).unwrap();

    let mut first = LineBuffer::new();
    let mut second = LineBuffer::new();
    channel.write(&zoom, &mut first).unwrap();
    channel.write(&frame, &mut second).unwrap();

    assert_eq!(first.lines().last().map(String::as_str), Some("End ZoomMap"));
    assert_eq!(second.lines().last().map(String::as_str), Some("End Frame"));
    assert!(first.lines().iter().all(|line| !line.contains("Frame")));
}

#[test]
fn test_callback_error_surfaces_after_native_return() {
    let (lib, _journal, bridge) = journaled();
    let channel = Channel::new(&bridge).unwrap();
    let frame = Frame::new(&bridge, 2).unwrap();

    match channel.write(&frame, &mut DiskFull) {
        Err(BridgeError::CallbackPropagated { status, source, .. }) => {
            assert_eq!(status, StatusCode::CALLBACK_FAILED);
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("expected CallbackPropagated, got {:?}", other),
    }
    assert!(!lib.is_locked_by_current_thread(channel.handle().unwrap()));
    assert!(!lib.is_locked_by_current_thread(frame.handle().unwrap()));
}

#[test]
fn test_callback_panic_resumed_after_unlock() {
    let lib = Arc::new(LoopbackLibrary::new());
    let bridge = Bridge::new(lib.clone(), BridgeConfig::default());
    let map = IntraMap::new(&bridge, Arc::new(Panicking), 1, 1).unwrap();

    let payload = panic::catch_unwind(AssertUnwindSafe(|| map.tran1(&[1.0], true))).unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"transformer gave up"));
    assert!(!lib.is_locked_by_current_thread(map.handle().unwrap()));
    assert_eq!(map.nin().unwrap(), 1);
}

#[test]
fn test_disposed_object_unusable_from_other_threads() {
    let bridge = Bridge::loopback();
    let frame = Arc::new(Frame::new(&bridge, 2).unwrap());
    assert!(frame.dispose().unwrap());

    let shared = frame.clone();
    let result = thread::spawn(move || shared.naxes()).join().unwrap();
    assert!(matches!(result, Err(BridgeError::DisposedObject)));
    assert!(matches!(frame.set_title("late"), Err(BridgeError::DisposedObject)));
}

#[test]
fn test_concurrent_dispose_releases_once() {
    let (lib, journal, bridge) = journaled();
    let frame = Arc::new(Frame::new(&bridge, 2).unwrap());

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let frame = frame.clone();
            thread::spawn(move || frame.dispose().unwrap())
        })
        .collect();
    let released = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .filter(|released| *released)
        .count();

    assert_eq!(released, 1);
    assert_eq!(journal.annuls().len(), 1);
    assert_eq!(lib.live_handles(), 0);
}

#[test]
fn test_drop_inside_call_is_deferred() {
    let lib = Arc::new(LoopbackLibrary::new());
    let bridge = Bridge::new(lib.clone(), BridgeConfig::default());
    let frame = Frame::new(&bridge, 2).unwrap();

    bridge
        .guarded("holding", &LockSet::new(), CallbackSlots::none(), |_| drop(frame))
        .unwrap();
    assert_eq!(bridge.pending_releases(), 1);
    assert_eq!(lib.live_handles(), 1);

    let _next = Frame::new(&bridge, 1).unwrap();
    assert_eq!(bridge.pending_releases(), 0);
    assert_eq!(lib.live_handles(), 1);
    assert_eq!(bridge.stats().deferred_releases, 1);
}

#[test]
fn test_intra_map_survives_channel_round_trip() {
    let bridge = Bridge::loopback();
    let channel = Channel::new(&bridge).unwrap();
    let map = IntraMap::new(&bridge, Arc::new(Double), 1, 1).unwrap();

    let mut text = LineBuffer::new();
    channel.write(&map, &mut text).unwrap();
    text.rewind();
    let object: AstObject = channel.read(&mut text).unwrap().unwrap();
    let restored = IntraMap::try_from(object).unwrap();

    assert!(restored.registration().is_some());
    assert_eq!(restored.tran1(&[1.0, 2.5], true).unwrap(), vec![2.0, 5.0]);
    assert_eq!(restored.tran1(&[4.0], false).unwrap(), vec![2.0]);
    assert!(channel.read(&mut text).unwrap().is_none());
}

#[test]
fn test_configured_message_limit() {
    let config = BridgeConfig::parse("[errors]\nmax_message_len = 16\n").unwrap();
    let bridge = Bridge::new(Arc::new(LoopbackLibrary::new()), config);
    let frame = Frame::new(&bridge, 2).unwrap();

    match frame.set_c("NoSuchAttributeAnywhere", "x") {
        Err(BridgeError::NativeOperation { status, message }) => {
            assert_eq!(status, StatusCode::BAD_ATTRIBUTE);
            assert!(message.ends_with("..."), "{}", message);
            assert!(message.len() <= 16 + 3);
        }
        other => panic!("expected NativeOperation, got {:?}", other),
    }
}

#[test]
fn test_objects_from_another_library_are_independent() {
    let left = Bridge::loopback();
    let right = Bridge::loopback();
    let frame = Frame::new(&left, 2).unwrap();
    let channel = Channel::new(&right).unwrap();
    let mut text = LineBuffer::new();

    assert!(matches!(
        channel.write(&frame, &mut text),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(text.lines().is_empty());
    assert!(!left.same_bridge(&right));
    assert!(right.api().status().is_ok());
}

mod message_limit {
    use astbridge::guard::status::ErrorStatus;
    use astbridge::StatusCode;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_messages_never_exceed_limit(
            limit in 1usize..64,
            messages in proptest::collection::vec("[a-zé ]{0,40}", 0..8),
        ) {
            let mut status = ErrorStatus::new(limit, "\n");
            for text in &messages {
                status.push(StatusCode::BAD_VALUE, text);
            }
            prop_assert!(status.message().len() <= limit + 3);
            if !messages.is_empty() {
                prop_assert_eq!(status.first_status(), Some(StatusCode::BAD_VALUE));
            }
        }
    }
}
