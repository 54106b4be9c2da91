//! Lock orderer tests

use super::*;
use crate::native::{JournalingApi, LoopbackLibrary, NativeEvent, StatusCode};
use proptest::prelude::*;
use std::sync::Arc;

fn h(addr: usize) -> NativeHandle {
    NativeHandle::from_addr(addr)
}

/// Journaled loopback with `count` unlocked frames
fn setup(count: usize) -> (Arc<LoopbackLibrary>, JournalingApi, Vec<NativeHandle>) {
    let lib = Arc::new(LoopbackLibrary::new());
    let handles: Vec<NativeHandle> = (0..count)
        .map(|_| {
            let frame = lib.new_frame(2);
            assert!(lib.unlock(frame));
            frame
        })
        .collect();
    let api = JournalingApi::new(lib.clone());
    (lib, api, handles)
}

mod lockset_tests {
    use super::*;

    #[test]
    fn test_push_sorts_and_dedups() {
        let mut set = LockSet::new();
        set.push(h(0x30));
        set.push(h(0x10));
        set.push(h(0x20));
        set.push(h(0x10));
        assert_eq!(set.as_slice(), &[h(0x10), h(0x20), h(0x30)]);
    }

    #[test]
    fn test_null_handles_skipped() {
        let set = LockSet::of([NativeHandle::NULL, h(0x40), NativeHandle::NULL]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(h(0x40)));
        assert!(!set.contains(NativeHandle::NULL));
    }

    #[test]
    fn test_empty_set() {
        let set = LockSet::of([NativeHandle::NULL]);
        assert!(set.is_empty());
        assert_eq!(set, LockSet::new());
    }

    proptest! {
        #[test]
        fn prop_order_is_independent_of_input_order(addrs in proptest::collection::vec(0usize..64, 0..12)) {
            let forward = LockSet::of(addrs.iter().map(|a| h(*a * 0x10)));
            let backward = LockSet::of(addrs.iter().rev().map(|a| h(*a * 0x10)));
            prop_assert_eq!(&forward, &backward);

            let slice = forward.as_slice();
            prop_assert!(slice.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert!(slice.iter().all(|handle| !handle.is_null()));
        }
    }
}

mod acquire_tests {
    use super::*;

    #[test]
    fn test_lock_all_then_unlock_all_reverses() {
        let (lib, api, handles) = setup(3);
        let set = LockSet::of(handles.iter().rev().copied());

        let held = lock_all(&api, &set, true).unwrap();
        assert_eq!(held.handles(), set.as_slice());
        assert!(handles.iter().all(|h| lib.is_locked_by_current_thread(*h)));
        held.unlock_all().unwrap();

        let mut reversed = api.locks();
        reversed.reverse();
        assert_eq!(api.locks(), set.as_slice());
        assert_eq!(api.unlocks(), reversed);
        assert!(handles.iter().all(|h| !lib.is_locked_by_current_thread(*h)));
    }

    #[test]
    fn test_drop_releases_in_reverse() {
        let (lib, api, handles) = setup(2);
        let set = LockSet::of(handles.clone());
        {
            let _held = lock_all(&api, &set, true).unwrap();
        }
        let mut expected = set.as_slice().to_vec();
        expected.reverse();
        assert_eq!(api.unlocks(), expected);
        assert!(!lib.is_locked_by_current_thread(handles[0]));
    }

    #[test]
    fn test_failed_lock_rolls_back() {
        let (lib, api, handles) = setup(2);
        let stale = {
            let frame = lib.new_frame(1);
            lib.annul(frame);
            frame
        };
        let set = LockSet::of([handles[0], handles[1], stale]);

        let err = lock_all(&api, &set, true).err().unwrap();
        assert!(matches!(err, BridgeError::BridgeFatal(_)));
        assert_eq!(lib.status(), StatusCode::INVALID_OBJECT);
        lib.clear_status();

        assert_eq!(api.unlocks(), vec![handles[1], handles[0]]);
        assert!(!lib.is_locked_by_current_thread(handles[0]));
        assert!(!lib.is_locked_by_current_thread(handles[1]));
    }

    #[test]
    fn test_contended_lock_without_wait_is_fatal() {
        let (lib, api, handles) = setup(1);
        let target = handles[0];
        let other = lib.clone();
        std::thread::spawn(move || assert!(other.lock(target, false)))
            .join()
            .unwrap();

        // The spawned thread exited still holding the lock
        let err = lock_all(&api, &LockSet::of([target]), false).err().unwrap();
        assert!(matches!(err, BridgeError::BridgeFatal(_)));
        assert_eq!(lib.status(), StatusCode::LOCK_ERROR);
        lib.clear_status();
        assert!(api.locks().is_empty());
    }

    #[test]
    fn test_unlock_all_reports_every_failure() {
        let (lib, api, handles) = setup(2);
        let set = LockSet::of(handles.clone());
        let held = lock_all(&api, &set, true).unwrap();

        // Release one lock behind the orderer's back
        assert!(lib.unlock(handles[0]));
        let err = held.unlock_all().unwrap_err();
        assert!(matches!(err, BridgeError::BridgeFatal(_)));
        lib.clear_status();

        let unlocks: Vec<_> = api
            .events()
            .into_iter()
            .filter(|event| matches!(event, NativeEvent::Unlock { .. }))
            .collect();
        assert_eq!(unlocks.len(), 2);
    }
}
