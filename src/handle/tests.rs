//! Ownership and release tests

use super::*;
use crate::config::{BridgeConfig, LifecycleConfig};
use crate::native::{JournalingApi, LoopbackLibrary};
use std::sync::Arc;

fn journaled(config: BridgeConfig) -> (Arc<LoopbackLibrary>, Arc<JournalingApi>, Bridge) {
    let lib = Arc::new(LoopbackLibrary::new());
    let journal = Arc::new(JournalingApi::new(lib.clone()));
    let bridge = Bridge::new(journal.clone(), config);
    (lib, journal, bridge)
}

fn new_frame(bridge: &Bridge) -> HandleBox {
    bridge
        .lifecycle()
        .create("astFrame", &LockSet::new(), CallbackSlots::none(), |api| api.new_frame(2))
        .unwrap()
}

mod state_tests {
    use super::*;

    #[test]
    fn test_uninitialized_box() {
        let (_lib, _journal, bridge) = journaled(BridgeConfig::default());
        let handle = HandleBox::uninitialized();
        assert_eq!(handle.state(), OwnershipState::Uninitialized);
        assert!(matches!(handle.handle(), Err(BridgeError::NotConstructed)));

        assert!(!bridge.lifecycle().dispose(&handle).unwrap());
        assert_eq!(handle.state(), OwnershipState::Released);
        assert_eq!(bridge.stats().native_calls, 0);
    }

    #[test]
    fn test_release_flips_state_once() {
        let handle = HandleBox::owned(NativeHandle::from_addr(0x40));
        assert_eq!(handle.handle().unwrap(), NativeHandle::from_addr(0x40));
        assert_eq!(handle.release(), Some(NativeHandle::from_addr(0x40)));
        assert_eq!(handle.release(), None);
        assert!(handle.is_released());
        assert!(matches!(handle.handle(), Err(BridgeError::DisposedObject)));
    }

    #[test]
    fn test_wrap() {
        let (_lib, _journal, bridge) = journaled(BridgeConfig::default());
        let lifecycle = bridge.lifecycle();
        assert!(matches!(
            lifecycle.wrap(NativeHandle::NULL),
            Err(BridgeError::InvalidArgument(_))
        ));
        let wrapped = lifecycle.wrap(NativeHandle::from_addr(0x80)).unwrap();
        assert_eq!(wrapped.state(), OwnershipState::Owned);
    }
}

mod create_tests {
    use super::*;

    #[test]
    fn test_create_returns_unlocked_owned_handle() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        let handle = frame.handle().unwrap();
        assert!(lib.is_live(handle));
        assert!(!lib.is_locked_by_current_thread(handle));
        assert_eq!(journal.unlocks(), vec![handle]);
    }

    #[test]
    fn test_constructor_failure() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let err = bridge
            .lifecycle()
            .create("astFrame", &LockSet::new(), CallbackSlots::none(), |api| api.new_frame(-1))
            .unwrap_err();
        assert!(matches!(err, BridgeError::NativeConstruction { .. }));
        assert_eq!(err.status(), Some(StatusCode::BAD_VALUE));
        assert!(journal.annuls().is_empty());
        assert_eq!(lib.live_handles(), 0);
    }

    #[test]
    fn test_null_without_status() {
        let (_lib, _journal, bridge) = journaled(BridgeConfig::default());
        match bridge
            .lifecycle()
            .create("astNothing", &LockSet::new(), CallbackSlots::none(), |_| NativeHandle::NULL)
        {
            Err(BridgeError::NativeConstruction { status, message }) => {
                assert_eq!(status, StatusCode::ERROR);
                assert_eq!(message, "astNothing returned no object");
            }
            other => panic!("expected NativeConstruction, got {:?}", other),
        }
    }

    #[test]
    fn test_result_annulled_when_status_set() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let err = bridge
            .lifecycle()
            .create("astHalfDone", &LockSet::new(), CallbackSlots::none(), |api| {
                let frame = api.new_frame(2);
                api.set_status(StatusCode::BAD_VALUE);
                frame
            })
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_VALUE));
        assert_eq!(journal.annuls().len(), 1);
        assert_eq!(lib.live_handles(), 0);
    }

    #[test]
    fn test_query_none() {
        let (_lib, _journal, bridge) = journaled(BridgeConfig::default());
        let found = bridge
            .lifecycle()
            .query("astFind", &LockSet::new(), CallbackSlots::none(), |_| NativeHandle::NULL)
            .unwrap();
        assert!(found.is_none());
    }
}

mod dispose_tests {
    use super::*;

    #[test]
    fn test_dispose_exactly_once() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        let handle = frame.handle().unwrap();
        let lifecycle = bridge.lifecycle();

        assert!(lifecycle.dispose(&frame).unwrap());
        assert!(!lifecycle.dispose(&frame).unwrap());
        lifecycle.dispose_implicit(&frame);

        assert_eq!(journal.annuls(), vec![handle]);
        assert!(!lib.is_live(handle));
        assert_eq!(bridge.stats().releases, 1);
    }

    #[test]
    fn test_concurrent_dispose() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);

        let released: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| bridge.lifecycle().dispose(&frame).unwrap()))
                .collect();
            workers
                .into_iter()
                .map(|worker| usize::from(worker.join().unwrap()))
                .sum()
        });
        assert_eq!(released, 1);
        assert_eq!(journal.annuls().len(), 1);
        assert_eq!(lib.live_handles(), 0);
    }

    #[test]
    fn test_explicit_failure_reported() {
        let (lib, _journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        lib.annul(frame.handle().unwrap());

        let err = bridge.lifecycle().dispose(&frame).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INVALID_OBJECT));
        assert!(frame.is_released());
    }

    #[test]
    fn test_implicit_failure_swallowed() {
        let (lib, _journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        lib.annul(frame.handle().unwrap());

        bridge.lifecycle().dispose_implicit(&frame);
        assert!(frame.is_released());
        assert!(bridge.api().status().is_ok());
        assert_eq!(bridge.stats().releases, 0);
    }

    #[test]
    fn test_replace() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let target = new_frame(&bridge);
        let old = target.handle().unwrap();
        let fresh = new_frame(&bridge);
        let new = fresh.handle().unwrap();

        bridge.lifecycle().replace(&target, fresh).unwrap();
        assert_eq!(target.handle().unwrap(), new);
        assert_eq!(journal.annuls(), vec![old]);
        assert!(lib.is_live(new));
    }

    #[test]
    fn test_replace_with_released_box() {
        let (_lib, _journal, bridge) = journaled(BridgeConfig::default());
        let target = new_frame(&bridge);
        let fresh = HandleBox::uninitialized();
        assert!(matches!(
            bridge.lifecycle().replace(&target, fresh),
            Err(BridgeError::NotConstructed)
        ));
        assert_eq!(target.state(), OwnershipState::Owned);
    }
}

mod deferred_tests {
    use super::*;

    #[test]
    fn test_release_inside_call_is_deferred() {
        let (lib, journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        let handle = frame.handle().unwrap();

        bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none(), |_| {
                bridge.lifecycle().dispose(&frame).unwrap()
            })
            .unwrap();
        assert!(frame.is_released());
        assert!(lib.is_live(handle));
        assert_eq!(bridge.pending_releases(), 1);
        assert_eq!(bridge.stats().deferred_releases, 1);

        // Drained on entry to the next outermost call
        bridge
            .guarded("next", &LockSet::new(), CallbackSlots::none(), |_| ())
            .unwrap();
        assert_eq!(bridge.pending_releases(), 0);
        assert!(!lib.is_live(handle));
        assert_eq!(journal.annuls(), vec![handle]);
        assert_eq!(bridge.stats().releases, 1);
    }

    #[test]
    fn test_release_in_place_keeps_outer_status() {
        let config = BridgeConfig {
            lifecycle: LifecycleConfig {
                defer_reentrant_release: false,
                ..LifecycleConfig::default()
            },
            ..BridgeConfig::default()
        };
        let (lib, _journal, bridge) = journaled(config);
        let frame = new_frame(&bridge);
        let handle = frame.handle().unwrap();

        let err = bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none(), |api| {
                api.set_status(StatusCode::BAD_VALUE);
                bridge.lifecycle().dispose(&frame).unwrap()
            })
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_VALUE));
        assert!(!lib.is_live(handle));
        assert_eq!(bridge.pending_releases(), 0);
        assert_eq!(bridge.stats().releases, 1);
    }

    #[test]
    fn test_release_from_callback_is_immediate() {
        use crate::callback::Sink;
        use crate::error::CallbackError;
        use std::ffi::CString;

        struct Disposing<'a> {
            bridge: &'a Bridge,
            target: &'a HandleBox,
        }

        impl Sink for Disposing<'_> {
            fn write_line(&mut self, _line: &str) -> std::result::Result<(), CallbackError> {
                self.bridge.lifecycle().dispose(self.target)?;
                Ok(())
            }
        }

        let (lib, _journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        let handle = frame.handle().unwrap();
        let mut sink = Disposing {
            bridge: &bridge,
            target: &frame,
        };
        bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none().sink(&mut sink), |_| {
                let line = CString::new("dispose").unwrap();
                crate::callback::sink_trampoline(line.as_ptr());
            })
            .unwrap();
        assert!(!lib.is_live(handle));
        assert_eq!(bridge.pending_releases(), 0);
    }

    #[test]
    fn test_pending_releases_flushed_on_bridge_drop() {
        let (lib, _journal, bridge) = journaled(BridgeConfig::default());
        let frame = new_frame(&bridge);
        bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none(), |_| {
                bridge.lifecycle().dispose(&frame).unwrap()
            })
            .unwrap();
        assert_eq!(lib.live_handles(), 1);
        drop(bridge);
        assert_eq!(lib.live_handles(), 0);
    }
}
