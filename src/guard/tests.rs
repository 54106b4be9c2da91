//! Call guard tests: re-entry, status translation, lock balance

use super::*;
use crate::callback::{LineBuffer, Sink};
use crate::config::ErrorsConfig;
use crate::error::CallbackError;
use crate::native::JournalingApi;
use std::ffi::CString;
use std::panic::AssertUnwindSafe;

fn report(status: StatusCode, text: &str) {
    let text = CString::new(text).unwrap();
    status::put_err_trampoline(status.0, text.as_ptr());
}

fn emit(line: &str) {
    let text = CString::new(line).unwrap();
    crate::callback::sink_trampoline(text.as_ptr());
}

/// Journaled loopback with `count` unlocked frames
fn journaled(count: usize) -> (Arc<LoopbackLibrary>, Arc<JournalingApi>, Bridge, Vec<NativeHandle>) {
    let lib = Arc::new(LoopbackLibrary::new());
    let handles = (0..count)
        .map(|_| {
            let frame = lib.new_frame(2);
            assert!(lib.unlock(frame));
            frame
        })
        .collect();
    let journal = Arc::new(JournalingApi::new(lib.clone()));
    let bridge = Bridge::new(journal.clone(), BridgeConfig::default());
    (lib, journal, bridge, handles)
}

/// Sink that makes a guarded call on `bridge` for each line
struct Reentering {
    bridge: Bridge,
    fail_with: Option<StatusCode>,
    errors: Vec<BridgeError>,
}

impl Sink for Reentering {
    fn write_line(&mut self, line: &str) -> std::result::Result<(), CallbackError> {
        let fail_with = self.fail_with;
        let result = self.bridge.guarded("nested", &LockSet::new(), CallbackSlots::none(), |api| {
            if let Some(status) = fail_with {
                report(status, &format!("inner problem with {}", line));
                api.set_status(status);
            }
        });
        if let Err(error) = result {
            self.errors.push(error);
        }
        Ok(())
    }
}

mod reentry_tests {
    use super::*;

    #[test]
    fn test_call_from_body_refused() {
        let bridge = Bridge::loopback();
        let inner = bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none(), |_| {
                bridge.guarded("inner", &LockSet::new(), CallbackSlots::none(), |_| ())
            })
            .unwrap();
        match inner {
            Err(BridgeError::Reentrancy(message)) => assert!(message.contains("inner")),
            other => panic!("expected Reentrancy, got {:?}", other),
        }
        assert_eq!(guard_depth(), 0);
    }

    #[test]
    fn test_call_from_callback_allowed() {
        let bridge = Bridge::loopback();
        let mut sink = Reentering {
            bridge: bridge.clone(),
            fail_with: None,
            errors: Vec::new(),
        };
        bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none().sink(&mut sink), |_| {
                emit("line");
            })
            .unwrap();
        assert!(sink.errors.is_empty());
        assert_eq!(bridge.stats().native_calls, 2);
    }

    #[test]
    fn test_callback_of_other_bridge_refused() {
        let bridge = Bridge::loopback();
        let mut sink = Reentering {
            bridge: Bridge::loopback(),
            fail_with: None,
            errors: Vec::new(),
        };
        bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none().sink(&mut sink), |_| {
                emit("line");
            })
            .unwrap();
        assert_eq!(sink.errors.len(), 1);
        assert!(matches!(sink.errors[0], BridgeError::Reentrancy(_)));
        assert!(sink.errors[0].is_fatal());
    }

    #[test]
    fn test_nested_failure_leaves_outer_status() {
        let bridge = Bridge::loopback();
        let mut sink = Reentering {
            bridge: bridge.clone(),
            fail_with: Some(StatusCode::BAD_COORDS),
            errors: Vec::new(),
        };
        let err = bridge
            .guarded("outer", &LockSet::new(), CallbackSlots::none().sink(&mut sink), |api| {
                report(StatusCode::BAD_VALUE, "outer problem");
                api.set_status(StatusCode::BAD_VALUE);
                emit("line");
            })
            .unwrap_err();

        match err {
            BridgeError::NativeOperation { status, message } => {
                assert_eq!(status, StatusCode::BAD_VALUE);
                assert_eq!(message, "outer problem");
            }
            other => panic!("expected NativeOperation, got {:?}", other),
        }
        match &sink.errors[..] {
            [BridgeError::NativeOperation { status, message }] => {
                assert_eq!(*status, StatusCode::BAD_COORDS);
                assert_eq!(message, "inner problem with line");
            }
            other => panic!("expected one nested NativeOperation, got {:?}", other),
        }
    }

    #[test]
    fn test_guard_state_after_body_panic() {
        let (lib, _journal, bridge, handles) = journaled(1);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            bridge.guarded("boom", &LockSet::of(handles.clone()), CallbackSlots::none(), |_| {
                panic!("body panicked")
            })
        }));
        assert!(result.is_err());
        assert_eq!(guard_depth(), 0);
        assert!(!lib.is_locked_by_current_thread(handles[0]));
        // The process lock was released too
        assert!(bridge
            .guarded("after", &LockSet::new(), CallbackSlots::none(), |_| 1)
            .is_ok());
    }
}

mod status_tests {
    use super::*;

    #[test]
    fn test_status_becomes_native_operation() {
        let bridge = Bridge::loopback();
        let err = bridge
            .guarded("astSomething", &LockSet::new(), CallbackSlots::none(), |api| {
                report(StatusCode::BAD_VALUE, "value out of range");
                api.set_status(StatusCode::BAD_VALUE);
            })
            .unwrap_err();
        match err {
            BridgeError::NativeOperation { status, message } => {
                assert_eq!(status, StatusCode::BAD_VALUE);
                assert_eq!(message, "value out of range");
            }
            other => panic!("expected NativeOperation, got {:?}", other),
        }
        assert!(bridge.api().status().is_ok());
        assert_eq!(bridge.stats().native_failures, 1);
    }

    #[test]
    fn test_status_without_message() {
        let bridge = Bridge::loopback();
        let err = bridge
            .guarded("astSilent", &LockSet::new(), CallbackSlots::none(), |api| {
                api.set_status(StatusCode::ERROR)
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "astSilent failed [SAI__ERROR]");
    }

    #[test]
    fn test_messages_joined_and_truncated() {
        let config = BridgeConfig {
            errors: ErrorsConfig {
                max_message_len: 12,
                separator: "; ".to_string(),
            },
            ..BridgeConfig::default()
        };
        let bridge = Bridge::new(Arc::new(LoopbackLibrary::new()), config);
        let err = bridge
            .guarded("astNoisy", &LockSet::new(), CallbackSlots::none(), |api| {
                report(StatusCode::BAD_VALUE, "first");
                report(StatusCode::BAD_VALUE, "second");
                report(StatusCode::BAD_VALUE, "third");
                api.set_status(StatusCode::BAD_VALUE);
            })
            .unwrap_err();
        match err {
            BridgeError::NativeOperation { message, .. } => assert_eq!(message, "first; secon..."),
            other => panic!("expected NativeOperation, got {:?}", other),
        }
    }

    #[test]
    fn test_fatal_status() {
        let bridge = Bridge::loopback();
        let err = bridge
            .guarded("astBroken", &LockSet::new(), CallbackSlots::none(), |api| {
                api.set_status(StatusCode::BRIDGE_FATAL)
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::BridgeFatal(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stale_status_cleared_on_entry() {
        let bridge = Bridge::loopback();
        bridge.api().set_status(StatusCode::BAD_VALUE);
        assert_eq!(
            bridge
                .guarded("fresh", &LockSet::new(), CallbackSlots::none(), |api| api.status())
                .unwrap(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_error_status_buffer() {
        let mut buffer = status::ErrorStatus::new(8, "|");
        assert!(buffer.is_empty());
        buffer.push(StatusCode::OK, "note");
        buffer.push(StatusCode::BAD_VALUE, "bad");
        buffer.push(StatusCode::READ_ONLY, "more text");
        assert_eq!(buffer.first_status(), Some(StatusCode::BAD_VALUE));
        assert_eq!(buffer.message(), "note|bad...");

        // Cut on a character boundary
        let mut buffer = status::ErrorStatus::new(2, "\n");
        buffer.push(StatusCode::ERROR, "añb");
        assert_eq!(buffer.message(), "a...");
    }
}

mod lock_balance_tests {
    use super::*;

    #[test]
    fn test_locks_taken_in_order_and_released_in_reverse() {
        let (lib, journal, bridge, handles) = journaled(3);
        let reversed: Vec<_> = handles.iter().rev().copied().collect();
        let held = bridge
            .guarded("astWork", &LockSet::of(reversed), CallbackSlots::none(), |_| {
                handles.iter().all(|h| lib.is_locked_by_current_thread(*h))
            })
            .unwrap();
        assert!(held);

        let mut sorted = handles.clone();
        sorted.sort();
        assert_eq!(journal.locks(), sorted);
        sorted.reverse();
        assert_eq!(journal.unlocks(), sorted);
        assert!(handles.iter().all(|h| !lib.is_locked_by_current_thread(*h)));
    }

    #[test]
    fn test_locks_released_when_native_call_fails() {
        let (lib, journal, bridge, handles) = journaled(2);
        let err = bridge
            .guarded("astFail", &LockSet::of(handles.clone()), CallbackSlots::none(), |api| {
                api.set_status(StatusCode::BAD_VALUE)
            })
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_VALUE));
        assert_eq!(journal.locks().len(), 2);
        assert_eq!(journal.unlocks().len(), 2);
        assert!(!lib.is_locked_by_current_thread(handles[0]));
    }

    #[test]
    fn test_lock_failure_skips_body() {
        let (lib, journal, bridge, handles) = journaled(1);
        let stale = lib.new_frame(1);
        lib.annul(stale);
        let mut ran = false;
        let err = bridge
            .guarded("astStale", &LockSet::of([handles[0], stale]), CallbackSlots::none(), |_| {
                ran = true
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::BridgeFatal(_)));
        assert!(!ran);
        assert_eq!(journal.locks().len(), journal.unlocks().len());
        assert!(bridge.api().status().is_ok());
    }
}

mod global_tests {
    use super::*;

    #[test]
    fn test_init_global_teardown() {
        let bridge = Bridge::loopback();
        let id = bridge.id();
        assert!(init(bridge).is_none());
        assert_eq!(global().unwrap().id(), id);

        let replacement = Bridge::loopback();
        let replaced = init(replacement.clone()).unwrap();
        assert_eq!(replaced.id(), id);
        assert!(init(replaced).unwrap().same_bridge(&replacement));
        assert!(global().unwrap().same_bridge(&global().unwrap()));

        let removed = teardown().unwrap();
        assert_eq!(removed.id(), id);
        assert!(matches!(global(), Err(BridgeError::NotInitialized)));
    }
}

mod stats_tests {
    use super::*;

    #[test]
    fn test_counters() {
        let bridge = Bridge::loopback();
        let mut buffer = LineBuffer::new();
        bridge
            .guarded("one", &LockSet::new(), CallbackSlots::none().sink(&mut buffer), |_| {
                emit("a");
                emit("b");
            })
            .unwrap();
        let _ = bridge.guarded("two", &LockSet::new(), CallbackSlots::none(), |api| {
            api.set_status(StatusCode::ERROR)
        });
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                native_calls: 2,
                native_failures: 1,
                callbacks_fired: 2,
                callback_failures: 0,
                releases: 0,
                deferred_releases: 0,
            }
        );
        assert_eq!(buffer.lines(), &["a", "b"]);
    }

    #[test]
    fn test_bridge_identity() {
        let bridge = Bridge::loopback();
        let other = Bridge::loopback();
        assert!(bridge.same_bridge(&bridge.clone()));
        assert!(!bridge.same_bridge(&other));
        assert_ne!(bridge.id(), other.id());
        assert_eq!(bridge.api().name(), "loopback");
        assert!(format!("{:?}", bridge).contains("loopback"));
    }
}
