//! Tests for the loopback library

use super::*;
use crate::native::intra_flags;
use core::ffi::{c_char, c_int};
use std::cell::RefCell;
use std::ffi::CStr;

thread_local! {
    static LINES: RefCell<Vec<String>> = RefCell::new(Vec::new());
    static PENDING: RefCell<Vec<CString>> = RefCell::new(Vec::new());
    static REPORTED: RefCell<Vec<(c_int, String)>> = RefCell::new(Vec::new());
}

extern "C" fn collect_line(line: *const c_char) {
    let text = unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned();
    LINES.with(|lines| lines.borrow_mut().push(text));
}

/// Serves `PENDING` front to back; the last string handed out stays alive in slot 0
extern "C" fn next_line() -> *const c_char {
    PENDING.with(|pending| {
        let mut pending = pending.borrow_mut();
        if pending.len() <= 1 {
            pending.clear();
            return core::ptr::null();
        }
        pending.remove(0);
        pending[0].as_ptr()
    })
}

fn queue_lines(lines: &[String]) {
    PENDING.with(|pending| {
        let mut pending = pending.borrow_mut();
        pending.clear();
        pending.push(CString::default());
        pending.extend(lines.iter().map(|l| CString::new(l.as_str()).unwrap()));
    });
}

extern "C" fn record_error(status: c_int, message: *const c_char) {
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
    REPORTED.with(|reported| reported.borrow_mut().push((status, text)));
}

unsafe extern "C" fn double_it(
    _this: NativeHandle,
    npoint: c_int,
    ncoord_in: c_int,
    ptr_in: *const *const f64,
    forward: c_int,
    _ncoord_out: c_int,
    ptr_out: *const *mut f64,
) {
    for coord in 0..ncoord_in as usize {
        let input = *ptr_in.add(coord);
        let output = *ptr_out.add(coord);
        for point in 0..npoint as usize {
            let value = *input.add(point);
            *output.add(point) = if forward != 0 { value * 2.0 } else { value / 2.0 };
        }
    }
}

unsafe extern "C" fn failing_tran(
    _this: NativeHandle,
    _npoint: c_int,
    _ncoord_in: c_int,
    _ptr_in: *const *const f64,
    _forward: c_int,
    _ncoord_out: c_int,
    _ptr_out: *const *mut f64,
) {
    TRAN_LIB.with(|lib| {
        if let Some(lib) = lib.borrow().as_ref() {
            lib.set_status(StatusCode::CALLBACK_FAILED);
        }
    });
}

thread_local! {
    static TRAN_LIB: RefCell<Option<Arc<LoopbackLibrary>>> = RefCell::new(None);
}

#[test]
fn test_new_objects_are_locked_by_creator() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(2);

    assert!(!frame.is_null());
    assert!(lib.is_locked_by_current_thread(frame));
    assert!(lib.unlock(frame));
    assert!(!lib.is_locked_by_current_thread(frame));
    assert!(lib.status().is_ok());
}

#[test]
fn test_clone_handle_shares_object() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(2);
    let alias = lib.clone_handle(frame);

    assert_ne!(frame, alias);
    assert_eq!(lib.live_handles(), 2);
    assert_eq!(lib.live_objects(), 1);
    assert_eq!(
        lib.get_attr(frame, "RefCount", AttrType::I),
        Some(AttrValue::I(2))
    );

    lib.set_attr(alias, "Title", &AttrValue::C("shared".into()));
    assert_eq!(
        lib.get_attr(frame, "Title", AttrType::C),
        Some(AttrValue::C("shared".into()))
    );

    lib.annul(alias);
    assert_eq!(lib.live_handles(), 1);
    assert!(lib.is_live(frame));
    assert!(!lib.is_live(alias));
}

#[test]
fn test_operations_require_lock() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(1);
    lib.unlock(frame);

    assert_eq!(lib.get_attr(frame, "Title", AttrType::C), None);
    assert_eq!(lib.status(), StatusCode::LOCK_ERROR);
    lib.clear_status();

    assert!(lib.lock(frame, false));
    assert!(lib.get_attr(frame, "Title", AttrType::C).is_some());
}

#[test]
fn test_lock_held_by_other_thread() {
    let lib = Arc::new(LoopbackLibrary::new());
    let frame = lib.new_frame(2);

    let other = Arc::clone(&lib);
    let (locked, status) = std::thread::spawn(move || {
        let locked = other.lock(frame, false);
        (locked, other.status())
    })
    .join()
    .unwrap();

    assert!(!locked);
    assert_eq!(status, StatusCode::LOCK_ERROR);
    // The failure lands in the other thread's slot only
    assert!(lib.status().is_ok());
}

#[test]
fn test_status_set_makes_calls_no_ops() {
    let lib = LoopbackLibrary::new();
    lib.set_status(StatusCode::ERROR);

    assert!(lib.new_frame(2).is_null());
    assert_eq!(lib.live_handles(), 0);
    assert_eq!(lib.status(), StatusCode::ERROR);
}

#[test]
fn test_attribute_errors() {
    let lib = LoopbackLibrary::new();
    lib.install_error_reporter(Some(record_error));
    REPORTED.with(|r| r.borrow_mut().clear());
    let map = lib.new_zoom_map(2, 3.0);

    lib.set_attr(map, "Nin", &AttrValue::I(4));
    assert_eq!(lib.status(), StatusCode::READ_ONLY);
    lib.clear_status();

    lib.get_attr(map, "Colour", AttrType::I);
    assert_eq!(lib.status(), StatusCode::BAD_ATTRIBUTE);
    lib.clear_status();

    lib.set(map, "Invert=yes");
    assert_eq!(lib.status(), StatusCode::BAD_VALUE);
    lib.clear_status();

    let messages = REPORTED.with(|r| r.borrow().clone());
    assert_eq!(messages.len(), 3);
    assert!(messages[1].1.contains("Colour"));
    lib.install_error_reporter(None);
}

#[test]
fn test_settings_string_unescapes_percent() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(2);

    lib.set(frame, "Title=100%% done, Label(2)=Dec");
    assert!(lib.status().is_ok());
    assert_eq!(
        lib.get_attr(frame, "title", AttrType::C),
        Some(AttrValue::C("100% done".into()))
    );
    assert_eq!(
        lib.get_attr(frame, "Label(2)", AttrType::C),
        Some(AttrValue::C("Dec".into()))
    );
    assert!(lib.test_attr(frame, "Label(2)"));
    assert!(!lib.test_attr(frame, "Label(1)"));

    lib.set(frame, "Title=50%d");
    assert_eq!(lib.status(), StatusCode::BAD_VALUE);
}

#[test]
fn test_zoom_map_transforms_and_inverts() {
    let lib = LoopbackLibrary::new();
    let map = lib.new_zoom_map(2, 4.0);
    let input = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
    let mut output = [0.0; 6];

    lib.tran_n(map, 3, 2, 3, &input, true, 2, 3, &mut output);
    assert_eq!(output, [4.0, 8.0, 12.0, 40.0, 80.0, 120.0]);

    lib.invert(map);
    lib.tran_n(map, 3, 2, 3, &input, true, 2, 3, &mut output);
    assert_eq!(output, [0.25, 0.5, 0.75, 2.5, 5.0, 7.5]);
    assert!(lib.status().is_ok());
}

#[test]
fn test_tran_n_rejects_wrong_coordinate_count() {
    let lib = LoopbackLibrary::new();
    let map = lib.new_unit_map(2);
    let mut output = [0.0; 3];

    lib.tran_n(map, 1, 3, 1, &[1.0, 2.0, 3.0], true, 3, 1, &mut output);
    assert_eq!(lib.status(), StatusCode::BAD_COORDS);
}

#[test]
fn test_simplify_zoom_of_one() {
    let lib = LoopbackLibrary::new();
    let map = lib.new_zoom_map(3, 1.0);
    let simple = lib.simplify(map);

    assert_eq!(
        lib.get_attr(simple, "Class", AttrType::C),
        Some(AttrValue::C("UnitMap".into()))
    );
    assert_eq!(lib.get_attr(simple, "Nin", AttrType::I), Some(AttrValue::I(3)));
}

#[test]
fn test_intra_map_calls_registered_function() {
    let lib = LoopbackLibrary::new();
    lib.intra_reg("doubler", 1, 1, double_it, 0, "Double", "me", "here");
    let map = lib.new_intra_map("doubler", 1, 1);
    let mut output = [0.0; 3];

    lib.tran_n(map, 3, 1, 3, &[1.0, 2.0, 3.0], true, 1, 3, &mut output);
    assert_eq!(output, [2.0, 4.0, 6.0]);
    lib.tran_n(map, 3, 1, 3, &[1.0, 2.0, 3.0], false, 1, 3, &mut output);
    assert_eq!(output, [0.5, 1.0, 1.5]);
    assert!(lib.status().is_ok());
}

#[test]
fn test_intra_map_missing_direction() {
    let lib = LoopbackLibrary::new();
    lib.intra_reg("fwd-only", 1, 1, double_it, intra_flags::NO_INVERSE, "", "", "");
    let map = lib.new_intra_map("fwd-only", 1, 1);
    let mut output = [0.0; 1];

    assert_eq!(
        lib.get_attr(map, "TranInverse", AttrType::I),
        Some(AttrValue::I(0))
    );
    lib.tran_n(map, 1, 1, 1, &[1.0], false, 1, 1, &mut output);
    assert_eq!(lib.status(), StatusCode::NO_TRANSFORM);
}

#[test]
fn test_intra_map_stops_on_callback_status() {
    let lib = Arc::new(LoopbackLibrary::new());
    TRAN_LIB.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&lib)));
    lib.intra_reg("fails", 1, 1, failing_tran, 0, "", "", "");
    let map = lib.new_intra_map("fails", 1, 1);
    let mut output = [0.0; 1];

    lib.tran_n(map, 1, 1, 1, &[1.0], true, 1, 1, &mut output);
    assert_eq!(lib.status(), StatusCode::CALLBACK_FAILED);
    TRAN_LIB.with(|slot| *slot.borrow_mut() = None);
}

#[test]
fn test_channel_round_trip() {
    let lib = LoopbackLibrary::new();
    let map = lib.new_zoom_map(2, 2.5);
    lib.set(map, "Ident=scale, Invert=1");
    let channel = lib.new_channel(Some(next_line), Some(collect_line));

    LINES.with(|lines| lines.borrow_mut().clear());
    assert_eq!(lib.channel_write(channel, map), 1);
    let written = LINES.with(|lines| lines.borrow().clone());
    assert_eq!(written.first().map(String::as_str), Some("Begin ZoomMap   # Zoom about the origin"));
    assert!(written.contains(&"   Ident = \"scale\"".to_string()));
    assert_eq!(written.last().map(String::as_str), Some("End ZoomMap"));

    queue_lines(&written);
    let copy = lib.channel_read(channel);
    assert!(lib.status().is_ok());
    assert!(!copy.is_null());
    assert_eq!(lib.get_attr(copy, "Zoom", AttrType::D), Some(AttrValue::D(2.5)));
    assert_eq!(lib.get_attr(copy, "Invert", AttrType::I), Some(AttrValue::I(1)));
    assert_eq!(
        lib.get_attr(copy, "Ident", AttrType::C),
        Some(AttrValue::C("scale".into()))
    );

    // Nothing left to read
    assert!(lib.channel_read(channel).is_null());
    assert!(lib.status().is_ok());
}

#[test]
fn test_channel_read_truncated_input() {
    let lib = LoopbackLibrary::new();
    let channel = lib.new_channel(Some(next_line), None);

    queue_lines(&["Begin Frame".to_string(), "   Naxes = 2".to_string()]);
    assert!(lib.channel_read(channel).is_null());
    assert_eq!(lib.status(), StatusCode::READ_ERROR);
}

#[test]
fn test_plot_lock_covers_frame() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(2);
    let plot = lib.new_plot(frame, &[0.0, 0.0, 100.0, 100.0], &[0.0, 0.0, 1.0, 1.0]);
    let inner = lib.get_frame(plot, 1);
    assert!(lib.status().is_ok());

    lib.unlock(inner);
    assert!(lib.is_locked_by_current_thread(inner));
    lib.unlock(plot);
    assert!(!lib.is_locked_by_current_thread(inner));

    lib.lock(plot, false);
    assert!(lib.is_locked_by_current_thread(inner));
}

#[test]
fn test_plot_without_grf_fails() {
    let lib = LoopbackLibrary::new();
    let frame = lib.new_frame(2);
    let plot = lib.new_plot(frame, &[0.0, 0.0, 10.0, 10.0], &[0.0, 0.0, 1.0, 1.0]);

    assert!(!lib.plot_border(plot));
    assert_eq!(lib.status(), StatusCode::GRAPHICS_ERROR);
}
