//! Process-wide default high-water marks.
//!
//! Kept in its own test binary because it mutates global state.

use otter_streams::{
    EventLoop, Readable, ReadableOptions, Writable, WritableOptions, default_high_water_mark,
    set_default_high_water_mark,
};

#[test]
fn test_defaults_apply_to_new_streams() {
    assert_eq!(default_high_water_mark(false), 16 * 1024);
    assert_eq!(default_high_water_mark(true), 16);

    set_default_high_water_mark(false, 1024);
    set_default_high_water_mark(true, 4);

    let event_loop = EventLoop::new();
    let bytes = Readable::new(&event_loop, ReadableOptions::new().read(|_, _| Ok(())));
    let objects = Writable::new(
        &event_loop,
        WritableOptions::new()
            .object_mode(true)
            .write(|_, _, _, cb| cb(None)),
    );
    let explicit = Readable::new(
        &event_loop,
        ReadableOptions::new().high_water_mark(7).read(|_, _| Ok(())),
    );

    assert_eq!(bytes.readable_high_water_mark(), 1024);
    assert_eq!(objects.writable_high_water_mark(), 4);
    assert_eq!(explicit.readable_high_water_mark(), 7);

    set_default_high_water_mark(false, 16 * 1024);
    set_default_high_water_mark(true, 16);
}
