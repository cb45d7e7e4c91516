//! Load and unload hooks.
//!
//! Registered through `.init_array` / `.fini_array` so the trace header is
//! written before `main` and the footer after every `atexit` handler.

use logmalloc_core::AttachOptions;

use crate::tracker;

extern "C" fn logmalloc_attach() {
    let t = tracker();
    t.attach(AttachOptions::from_env());
    t.warm_up();
}

extern "C" fn logmalloc_detach() {
    tracker().detach();
}

#[used]
#[unsafe(link_section = ".init_array")]
static ATTACH_HOOK: extern "C" fn() = logmalloc_attach;

#[used]
#[unsafe(link_section = ".fini_array")]
static DETACH_HOOK: extern "C" fn() = logmalloc_detach;
