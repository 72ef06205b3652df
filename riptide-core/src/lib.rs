#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    // elided_lifetimes_in_paths, // allow anonymous lifetime
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    // trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    // unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    clippy::all,
    clippy::pedantic,
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
    clippy::single_char_lifetime_names,
)]

//! A single-threaded-reactor networking core. Each [`event_loop::EventLoop`]
//! multiplexes socket readiness and timers on exactly one OS thread; other
//! threads reach a loop only through its [`event_loop::LoopHandle`].
//!
//! Linux only: readiness comes from level-triggered `epoll`, cross-thread
//! wake-ups from an `eventfd` and timer deadlines from a `timerfd`.

#[allow(missing_docs)]
pub mod log;

/// Growable byte container with a reserved prepend region, used for socket
/// read/write staging.
pub mod buffer;

/// Per-descriptor event registration abstraction and dispatch.
pub mod channel;

/// TCP connection state machine riding on a loop, a channel and two buffers.
pub mod connection;

/// Event loop abstraction and impl.
pub mod event_loop;

/// A thread driving exactly one event loop.
pub mod event_loop_thread;

/// Round-robin/hashed assignment of work to a set of loop threads.
pub mod event_loop_thread_pool;

/// Readiness poller abstraction and impl.
pub mod poller;

/// The thin socket/descriptor syscall surface the core consumes.
pub mod sys;

/// Timer queue abstraction and impl.
pub mod timer;
