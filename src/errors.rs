//! Error types shared across the crate.
//!
//! Each concern keeps its own enum next to its code
//! ([`crate::batch::PartitionError`], [`crate::store::StoreError`],
//! ...). [`FixError`] is the umbrella returned by
//! [`crate::run::run_fix`] for anything that stops a run before a
//! worker is launched.

use std::any::Any;
use std::panic::Location;

use thiserror::Error;

use crate::batch::ChunkError;
use crate::batch::PartitionError;
use crate::config::ConfigError;
use crate::journal::JournalError;
use crate::store::StoreError;

/// Anything that prevents a run from starting.
///
/// Once workers are running, nothing is raised: failures end up in
/// the [`crate::report::RunReport`] instead.
#[derive(Error, Debug)]
pub enum FixError {
    #[error("invalid partitioning: {0}")]
    Partition(#[from] PartitionError),
    #[error("unable to chunk ids: {0}")]
    Chunk(#[from] ChunkError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("error planning run: {0}")]
    Plan(#[from] StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

/// Render a panic payload caught by [`std::panic::catch_unwind`].
///
/// Panics carry either a `String` (from `panic!("{x}")`), a `&str`
/// (from `panic!("literal")` and `.expect`) or something we can't
/// look inside.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Prepend '({caller}) ' to the message.
#[track_caller]
pub(crate) fn tracked_msg(msg: &str) -> String {
    let caller = Location::caller();
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn panic_message_downcasts() {
    let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "boom 1");

    let payload = std::panic::catch_unwind(|| panic!("literal")).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "literal");

    let payload = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let found = std::thread::Builder::new()
        .name("sackfix-worker-3".to_string())
        .spawn(|| prepend_tname("first\nsecond".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<sackfix-worker-3> first\n<sackfix-worker-3> second\n");
}

#[test]
fn tracked_msg_includes_location() {
    let msg = tracked_msg("lost connection");
    assert!(msg.starts_with("(src/errors.rs:"));
    assert!(msg.ends_with(") lost connection"));
}
