//! Merging of per-machine partial views into one consolidated state.
//!
//! Each reconciler pairs an async fan-out (ask every relevant machine,
//! concurrently, dropping machines that fail) with a pure merge function
//! that folds the successful reports into a deep copy of the previously
//! stored state. The merge functions are pure on purpose: they carry all of
//! the edge-case semantics and are tested directly.

pub mod deployment;
pub mod instance;
pub mod user_tasks;

/// Appends entries from `incoming` to `stored` unless an entry with the same
/// identity key is already present. Machines are polled repeatedly and
/// forwarded instances carry history that also exists on the original
/// engine, so duplicates are the norm rather than the exception.
fn merge_unique_by<T, K>(stored: &mut Vec<T>, incoming: impl IntoIterator<Item = T>, key: impl Fn(&T) -> K)
where
    K: PartialEq,
{
    for entry in incoming {
        let entry_key = key(&entry);
        if !stored.iter().any(|existing| key(existing) == entry_key) {
            stored.push(entry);
        }
    }
}
