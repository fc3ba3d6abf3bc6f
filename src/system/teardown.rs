//! Ordered release of everything a run acquired.
//!
//! Every terminal path (success, exhaustion, interrupt) runs the same
//! [`Teardown`]. Items run in reverse registration order, exactly once, and
//! a panicking item does not keep the rest from running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

/// Something to release on teardown.
pub trait Release: Send {
    fn release(self: Box<Self>);
}

impl<F: FnOnce() + Send> Release for F {
    fn release(self: Box<Self>) {
        (*self)()
    }
}

#[derive(Default)]
pub struct Teardown {
    items: Mutex<Vec<(String, Box<dyn Release>)>>,
    done: Mutex<bool>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` under `name`. Items registered after the teardown
    /// ran are released immediately.
    pub fn register(&self, name: impl Into<String>, item: impl Release + 'static) {
        let name = name.into();
        let done = *self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if done {
            log::debug!("[system] late release: {name}");
            Box::new(item).release();
            return;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, Box::new(item)));
    }

    pub fn pending(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Release everything. Later calls do nothing.
    pub fn run(&self) {
        {
            let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
            if *done {
                return;
            }
            *done = true;
        }
        let items: Vec<_> = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        log::info!("[system] teardown ({} items)", items.len());
        for (name, item) in items.into_iter().rev() {
            log::debug!("[system] releasing {name}");
            if catch_unwind(AssertUnwindSafe(|| item.release())).is_err() {
                log::error!("[system] releasing {name} panicked");
            }
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct Push(Journal, &'static str);

    impl Release for Push {
        fn release(self: Box<Self>) {
            self.0.lock().unwrap().push(self.1);
        }
    }

    #[test]
    fn releases_in_reverse_order_once() {
        let journal = Journal::default();
        let teardown = Teardown::new();
        teardown.register("lease", Push(journal.clone(), "lease"));
        teardown.register("leds", Push(journal.clone(), "leds"));
        teardown.register("tool", Push(journal.clone(), "tool"));
        assert_eq!(teardown.pending(), 3);

        teardown.run();
        teardown.run();

        assert_eq!(*journal.lock().unwrap(), vec!["tool", "leds", "lease"]);
        assert_eq!(teardown.pending(), 0);
    }

    #[test]
    fn closures_and_panics() {
        let journal = Journal::default();
        let sink = journal.clone();
        let teardown = Teardown::new();
        teardown.register("first", move || sink.lock().unwrap().push("first"));
        teardown.register("boom", || {
            panic!("release failed");
        });
        teardown.run();
        assert_eq!(*journal.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn drop_runs_teardown() {
        let journal = Journal::default();
        {
            let teardown = Teardown::new();
            teardown.register("speaker", Push(journal.clone(), "speaker"));
        }
        assert_eq!(*journal.lock().unwrap(), vec!["speaker"]);
    }

    #[test]
    fn late_registration_releases_immediately() {
        let journal = Journal::default();
        let teardown = Teardown::new();
        teardown.run();
        teardown.register("late", Push(journal.clone(), "late"));
        assert_eq!(*journal.lock().unwrap(), vec!["late"]);
    }
}
