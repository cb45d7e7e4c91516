//! Usage savepoints for leak checks around a region of code.
//!
//! ```ignore
//! let sp = Savepoint::save(tracker, "request");
//! handle_request();
//! sp.assert_unchanged()?;
//! ```

use std::fmt;

use crate::error::TraceError;
use crate::resolver::RealAllocator;
use crate::sink::TraceSink;
use crate::stack::StackCapturer;
use crate::tracker::Tracker;

/// Source of the current usage figure, plus a place to note results.
pub trait UsageProbe {
    fn usage(&self) -> usize;

    /// Record a line in the trace. Failures are ignored.
    fn note(&self, args: fmt::Arguments<'_>);
}

impl<A: RealAllocator, S: TraceSink, C: StackCapturer> UsageProbe for Tracker<A, S, C> {
    fn usage(&self) -> usize {
        Tracker::usage(self)
    }

    fn note(&self, args: fmt::Arguments<'_>) {
        let _ = self.trace_fmt(args);
    }
}

/// Requested-bytes usage captured at a named point.
pub struct Savepoint<'a, P: ?Sized> {
    probe: &'a P,
    name: &'static str,
    saved: usize,
}

impl<'a, P: UsageProbe + ?Sized> Savepoint<'a, P> {
    /// Record current usage and note `# SP <name> saved=<n>`.
    pub fn save(probe: &'a P, name: &'static str) -> Self {
        let saved = probe.usage();
        probe.note(format_args!("# SP {name} saved={saved}"));
        Self { probe, name, saved }
    }

    /// Re-record current usage.
    pub fn update(&mut self) {
        self.saved = self.probe.usage();
    }

    #[must_use]
    pub fn saved(&self) -> usize {
        self.saved
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signed change since the save, noted as `# SP-COMPARE`.
    pub fn compare(&self) -> isize {
        let actual = self.probe.usage();
        let diff = actual.wrapping_sub(self.saved) as isize;
        self.probe.note(format_args!(
            "# SP-COMPARE {} expected={} actual={actual} diff={diff}",
            self.name, self.saved
        ));
        diff
    }

    /// `Err(UsageChanged)` unless usage is back to the saved figure.
    pub fn assert_unchanged(&self) -> Result<(), TraceError> {
        if self.compare() == 0 {
            return Ok(());
        }
        Err(TraceError::UsageChanged {
            name: self.name,
            expected: self.saved,
            actual: self.probe.usage(),
        })
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::resolver::LibcAllocator;
    use crate::sink::MemorySink;
    use crate::stack::NoFrames;
    use std::cell::{Cell, RefCell};

    struct Fixed {
        usage: Cell<usize>,
        notes: RefCell<Vec<String>>,
    }

    impl UsageProbe for Fixed {
        fn usage(&self) -> usize {
            self.usage.get()
        }

        fn note(&self, args: fmt::Arguments<'_>) {
            self.notes.borrow_mut().push(args.to_string());
        }
    }

    fn fixed(usage: usize) -> Fixed {
        Fixed {
            usage: Cell::new(usage),
            notes: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn compare_reports_signed_delta() {
        let probe = fixed(100);
        let sp = Savepoint::save(&probe, "loop");
        probe.usage.set(60);
        assert_eq!(sp.compare(), -40);
        probe.usage.set(130);
        assert_eq!(sp.compare(), 30);
        assert_eq!(
            probe.notes.borrow().as_slice(),
            [
                "# SP loop saved=100",
                "# SP-COMPARE loop expected=100 actual=60 diff=-40",
                "# SP-COMPARE loop expected=100 actual=130 diff=30",
            ]
        );
    }

    #[test]
    fn update_moves_the_baseline() {
        let probe = fixed(5);
        let mut sp = Savepoint::save(&probe, "x");
        probe.usage.set(9);
        sp.update();
        assert_eq!(sp.saved(), 9);
        assert_eq!(sp.compare(), 0);
    }

    #[test]
    fn assert_unchanged_names_the_savepoint() {
        let probe = fixed(10);
        let sp = Savepoint::save(&probe, "loop");
        assert_eq!(sp.assert_unchanged(), Ok(()));
        probe.usage.set(12);
        let err = sp.assert_unchanged().unwrap_err();
        assert_eq!(
            err,
            TraceError::UsageChanged {
                name: "loop",
                expected: 10,
                actual: 12
            }
        );
    }

    #[test]
    fn tracker_savepoint_catches_a_leak() {
        let t = Tracker::new(LibcAllocator, MemorySink::new(), NoFrames);
        let sp = Savepoint::save(&t, "work");
        let kept = t.allocate(48);
        let dropped = t.allocate(16);
        unsafe { t.release(dropped) };
        assert!(sp.assert_unchanged().is_err());
        unsafe { t.release(kept) };
        assert!(sp.assert_unchanged().is_ok());
        let lines = t.sink().lines();
        assert_eq!(lines[0], "# SP work saved=0");
        assert!(lines.contains(&"# SP-COMPARE work expected=0 actual=48 diff=48".to_owned()));
    }
}
