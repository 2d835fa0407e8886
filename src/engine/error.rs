//! Opaque step error codes (spec.md §7) and the small set of codes the
//! engine itself raises.

use std::{fmt, rc::Rc};

/// An opaque, short error code (spec.md: "≤ 32 bytes in the fixed-storage
/// variant"). Cheap to clone since it is reference counted, matching the
/// way the teacher passes `Arc<str>`-ish identifiers (e.g. bdev names)
/// around its core types.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode(Rc<str>);

impl ErrorCode {
    pub fn new(s: impl AsRef<str>) -> Self {
        ErrorCode(Rc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::new(s)
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        ErrorCode::new(s)
    }
}

/// Reserved literal error codes (spec.md §6). Plain `&'static str` rather
/// than pre-built `ErrorCode`s: `ErrorCode` wraps an `Rc<str>`, which is not
/// `Sync`, so it cannot live behind a `static`.
pub mod codes {
    macro_rules! reserved {
        ($name:ident, $lit:expr) => {
            pub const $name: &str = $lit;
        };
    }

    reserved!(TIMEOUT, "Timeout");
    reserved!(LOOP_BREAK, "LoopBreak");
    reserved!(LOOP_CONT, "LoopCont");
    reserved!(DEFENSE_REJECTED, "DefenseRejected");
    reserved!(INVALID_ARGUMENT, "InvalidArgument");
}

/// The outcome of a step body invocation, decided by which terminal method
/// (if any) it called before returning.
pub(crate) enum StepOutcome {
    Success(Vec<Rc<dyn std::any::Any>>),
    Error(ErrorCode, Option<Rc<dyn std::any::Any>>),
}
