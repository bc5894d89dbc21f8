use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A one-way cancellation flag shared between the caller and a session.
///
/// The flag only ever goes from unset to set. Sessions read it at their poll
/// checkpoints and never clear it, so a set flag bounds every wait loop to one
/// more poll interval.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());

        flag.cancel();
        assert!(observer.is_cancelled());

        // Setting it again keeps it set.
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
