/// A value changed locally before the server confirms it.
///
/// `apply` shows the new value right away, `confirm` keeps it and
/// `rollback` returns to the last confirmed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimistic<T: Clone> {
    confirmed: T,
    pending: Option<T>,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(value: T) -> Self {
        Self {
            confirmed: value,
            pending: None,
        }
    }

    /// What the UI should show.
    pub fn current(&self) -> &T {
        self.pending.as_ref().unwrap_or(&self.confirmed)
    }

    pub fn apply(&mut self, value: T) {
        self.pending = Some(value);
    }

    pub fn confirm(&mut self) {
        if let Some(value) = self.pending.take() {
            self.confirmed = value;
        }
    }

    pub fn rollback(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
