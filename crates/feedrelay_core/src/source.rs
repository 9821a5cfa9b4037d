//! Source abstraction for the change feed.
//!
//! The source owns the subscription transport and cursor; the relay only
//! consumes position-ordered events through [`ChangeStream`].

use crate::error::RelayResult;
use crate::event::ChangeEvent;
use async_trait::async_trait;
use feedrelay_checkpoint::SourcePosition;

/// Options for opening a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Resume strictly after this position. `None` means "from now": only
    /// events emitted after the subscription opens are delivered.
    pub resume_after: Option<SourcePosition>,
    /// Ask the source to look up the current full document for updates.
    pub lookup_full_document: bool,
}

impl WatchOptions {
    /// Options for a subscription that starts from now.
    pub fn from_now() -> Self {
        Self::default()
    }

    /// Resumes after `position` when given.
    #[must_use]
    pub fn with_resume_after(mut self, position: Option<SourcePosition>) -> Self {
        self.resume_after = position;
        self
    }

    /// Requests update lookup.
    #[must_use]
    pub fn with_full_document_lookup(mut self, lookup: bool) -> Self {
        self.lookup_full_document = lookup;
        self
    }
}

/// A data source exposing a resumable change feed on one collection.
///
/// Implementations must be safe to reuse: after `close`, a later `connect`
/// followed by `watch` opens a fresh subscription.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Establishes the source connection.
    async fn connect(&self) -> RelayResult<()>;

    /// Opens a subscription.
    ///
    /// Events are delivered in source order, starting strictly after
    /// `options.resume_after` when set.
    async fn watch(&self, options: WatchOptions) -> RelayResult<Box<dyn ChangeStream>>;

    /// Releases the source connection. Idempotent.
    async fn close(&self) -> RelayResult<()>;
}

/// An open, position-ordered subscription.
#[async_trait]
pub trait ChangeStream: Send {
    /// Waits for the next event.
    ///
    /// Returns `None` when the source ended the subscription and `Some(Err)`
    /// when it failed; both are terminal.
    async fn next_event(&mut self) -> Option<RelayResult<ChangeEvent>>;

    /// Closes the subscription. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_options_builders() {
        let options = WatchOptions::from_now();
        assert!(options.resume_after.is_none());
        assert!(!options.lookup_full_document);

        let options = WatchOptions::from_now()
            .with_resume_after(Some(SourcePosition::new("0a")))
            .with_full_document_lookup(true);
        assert_eq!(options.resume_after, Some(SourcePosition::new("0a")));
        assert!(options.lookup_full_document);
    }

    #[test]
    fn traits_are_object_safe() {
        fn _source(_: &dyn ChangeSource) {}
        fn _stream(_: &mut dyn ChangeStream) {}
    }
}
