//! Server-side named cursors.
//!
//! A named cursor binds a query to a server portal and pulls its rows in
//! batches, so a large result never has to fit in memory. The portal lives
//! until it is closed or, unless declared `with hold`, until the transaction
//! ends.
//!
//! [`NamedCursor`] blocks the calling thread, [`AsyncNamedCursor`] suspends
//! the task. Both drive the same [state machine][state] and take the
//! connection lock once per call.
use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{Error, Result, common::general};

mod state;
mod blocking;
mod nonblocking;

pub use blocking::{Iter, NamedCursor};
pub use nonblocking::{AsyncNamedCursor, RowStream};

/// Lifecycle of a named cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No server portal is bound yet.
    Unbound,
    /// The portal exists, its columns are not known yet.
    Declared,
    /// The portal exists and its columns are known.
    Described,
    /// Terminal.
    Closed,
}

/// How [`scroll`][NamedCursor::scroll] interprets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    /// Move by a signed number of rows from the current position.
    Relative,
    /// Move to a row number, negative values count from the end.
    Absolute,
}

impl FromStr for ScrollMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relative" => Ok(ScrollMode::Relative),
            "absolute" => Ok(ScrollMode::Absolute),
            _ => Err(Error::invalid_argument(general!(
                "bad scroll mode `{s}`, expected `relative` or `absolute`"
            ))),
        }
    }
}

/// Type which can be used as a [`ScrollMode`].
pub trait IntoScrollMode {
    fn into_scroll_mode(self) -> Result<ScrollMode>;
}

impl IntoScrollMode for ScrollMode {
    fn into_scroll_mode(self) -> Result<ScrollMode> {
        Ok(self)
    }
}

impl IntoScrollMode for &str {
    fn into_scroll_mode(self) -> Result<ScrollMode> {
        self.parse()
    }
}

/// Options of the `declare` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclareOptions {
    /// Allow moving backward, `[no] scroll`.
    pub scrollable: bool,
    /// Keep the portal after the transaction commits, `with hold`.
    pub hold: bool,
}

impl Default for DeclareOptions {
    fn default() -> Self {
        Self { scrollable: true, hold: false }
    }
}

impl DeclareOptions {
    pub fn scrollable(mut self, scrollable: bool) -> Self {
        self.scrollable = scrollable;
        self
    }

    pub fn hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }
}

static CURSOR_ID: AtomicU64 = AtomicU64::new(0);

/// Returns a cursor name unique within the process.
pub(crate) fn unique_name() -> String {
    let id = CURSOR_ID.fetch_add(1, Ordering::Relaxed) + 1;
    let mut buf = itoa::Buffer::new();
    let mut name = String::from("porta_cursor_");
    name.push_str(buf.format(id));
    name
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn scroll_mode() {
        assert_eq!("relative".into_scroll_mode().unwrap(), ScrollMode::Relative);
        assert_eq!("absolute".into_scroll_mode().unwrap(), ScrollMode::Absolute);
        let err = "wat".into_scroll_mode().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
        assert!(err.to_string().contains("wat"));
    }

    #[test]
    fn unique_names() {
        let a = unique_name();
        let b = unique_name();
        assert!(a.starts_with("porta_cursor_"));
        assert_ne!(a, b);
    }

    #[test]
    fn declare_options() {
        let opt = DeclareOptions::default();
        assert!(opt.scrollable && !opt.hold);
        let opt = opt.scrollable(false).hold(true);
        assert!(!opt.scrollable && opt.hold);
    }
}
