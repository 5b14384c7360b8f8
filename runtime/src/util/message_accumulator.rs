// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::RefCell;
use std::rc::Rc;

/// Accumulates a sequence of messages (e.g. validation failures).
#[derive(Default, Clone)]
pub struct MessageAccumulator {
    /// Accumulated messages.
    /// This is a `Rc<RefCell>` to support accumulators derived from `with_prefix()` accumulating to
    /// the same underlying collection.
    msgs: Rc<RefCell<Vec<String>>>,
    /// Optional prefix to all new messages, e.g. describing higher level context.
    prefix: String,
}

impl MessageAccumulator {
    /// Returns a new accumulator backed by the same collection, that will prefix each new message with
    /// a formatted string.
    pub fn with_prefix<S: AsRef<str>>(&self, prefix: S) -> Self {
        MessageAccumulator {
            msgs: self.msgs.clone(),
            prefix: self.prefix.to_owned() + prefix.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.borrow().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.msgs.borrow().to_owned()
    }

    /// Adds a message to the accumulator.
    pub fn add<S: AsRef<str>>(&self, msg: S) {
        self.msgs.borrow_mut().push(format!("{}{}", self.prefix, msg.as_ref()));
    }

    /// Adds a message to the accumulator if predicate is false.
    pub fn require<S: AsRef<str>>(&self, predicate: bool, msg: S) {
        if !predicate {
            self.add(msg);
        }
    }

    /// Adds a message to the accumulator if the result is an error.
    pub fn require_no_error<V, E: std::fmt::Display, S: AsRef<str>>(
        &self,
        result: Result<V, E>,
        msg: S,
    ) {
        if let Err(e) = result {
            self.add(format!("{}: {}", msg.as_ref(), e));
        }
    }

    /// Panics if the accumulator is non-empty, printing everything accumulated.
    pub fn assert_empty(&self) {
        assert!(self.is_empty(), "{}", self.messages().join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_compose() {
        let acc = MessageAccumulator::default();
        let sub = acc.with_prefix("deadline 3: ").with_prefix("partition 1: ");

        sub.require(false, "wrong power");
        acc.add("top-level");

        assert_eq!(
            vec!["deadline 3: partition 1: wrong power".to_string(), "top-level".to_string()],
            acc.messages()
        );
        assert!(!acc.is_empty());
    }
}
