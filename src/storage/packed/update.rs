/// Outcome of a prepare step.
///
/// `Ready` carries whatever the matching commit needs. The other variants
/// describe why the change cannot be applied to the node as it is: it needs
/// `extra` more bytes (the node can grow), or it exceeds what the node could
/// hold even at its maximum size (the node must split).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared<S> {
    /// The change fits; commit with the carried state.
    Ready(S),
    /// The change fits once the block grows by at least `extra` bytes.
    NeedsSpace {
        /// Bytes of additional layout capacity required.
        extra: usize,
    },
    /// The node cannot absorb the change at any allowed size.
    Full,
}

impl<S> Prepared<S> {
    /// Returns true for [`Prepared::Ready`].
    pub fn is_ready(&self) -> bool {
        matches!(self, Prepared::Ready(_))
    }

    /// Maps the ready state, keeping the other outcomes.
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Prepared<T> {
        match self {
            Prepared::Ready(state) => Prepared::Ready(f(state)),
            Prepared::NeedsSpace { extra } => Prepared::NeedsSpace { extra },
            Prepared::Full => Prepared::Full,
        }
    }

    /// Returns the ready state, if any.
    pub fn ready(self) -> Option<S> {
        match self {
            Prepared::Ready(state) => Some(state),
            _ => None,
        }
    }
}
