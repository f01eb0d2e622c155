// Shared Rust library
pub mod dht_messages;
pub mod id_space;
pub mod monitor;

pub use dht_messages::{DhtMessage, Envelope, LockId, NodeId, NodeInfo};
pub use id_space::{IdSpace, IdSpaceError};

// Checks if an ID lies on the clockwise arc from `lower` to `upper`, both ends excluded
// unless `inclusive_upper` is set, in which case `upper` itself is part of the arc.
//
// When `lower == upper` the arc wraps the whole circle: `(x, x]` contains every id and
// `(x, x)` every id except `x`.
pub fn is_between(id: NodeId, lower: NodeId, upper: NodeId, inclusive_upper: bool) -> bool {
    if lower == upper {
        return inclusive_upper || id != lower;
    }
    let inside = if lower < upper {
        lower < id && id < upper
    } else {
        // Wraps around (lower > upper)
        lower < id || id < upper
    };
    inside || (inclusive_upper && id == upper)
}
